use serde::{Deserialize, Serialize};

/// Package ecosystems known to the resolver.
///
/// Identifiers follow PURL types (`npm`, `cargo`, `golang`, ...). Parsing
/// also accepts a few common aliases (`crates`, `go`, `rubygems`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Npm,
    Cargo,
    Gem,
    Golang,
    Hex,
    Pub,
    Maven,
    Nuget,
    Pypi,
}

impl Ecosystem {
    pub const ALL: [Ecosystem; 9] = [
        Ecosystem::Npm,
        Ecosystem::Cargo,
        Ecosystem::Gem,
        Ecosystem::Golang,
        Ecosystem::Hex,
        Ecosystem::Pub,
        Ecosystem::Maven,
        Ecosystem::Nuget,
        Ecosystem::Pypi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Ecosystem::Npm => "npm",
            Ecosystem::Cargo => "cargo",
            Ecosystem::Gem => "gem",
            Ecosystem::Golang => "golang",
            Ecosystem::Hex => "hex",
            Ecosystem::Pub => "pub",
            Ecosystem::Maven => "maven",
            Ecosystem::Nuget => "nuget",
            Ecosystem::Pypi => "pypi",
        }
    }

    /// Whether artifacts can be located from name and version alone,
    /// without asking the registry for metadata.
    pub fn has_static_download(&self) -> bool {
        !matches!(self, Ecosystem::Pypi)
    }
}

impl std::fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Ecosystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "npm" => Ok(Ecosystem::Npm),
            "cargo" | "crates" => Ok(Ecosystem::Cargo),
            "gem" | "rubygems" => Ok(Ecosystem::Gem),
            "golang" | "go" => Ok(Ecosystem::Golang),
            "hex" => Ok(Ecosystem::Hex),
            "pub" => Ok(Ecosystem::Pub),
            "maven" => Ok(Ecosystem::Maven),
            "nuget" => Ok(Ecosystem::Nuget),
            "pypi" => Ok(Ecosystem::Pypi),
            _ => Err(format!("unknown ecosystem: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical_names() {
        for eco in Ecosystem::ALL {
            assert_eq!(eco.as_str().parse::<Ecosystem>().unwrap(), eco);
        }
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("go".parse::<Ecosystem>().unwrap(), Ecosystem::Golang);
        assert_eq!("crates".parse::<Ecosystem>().unwrap(), Ecosystem::Cargo);
        assert_eq!("RubyGems".parse::<Ecosystem>().unwrap(), Ecosystem::Gem);
        assert!("unknown".parse::<Ecosystem>().is_err());
    }

    #[test]
    fn test_static_download() {
        assert!(Ecosystem::Npm.has_static_download());
        assert!(!Ecosystem::Pypi.has_static_download());
    }
}
