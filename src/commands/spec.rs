//! Package spec parsing: `ecosystem:name@version`.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};

const SPEC_FORMAT: &str =
    "Invalid format. Use: ecosystem:name@version (e.g., npm:axios@1.7.9)";

/// A package coordinate as typed on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub ecosystem: String,
    pub name: String,
    pub version: String,
}

impl FromStr for PackageSpec {
    type Err = anyhow::Error;

    fn from_str(spec: &str) -> Result<Self> {
        let (ecosystem, rest) = spec.split_once(':').context(SPEC_FORMAT)?;
        let (name, version) = rest.rsplit_once('@').context(SPEC_FORMAT)?;

        if ecosystem.is_empty() || name.is_empty() || version.is_empty() {
            anyhow::bail!(SPEC_FORMAT);
        }

        Ok(Self {
            ecosystem: ecosystem.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        })
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.ecosystem, self.name, self.version)
    }
}
