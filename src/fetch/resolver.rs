//! Package coordinate -> artifact download location.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::artifact::{ArtifactInfo, filename_from_url};
use super::error::ResolveError;
use crate::registry::{
    Registries, Registry, RegistryError, escape_module_path, module_basename,
};
use crate::types::Ecosystem;

/// Determines download URLs for package artifacts.
///
/// Registered registries are asked first. Ecosystems with predictable
/// artifact URLs resolve without one.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    registries: Registries,
}

impl Resolver {
    pub fn new(registries: Registries) -> Self {
        Self { registries }
    }

    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    /// Resolve the artifact for `name@version` in `ecosystem`.
    ///
    /// `ecosystem` accepts the aliases [`Ecosystem`] parses (`go`, `crates`,
    /// `rubygems`) as well as any identifier with a registered registry.
    pub async fn resolve(
        &self,
        ecosystem: &str,
        name: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<ArtifactInfo, ResolveError> {
        let known = ecosystem.parse::<Ecosystem>().ok();
        let key = known.map(|e| e.as_str()).unwrap_or(ecosystem);
        let coordinate = Coordinate {
            ecosystem: key,
            name,
            version,
        };

        if name.trim().is_empty() {
            return Err(coordinate.invalid("package name is empty"));
        }
        if version.trim().is_empty() {
            return Err(coordinate.invalid("version is empty"));
        }
        if cancel.is_cancelled() {
            return Err(coordinate.cancelled());
        }

        if let Some(registry) = self.registries.get(key) {
            return self
                .resolve_with_registry(registry.as_ref(), &coordinate, cancel)
                .await;
        }

        match known {
            Some(eco) => static_artifact(eco, &coordinate),
            None => Err(ResolveError::UnsupportedEcosystem(ecosystem.to_string())),
        }
    }

    async fn resolve_with_registry(
        &self,
        registry: &dyn Registry,
        coordinate: &Coordinate<'_>,
        cancel: &CancellationToken,
    ) -> Result<ArtifactInfo, ResolveError> {
        let Coordinate { name, version, .. } = *coordinate;

        // Deterministic URL, no metadata round trip.
        if let Some(url) = registry
            .urls()
            .download(name, version)
            .filter(|u| !u.is_empty())
        {
            debug!(ecosystem = coordinate.ecosystem, package = name, version, url = %url, "resolved from url template");
            let filename = coordinate.filename_for(&url);
            return Ok(ArtifactInfo::with_filename(url, filename));
        }

        debug!(ecosystem = coordinate.ecosystem, package = name, version, "resolving from version metadata");
        let versions = registry
            .fetch_versions(name, cancel)
            .await
            .map_err(|e| coordinate.registry_error(e))?;

        let found = versions
            .into_iter()
            .find(|v| v.number == version)
            .ok_or_else(|| coordinate.not_found())?;

        let url = found
            .metadata_str("download_url")
            .or_else(|| found.metadata_str("tarball"))
            .ok_or_else(|| coordinate.no_download_url())?;

        let filename = found
            .metadata_str("filename")
            .map(str::to_string)
            .unwrap_or_else(|| coordinate.filename_for(url));

        Ok(ArtifactInfo::with_filename(url, filename).integrity(found.integrity.clone()))
    }
}

/// The coordinate being resolved, for error construction.
#[derive(Clone, Copy)]
struct Coordinate<'a> {
    ecosystem: &'a str,
    name: &'a str,
    version: &'a str,
}

impl Coordinate<'_> {
    /// Go proxy zips are all named `<version>.zip`, so name them after the module.
    fn filename_for(&self, url: &str) -> String {
        if self.ecosystem == Ecosystem::Golang.as_str() {
            go_filename(self.name, self.version)
        } else {
            filename_from_url(url)
        }
    }

    fn not_found(&self) -> ResolveError {
        ResolveError::NotFound {
            ecosystem: self.ecosystem.to_string(),
            name: self.name.to_string(),
            version: self.version.to_string(),
        }
    }

    fn no_download_url(&self) -> ResolveError {
        ResolveError::NoDownloadUrl {
            ecosystem: self.ecosystem.to_string(),
            name: self.name.to_string(),
            version: self.version.to_string(),
        }
    }

    fn cancelled(&self) -> ResolveError {
        ResolveError::Cancelled {
            ecosystem: self.ecosystem.to_string(),
            name: self.name.to_string(),
            version: self.version.to_string(),
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> ResolveError {
        ResolveError::InvalidName {
            ecosystem: self.ecosystem.to_string(),
            name: self.name.to_string(),
            reason: reason.into(),
        }
    }

    fn registry_error(&self, err: RegistryError) -> ResolveError {
        match err {
            e if e.is_not_found() => self.not_found(),
            RegistryError::Cancelled { .. } => self.cancelled(),
            RegistryError::InvalidPackage(reason) => self.invalid(reason),
            e => ResolveError::Registry(e),
        }
    }
}

fn go_filename(module: &str, version: &str) -> String {
    format!("{}@{}.zip", module_basename(module), version)
}

/// Artifact URL for ecosystems whose layout is fixed.
fn static_artifact(eco: Ecosystem, c: &Coordinate<'_>) -> Result<ArtifactInfo, ResolveError> {
    let (name, version) = (c.name, c.version);

    let (url, filename) = match eco {
        Ecosystem::Npm => {
            let short = name.rsplit('/').next().unwrap_or(name);
            (
                format!("https://registry.npmjs.org/{}/-/{}-{}.tgz", name, short, version),
                format!("{}-{}.tgz", short, version),
            )
        }
        Ecosystem::Cargo => (
            format!("https://static.crates.io/crates/{}/{}-{}.crate", name, name, version),
            format!("{}-{}.crate", name, version),
        ),
        Ecosystem::Gem => (
            format!("https://rubygems.org/downloads/{}-{}.gem", name, version),
            format!("{}-{}.gem", name, version),
        ),
        Ecosystem::Golang => (
            format!(
                "https://proxy.golang.org/{}/@v/{}.zip",
                escape_module_path(name),
                version
            ),
            go_filename(name, version),
        ),
        Ecosystem::Hex => (
            format!("https://repo.hex.pm/tarballs/{}-{}.tar", name, version),
            format!("{}-{}.tar", name, version),
        ),
        Ecosystem::Pub => (
            format!("https://pub.dev/packages/{}/versions/{}.tar.gz", name, version),
            format!("{}-{}.tar.gz", name, version),
        ),
        Ecosystem::Maven => {
            let (group, artifact) = name
                .split_once(':')
                .filter(|(g, a)| !g.is_empty() && !a.is_empty())
                .ok_or_else(|| c.invalid("expected group:artifact"))?;
            (
                format!(
                    "https://repo1.maven.org/maven2/{}/{}/{}/{}-{}.jar",
                    group.replace('.', "/"),
                    artifact,
                    version,
                    artifact,
                    version
                ),
                format!("{}-{}.jar", artifact, version),
            )
        }
        Ecosystem::Nuget => {
            // Package IDs are case-insensitive; the flat container wants lowercase.
            let lower = name.to_lowercase();
            (
                format!(
                    "https://api.nuget.org/v3-flatcontainer/{}/{}/{}.{}.nupkg",
                    lower, version, lower, version
                ),
                format!("{}.{}.nupkg", lower, version),
            )
        }
        Ecosystem::Pypi => {
            return Err(ResolveError::UnsupportedEcosystem(eco.to_string()));
        }
    };

    debug!(ecosystem = %eco, package = name, version, url = %url, "resolved from static template");
    Ok(ArtifactInfo::with_filename(url, filename))
}
