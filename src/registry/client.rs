//! Registry trait and common metadata types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::error::RegistryError;

/// Package-level metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub description: Option<String>,
    pub homepage: Option<String>,
    pub repository: Option<String>,
    pub licenses: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// npm scope, maven groupId, go module prefix.
    pub namespace: Option<String>,
    pub latest_version: Option<String>,
    /// Registry-specific extras.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// One published version of a package.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Version {
    pub number: String,
    pub published_at: Option<DateTime<Utc>>,
    pub licenses: Option<String>,
    /// `<algorithm>-<digest>`, e.g. `sha256-...`.
    pub integrity: Option<String>,
    #[serde(default)]
    pub status: VersionStatus,
    /// Registry-specific extras. The resolver reads `download_url`,
    /// `tarball` and `filename` from here.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Version {
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            ..Default::default()
        }
    }

    /// Non-empty string value stored under `key` in the metadata.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    #[default]
    Active,
    Yanked,
    Deprecated,
    Retracted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub requirements: String,
    pub scope: Scope,
    pub optional: bool,
}

/// When a dependency is required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Runtime,
    Development,
    Test,
    Build,
    Optional,
    /// Conditional on an environment marker (PEP 508).
    Marker(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Maintainer {
    pub uuid: Option<String>,
    pub login: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub url: Option<String>,
    pub role: Option<String>,
}

/// Builds well-known URLs for a registry's packages.
///
/// `None` means the registry has no deterministic URL of that kind.
pub trait UrlBuilder: Send + Sync {
    fn registry(&self, name: &str, version: &str) -> Option<String>;
    fn download(&self, name: &str, version: &str) -> Option<String>;
    fn documentation(&self, name: &str, version: &str) -> Option<String>;
    fn purl(&self, name: &str, version: &str) -> Option<String>;
}

/// A package registry's metadata API.
///
/// Each ecosystem (npm, pypi, cargo, etc.) implements this trait.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Ecosystem identifier, e.g. `"npm"`, `"cargo"`.
    fn ecosystem(&self) -> &'static str;

    async fn fetch_package(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Package, RegistryError>;

    async fn fetch_versions(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Version>, RegistryError>;

    async fn fetch_dependencies(
        &self,
        name: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Dependency>, RegistryError>;

    async fn fetch_maintainers(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Maintainer>, RegistryError>;

    fn urls(&self) -> &dyn UrlBuilder;
}
