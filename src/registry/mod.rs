//! Registry metadata clients for npm, PyPI, crates.io, Go and Maven.
//!
//! The resolver consults these when an artifact URL cannot be built from
//! the coordinate alone, or when a caller wants registry-provided URLs.
//!
//! # Example
//!
//! ```ignore
//! use pkgfetch::registry::Registries;
//!
//! let registries = Registries::defaults()?;
//! if let Some(npm) = registries.get("npm") {
//!     let versions = npm.fetch_versions("lodash", &cancel).await?;
//! }
//! ```

mod client;
mod crates_io;
mod error;
mod go;
mod http;
mod maven;
mod npm;
mod pypi;

use std::collections::BTreeMap;
use std::sync::Arc;

pub use client::{
    Dependency, Maintainer, Package, Registry, Scope, UrlBuilder, Version, VersionStatus,
};
pub use crates_io::CratesIoRegistry;
pub use error::RegistryError;
pub use go::{GoRegistry, escape_module_path, module_basename, normalize_version};
pub use http::{JsonClient, JsonClientConfig};
pub use maven::MavenRegistry;
pub use npm::NpmRegistry;
pub use pypi::{PypiRegistry, normalize_name};

/// Ecosystem identifier -> registry collaborator.
///
/// Built by the caller before it is handed to the resolver, read-only after.
#[derive(Clone, Default)]
pub struct Registries {
    entries: BTreeMap<String, Arc<dyn Registry>>,
}

impl Registries {
    /// An empty table. The resolver falls back to static URL templates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every registry this crate ships, sharing one metadata client.
    pub fn defaults() -> Result<Self, RegistryError> {
        Ok(Self::with_client(JsonClient::new()?))
    }

    pub fn with_client(http: JsonClient) -> Self {
        let mut registries = Self::new();
        registries.register(Arc::new(NpmRegistry::new(http.clone())));
        registries.register(Arc::new(PypiRegistry::new(http.clone())));
        registries.register(Arc::new(CratesIoRegistry::new(http.clone())));
        registries.register(Arc::new(GoRegistry::new(http.clone())));
        registries.register(Arc::new(MavenRegistry::new(http)));
        registries
    }

    /// Add or replace the registry for its ecosystem.
    pub fn register(&mut self, registry: Arc<dyn Registry>) -> &mut Self {
        self.entries
            .insert(registry.ecosystem().to_string(), registry);
        self
    }

    pub fn get(&self, ecosystem: &str) -> Option<&Arc<dyn Registry>> {
        self.entries.get(ecosystem)
    }

    pub fn ecosystems(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Registries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registries")
            .field("ecosystems", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}
