//! Registry client errors.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("package not found: {0}")]
    PackageNotFound(String),

    #[error("version not found: {package}@{version}")]
    VersionNotFound { package: String, version: String },

    #[error("invalid package: {0}")]
    InvalidPackage(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rate limited: {url}")]
    RateLimited {
        url: String,
        retry_after: Option<Duration>,
    },

    #[error("request cancelled: {url}")]
    Cancelled { url: String },

    #[error("request to {url} failed with status {status}")]
    Request { url: String, status: StatusCode },

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML parse error: {0}")]
    Xml(#[from] quick_xml::DeError),
}

impl RegistryError {
    /// Whether the registry answered 404 or reported the package missing.
    pub fn is_not_found(&self) -> bool {
        match self {
            RegistryError::PackageNotFound(_) | RegistryError::VersionNotFound { .. } => true,
            RegistryError::Request { status, .. } => *status == StatusCode::NOT_FOUND,
            _ => false,
        }
    }

    /// Replace a bare 404 with a domain-level not-found error.
    pub(crate) fn or_not_found(self, not_found: impl FnOnce() -> RegistryError) -> RegistryError {
        match self {
            RegistryError::Request { status, .. } if status == StatusCode::NOT_FOUND => not_found(),
            other => other,
        }
    }
}
