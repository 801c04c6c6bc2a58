//! Artifact fetch and resolution errors.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use crate::registry::RegistryError;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("artifact not found: {url}")]
    NotFound { url: String },

    #[error("rate limited by upstream: {url}")]
    RateLimited {
        url: String,
        retry_after: Option<Duration>,
    },

    #[error("upstream unavailable ({status}): {url}")]
    UpstreamDown {
        url: String,
        status: StatusCode,
        retry_after: Option<Duration>,
    },

    #[error("circuit breaker open for host {host}, retry in {}s", .retry_in.as_secs())]
    CircuitOpen { host: String, retry_in: Duration },

    #[error("request cancelled: {url}")]
    Cancelled { url: String },

    #[error("unexpected status {status} from {url}: {body}")]
    UnexpectedStatus {
        url: String,
        status: StatusCode,
        body: String,
    },

    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Rate limiting and server-side failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::RateLimited { .. } | FetchError::UpstreamDown { .. }
        )
    }

    /// Whether this outcome says something bad about the upstream host.
    pub fn is_host_failure(&self) -> bool {
        self.is_transient() || matches!(self, FetchError::Network { .. })
    }

    /// Server-provided wait hint from a `Retry-After` header.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after, .. }
            | FetchError::UpstreamDown { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound { .. })
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{ecosystem}: package {name} version {version} not found")]
    NotFound {
        ecosystem: String,
        name: String,
        version: String,
    },

    #[error("{ecosystem}: no download URL available for {name}@{version}")]
    NoDownloadUrl {
        ecosystem: String,
        name: String,
        version: String,
    },

    #[error("unsupported ecosystem: {0}")]
    UnsupportedEcosystem(String),

    #[error("{ecosystem}: invalid package name {name:?}: {reason}")]
    InvalidName {
        ecosystem: String,
        name: String,
        reason: String,
    },

    #[error("resolution cancelled: {ecosystem}/{name}@{version}")]
    Cancelled {
        ecosystem: String,
        name: String,
        version: String,
    },

    #[error("fetching versions: {0}")]
    Registry(#[from] RegistryError),
}
