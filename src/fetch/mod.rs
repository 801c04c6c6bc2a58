//! Resilient artifact retrieval.
//!
//! [`Resolver`] turns a package coordinate into an [`ArtifactInfo`],
//! [`Fetcher`] downloads it with retries over a cached-DNS connection pool,
//! and [`CircuitBreakerFetcher`] stops hammering hosts that keep failing.
//!
//! # Example
//!
//! ```ignore
//! use pkgfetch::fetch::{ArtifactFetcher, CircuitBreakerFetcher, Fetcher, Resolver};
//! use pkgfetch::registry::Registries;
//!
//! let resolver = Resolver::new(Registries::defaults()?);
//! let fetcher = CircuitBreakerFetcher::new(Fetcher::new()?);
//!
//! let info = resolver.resolve("npm", "lodash", "4.17.21", &cancel).await?;
//! let artifact = fetcher.fetch(&info.url, &cancel).await?;
//! let body = artifact.bytes().await?;
//! ```

mod artifact;
mod backoff;
mod breaker;
mod circuit;
mod dns;
mod error;
mod fetcher;
mod integrity;
mod resolver;

pub use artifact::{Artifact, ArtifactHead, ArtifactInfo, ArtifactSize, filename_from_url};
pub use backoff::{JITTER_FRACTION, RetryPolicy, parse_retry_after};
pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker, Permit};
pub use circuit::{CircuitBreakerFetcher, host_key};
pub use dns::DnsCache;
pub use error::{FetchError, ResolveError};
pub use fetcher::{
    ArtifactFetcher, AuthHook, Fetcher, FetcherConfig, default_user_agent,
};
pub use integrity::{Algorithm, Integrity, IntegrityError, Verifier};
pub use resolver::Resolver;
