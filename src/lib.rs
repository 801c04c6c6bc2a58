//! Resilient package artifact resolution and download.
//!
//! - [`fetch`]: resolver, retrying fetcher, per-host circuit breakers and
//!   integrity verification.
//! - [`registry`]: metadata clients for npm, PyPI, crates.io, Go and Maven.
//! - [`config`]: the user's `config.toml`.

pub mod config;
pub mod fetch;
pub mod registry;
pub mod types;
