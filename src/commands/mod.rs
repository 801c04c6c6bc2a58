//! CLI command implementations.

mod config;
mod fetch;
mod head;
mod resolve;
mod spec;

use anyhow::{Context, Result};
use clap::Args;
use pkgfetch::config::Config;
use pkgfetch::fetch::{CircuitBreakerFetcher, Fetcher, Resolver};
use pkgfetch::registry::Registries;

pub use config::ConfigCmd;
pub use fetch::FetchCmd;
pub use head::HeadCmd;
pub use resolve::ResolveCmd;
pub use spec::PackageSpec;

/// Options shared by commands that resolve package specs.
#[derive(Args, Debug, Clone)]
pub struct ResolveOpts {
    /// Build URLs from static templates only, without registry metadata lookups
    #[arg(long)]
    pub no_registry: bool,
}

impl ResolveOpts {
    pub fn resolver(&self) -> Result<Resolver> {
        if self.no_registry {
            return Ok(Resolver::default());
        }
        let registries = Registries::defaults().context("Failed to create registry clients")?;
        Ok(Resolver::new(registries))
    }
}

/// Artifact fetcher configured from the user's config file.
pub fn build_fetcher(config: &Config) -> Result<CircuitBreakerFetcher> {
    let fetcher = Fetcher::with_config(config.fetcher_config())
        .context("Failed to create HTTP client")?
        .with_auth_hook(config.auth_hook());
    Ok(CircuitBreakerFetcher::new(fetcher))
}
