//! Resolve command - print artifact locations without downloading.

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;

use super::{PackageSpec, ResolveOpts};

#[derive(Args)]
pub struct ResolveCmd {
    /// Package specs: ecosystem:name@version (e.g., npm:axios@1.7.9)
    #[arg(required = true)]
    pub packages: Vec<PackageSpec>,

    #[command(flatten)]
    pub opts: ResolveOpts,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

impl ResolveCmd {
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let resolver = self.opts.resolver()?;

        for spec in &self.packages {
            let info = resolver
                .resolve(&spec.ecosystem, &spec.name, &spec.version, cancel)
                .await
                .with_context(|| format!("Failed to resolve {}", spec))?;

            if self.json {
                println!("{}", serde_json::to_string(&info)?);
                continue;
            }

            println!("{}", spec);
            println!("  url:       {}", info.url);
            println!("  filename:  {}", info.filename);
            if let Some(integrity) = &info.integrity {
                println!("  integrity: {}", integrity);
            }
        }

        Ok(())
    }
}
