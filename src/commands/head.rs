//! Head command - check an artifact's size without downloading it.

use anyhow::{Context, Result};
use clap::Args;
use pkgfetch::config::Config;
use pkgfetch::fetch::ArtifactFetcher;
use tokio_util::sync::CancellationToken;

use super::{PackageSpec, ResolveOpts, build_fetcher};

#[derive(Args)]
pub struct HeadCmd {
    /// Artifact URL, or package spec ecosystem:name@version
    pub target: String,

    #[command(flatten)]
    pub opts: ResolveOpts,
}

impl HeadCmd {
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let config = Config::load()?;
        let fetcher = build_fetcher(&config)?;

        let url = if self.target.starts_with("http://") || self.target.starts_with("https://") {
            self.target.clone()
        } else {
            let spec: PackageSpec = self.target.parse()?;
            self.opts
                .resolver()?
                .resolve(&spec.ecosystem, &spec.name, &spec.version, cancel)
                .await
                .with_context(|| format!("Failed to resolve {}", spec))?
                .url
        };

        let head = fetcher
            .head(&url, cancel)
            .await
            .with_context(|| format!("HEAD {} failed", url))?;

        println!("url:           {}", url);
        println!("size:          {}", head.size);
        println!(
            "content-type:  {}",
            head.content_type.as_deref().unwrap_or("(unknown)")
        );

        Ok(())
    }
}
