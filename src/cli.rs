//! CLI argument definitions.

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::commands::{ConfigCmd, FetchCmd, HeadCmd, ResolveCmd};

#[derive(Parser)]
#[command(name = "pkgfetch")]
#[command(about = "pkgfetch - resilient package artifact downloads")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the download URL, filename and integrity for packages
    Resolve(ResolveCmd),

    /// Download package artifacts
    Fetch(FetchCmd),

    /// Check an artifact's size and content type
    Head(HeadCmd),

    /// Manage configuration (tokens, user agent)
    Config(ConfigCmd),
}

impl Command {
    pub async fn execute(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        match self {
            Command::Resolve(cmd) => cmd.run(cancel).await,
            Command::Fetch(cmd) => cmd.run(cancel).await,
            Command::Head(cmd) => cmd.run(cancel).await,
            Command::Config(cmd) => cmd.run().await,
        }
    }
}
