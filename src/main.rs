//! pkgfetch CLI - resolve and download package artifacts.

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Controlled by the RUST_LOG env var
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling in-flight requests");
            on_signal.cancel();
        }
    });

    cli.command.execute(&cancel).await
}
