//! Config command - manage local configuration.

use anyhow::Result;
use clap::{Args, Subcommand};
use pkgfetch::config::Config;
use pkgfetch::fetch::FetcherConfig;

#[derive(Args)]
pub struct ConfigCmd {
    #[command(subcommand)]
    pub command: ConfigSubCmd,
}

#[derive(Subcommand)]
pub enum ConfigSubCmd {
    /// Set a bearer token for a registry host
    SetToken(SetTokenCmd),

    /// Remove the token for a registry host
    RemoveToken(RemoveTokenCmd),

    /// Set the User-Agent sent with every request
    SetUserAgent(SetUserAgentCmd),

    /// Show current configuration
    Show,
}

#[derive(Args)]
pub struct SetTokenCmd {
    /// Host, optionally with port (e.g., npm.pkg.github.com)
    pub host: String,

    /// Token value
    #[arg(env = "PKGFETCH_TOKEN", hide_env_values = true)]
    pub token: String,
}

#[derive(Args)]
pub struct RemoveTokenCmd {
    pub host: String,
}

#[derive(Args)]
pub struct SetUserAgentCmd {
    /// User agent (e.g., acme-mirror/1.0)
    pub user_agent: String,
}

impl ConfigCmd {
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            ConfigSubCmd::SetToken(cmd) => {
                let mut config = Config::load()?;
                config.set_token(&cmd.host, cmd.token.clone());
                config.save()?;
                println!("Token saved for {}.", cmd.host);
            }
            ConfigSubCmd::RemoveToken(cmd) => {
                let mut config = Config::load()?;
                if config.remove_token(&cmd.host) {
                    config.save()?;
                    println!("Token removed for {}.", cmd.host);
                } else {
                    println!("No token configured for {}.", cmd.host);
                }
            }
            ConfigSubCmd::SetUserAgent(cmd) => {
                let mut config = Config::load()?;
                config.user_agent = Some(cmd.user_agent.clone());
                config.save()?;
                println!("User agent set to: {}", cmd.user_agent);
            }
            ConfigSubCmd::Show => {
                let config = Config::load()?;
                let effective = config.fetcher_config();
                let defaults = FetcherConfig::default();

                println!("Config: {}", Config::config_path()?.display());
                println!();
                println!("user_agent:   {}", effective.user_agent);
                println!("max_retries:  {}", effective.retry.max_retries);
                println!("timeout:      {}s", effective.timeout.as_secs());
                println!("concurrency:  {}", config.concurrency);
                if effective.user_agent == defaults.user_agent {
                    println!("              (default user agent)");
                }
                println!();
                if config.tokens.is_empty() {
                    println!("tokens:       (none)");
                } else {
                    println!("tokens:");
                    for host in config.tokens.keys() {
                        println!("  {:<40} (set)", host);
                    }
                }
            }
        }
        Ok(())
    }
}
