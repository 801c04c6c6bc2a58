//! User configuration.
//!
//! Config is stored at `~/.config/pkgfetch/config.toml` and contains:
//! - per-host bearer tokens for private registries
//! - fetcher overrides (user agent, retries, timeout)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{AUTHORIZATION, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::fetch::{AuthHook, FetcherConfig, host_key};

const CONFIG_DIR: &str = "pkgfetch";
const CONFIG_FILE: &str = "config.toml";

/// pkgfetch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// User-Agent header override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Retries after the first attempt for artifact downloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Whole-request timeout for artifact downloads, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Parallel downloads for `pkgfetch fetch`.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Bearer tokens keyed by host (`npm.pkg.github.com`, `localhost:8080`).
    #[serde(default)]
    pub tokens: BTreeMap<String, String>,
}

fn default_concurrency() -> usize {
    4
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_agent: None,
            max_retries: None,
            timeout_secs: None,
            concurrency: default_concurrency(),
            tokens: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load config from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load config from `path`, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).context("Failed to read config file")?;

        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save config to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        write_private(path, content.as_bytes()).context("Failed to write config file")
    }

    /// Get the config file path.
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;

        Ok(config_dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Set the token for `host`. Accepts a bare host or a URL.
    pub fn set_token(&mut self, host: &str, token: String) {
        self.tokens.insert(normalize_host(host), token);
    }

    /// Returns whether a token was removed.
    pub fn remove_token(&mut self, host: &str) -> bool {
        self.tokens.remove(&normalize_host(host)).is_some()
    }

    /// Get the token for `host` as a SecretString.
    pub fn token_secret(&self, host: &str) -> Option<SecretString> {
        self.tokens
            .get(&normalize_host(host))
            .filter(|t| !t.is_empty())
            .cloned()
            .map(SecretString::from)
    }

    /// Fetcher settings with this config's overrides applied.
    pub fn fetcher_config(&self) -> FetcherConfig {
        let mut config = FetcherConfig::default();
        if let Some(user_agent) = &self.user_agent {
            config.user_agent = user_agent.clone();
        }
        if let Some(max_retries) = self.max_retries {
            config.retry.max_retries = max_retries;
        }
        if let Some(secs) = self.timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        config
    }

    /// Header hook sending `Authorization: Bearer <token>` to configured hosts.
    ///
    /// `None` when no tokens are configured.
    pub fn auth_hook(&self) -> Option<AuthHook> {
        let tokens: BTreeMap<String, SecretString> = self
            .tokens
            .iter()
            .filter(|(_, token)| !token.is_empty())
            .map(|(host, token)| (host.clone(), SecretString::from(token.clone())))
            .collect();
        if tokens.is_empty() {
            return None;
        }

        let tokens = Arc::new(tokens);
        Some(Arc::new(move |url: &str| {
            let token = tokens.get(&host_key(url))?;
            let mut value =
                HeaderValue::from_str(&format!("Bearer {}", token.expose_secret())).ok()?;
            value.set_sensitive(true);
            Some((AUTHORIZATION, value))
        }))
    }
}

/// Token keys are `host[:port]`, lowercased.
fn normalize_host(host: &str) -> String {
    if host.contains("://") {
        host_key(host)
    } else {
        host.trim().trim_end_matches('/').to_lowercase()
    }
}

/// Write `contents` readable by the owner only, since the file holds tokens.
#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies on creation; tighten files written by older versions too.
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}
