//! Fetcher decorator with one circuit breaker per upstream host.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::artifact::{Artifact, ArtifactHead};
use super::breaker::{BreakerConfig, BreakerState, CircuitBreaker, Permit};
use super::error::FetchError;
use super::fetcher::{ArtifactFetcher, Fetcher};

/// Longest raw URL prefix used as a breaker key when no host can be parsed.
const RAW_KEY_LIMIT: usize = 50;

/// Wraps an [`ArtifactFetcher`] so a failing host stops receiving traffic.
///
/// Breakers are created on first use and live as long as the wrapper.
pub struct CircuitBreakerFetcher<F = Fetcher> {
    inner: F,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
}

impl<F: ArtifactFetcher> CircuitBreakerFetcher<F> {
    pub fn new(inner: F) -> Self {
        Self::with_config(inner, BreakerConfig::default())
    }

    pub fn with_config(inner: F, config: BreakerConfig) -> Self {
        Self {
            inner,
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    /// Snapshot of every known host's breaker, sorted by host.
    pub fn breaker_states(&self) -> BTreeMap<String, BreakerState> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }

    fn breaker(&self, host: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(host) {
            return Arc::clone(existing.value());
        }

        let entry = self.breakers.entry(host.to_string()).or_insert_with(|| {
            debug!(host, "creating circuit breaker");
            Arc::new(CircuitBreaker::new(host, self.config.clone()))
        });
        Arc::clone(entry.value())
    }

    async fn guarded<T>(
        &self,
        url: &str,
        call: impl Future<Output = Result<T, FetchError>>,
    ) -> Result<T, FetchError> {
        let host = host_key(url);
        let breaker = self.breaker(&host);

        let permit = breaker
            .try_acquire(Instant::now())
            .map_err(|retry_in| FetchError::CircuitOpen {
                host: host.clone(),
                retry_in,
            })?;

        let result = call.await;
        settle(permit, &result);
        result
    }
}

#[async_trait]
impl<F: ArtifactFetcher> ArtifactFetcher for CircuitBreakerFetcher<F> {
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<Artifact, FetchError> {
        self.guarded(url, self.inner.fetch(url, cancel)).await
    }

    async fn head(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ArtifactHead, FetchError> {
        self.guarded(url, self.inner.head(url, cancel)).await
    }
}

fn settle<T>(permit: Permit<'_>, result: &Result<T, FetchError>) {
    match result {
        Ok(_) => permit.success(),
        Err(err) if err.is_host_failure() => permit.failure(Instant::now()),
        // The host answered; the request was the problem.
        Err(FetchError::NotFound { .. } | FetchError::UnexpectedStatus { .. }) => permit.success(),
        Err(_) => drop(permit),
    }
}

/// Breaker key for a URL: `host[:port]`, scheme ignored.
///
/// Unparsable URLs are keyed by their first 50 characters.
pub fn host_key(raw: &str) -> String {
    if let Ok(parsed) = url::Url::parse(raw) {
        if let Some(host) = parsed.host_str().filter(|h| !h.is_empty()) {
            return match parsed.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
        }
    }
    raw.chars().take(RAW_KEY_LIMIT).collect()
}
