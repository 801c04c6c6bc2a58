//! Host-name resolution cache used by the artifact fetcher's connector.
//!
//! Lookups are served from memory and refreshed on a fixed interval by a
//! background task, independent of request traffic. Cache hits never wait;
//! concurrent misses for one host wait on a single lookup. A refresh swaps
//! whole entries, so a lookup that already cloned its address list keeps
//! using it.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct CachedAddrs {
    addrs: Arc<[SocketAddr]>,
    resolved_at: Instant,
}

#[derive(Debug)]
struct Entries {
    resolved: DashMap<String, CachedAddrs>,
    // One lock per host being resolved, so concurrent misses share a lookup.
    pending: DashMap<String, Arc<Mutex<()>>>,
    refresh_interval: Duration,
}

impl Entries {
    fn cached(&self, host: &str) -> Option<Arc<[SocketAddr]>> {
        self.resolved
            .get(host)
            .filter(|entry| !self.is_expired(entry))
            .map(|entry| Arc::clone(&entry.addrs))
    }

    async fn lookup(&self, host: &str) -> io::Result<Arc<[SocketAddr]>> {
        if let Some(addrs) = self.cached(host) {
            return Ok(addrs);
        }

        let lock = Arc::clone(&self.pending.entry(host.to_string()).or_default());
        let _guard = lock.lock().await;
        if let Some(addrs) = self.cached(host) {
            return Ok(addrs);
        }

        let result = resolve_host(host).await;
        if let Ok(addrs) = &result {
            debug!(host, count = addrs.len(), "resolved host");
            self.store(host.to_string(), Arc::clone(addrs));
        }
        self.pending.remove(host);
        result
    }

    fn store(&self, host: String, addrs: Arc<[SocketAddr]>) {
        self.resolved.insert(
            host,
            CachedAddrs {
                addrs,
                resolved_at: Instant::now(),
            },
        );
    }

    // Entries outlive one missed refresh before a lookup resolves again.
    fn is_expired(&self, entry: &CachedAddrs) -> bool {
        entry.resolved_at.elapsed() > self.refresh_interval.saturating_mul(2)
    }
}

/// DNS cache implementing reqwest's resolver hook.
#[derive(Debug)]
pub struct DnsCache {
    entries: Arc<Entries>,
}

impl DnsCache {
    /// Create a cache and, when called inside a tokio runtime, start its
    /// refresh task. The task stops once the last handle is dropped.
    ///
    /// A zero interval disables caching: every lookup resolves again.
    pub fn new(refresh_interval: Duration) -> Arc<Self> {
        let cache = Arc::new(Self {
            entries: Arc::new(Entries {
                resolved: DashMap::new(),
                pending: DashMap::new(),
                refresh_interval,
            }),
        });

        if refresh_interval.is_zero() {
            return cache;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(refresh_loop(Arc::downgrade(&cache), refresh_interval));
            }
            Err(_) => {
                debug!("no tokio runtime, DNS entries will expire instead of refreshing");
            }
        }

        cache
    }

    /// Addresses for `host`, from cache when fresh.
    pub async fn lookup(&self, host: &str) -> io::Result<Arc<[SocketAddr]>> {
        self.entries.lookup(host).await
    }

    /// Re-resolve every cached host. Failed lookups keep the previous entry.
    pub async fn refresh(&self) {
        let hosts: Vec<String> = self
            .entries
            .resolved
            .iter()
            .map(|e| e.key().clone())
            .collect();

        for host in hosts {
            match resolve_host(&host).await {
                Ok(addrs) => self.entries.store(host, addrs),
                Err(e) => warn!(host = %host, error = %e, "DNS refresh failed, keeping stale entry"),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.resolved.is_empty()
    }
}

impl Resolve for DnsCache {
    fn resolve(&self, name: Name) -> Resolving {
        // The future outlives `&self`, so it holds its own handle to the entries.
        let entries = Arc::clone(&self.entries);
        Box::pin(async move {
            let addrs = entries.lookup(name.as_str()).await?;
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(into_addrs(addrs))
        })
    }
}

fn into_addrs(addrs: Arc<[SocketAddr]>) -> Addrs {
    // The connector dials these in order and overrides the port.
    Box::new(addrs.to_vec().into_iter())
}

async fn resolve_host(host: &str) -> io::Result<Arc<[SocketAddr]>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, 0)).await?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {}", host),
        ));
    }
    Ok(addrs.into())
}

async fn refresh_loop(cache: Weak<DnsCache>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(cache) = cache.upgrade() else {
            break;
        };
        debug!(hosts = cache.len(), "refreshing DNS cache");
        cache.refresh().await;
    }
}
