//! Per-host circuit breaker.
//!
//! # State Machine
//!
//! ```text
//! Closed --[failure_threshold consecutive failures]--> Open
//! Open --[cool-down elapsed, next call]--> Probing
//! Probing --[probe succeeds]--> Closed (cool-down reset)
//! Probing --[probe fails]--> Open (cool-down doubled, capped)
//! Probing --[probe abandoned]--> Open (eligible to probe again)
//! ```
//!
//! Calls are admitted through [`CircuitBreaker::try_acquire`], which hands out
//! a [`Permit`]. The caller settles the permit with the outcome of its call.
//! Time is passed in explicitly so transitions are testable without sleeping.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Configuration for a host's circuit breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit (default: 5).
    pub failure_threshold: u32,
    /// Cool-down after the first trip (default: 30s).
    pub initial_backoff: Duration,
    /// Cool-down ceiling after repeated failed probes (default: 5min).
    pub max_backoff: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(5 * 60),
        }
    }
}

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    Closed,
    /// Rejecting calls, or waiting on a probe.
    Open,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed { failures: u32 },
    Open { since: Instant },
    /// A single trial call is in flight. `since` is when the circuit opened.
    Probing { since: Instant },
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    cooldown: Duration,
}

pub struct CircuitBreaker {
    host: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("host", &self.host)
            .field("config", &self.config)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(host: impl Into<String>, config: BreakerConfig) -> Self {
        let cooldown = config.initial_backoff;
        Self {
            host: host.into(),
            config,
            inner: Mutex::new(Inner {
                phase: Phase::Closed { failures: 0 },
                cooldown,
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Ask to make a call at `now`.
    ///
    /// Returns how long until the next probe window when the call is rejected.
    pub fn try_acquire(&self, now: Instant) -> Result<Permit<'_>, Duration> {
        let mut inner = self.inner.lock();

        match inner.phase {
            Phase::Closed { .. } => Ok(Permit::new(self, false)),
            Phase::Open { since } => {
                let ready_at = since + inner.cooldown;
                if now >= ready_at {
                    inner.phase = Phase::Probing { since };
                    debug!(host = %self.host, "circuit half-open, admitting probe");
                    Ok(Permit::new(self, true))
                } else {
                    Err(ready_at - now)
                }
            }
            Phase::Probing { since } => Err((since + inner.cooldown).saturating_duration_since(now)),
        }
    }

    /// Current state. Does not advance the state machine.
    pub fn state(&self) -> BreakerState {
        match self.inner.lock().phase {
            Phase::Closed { .. } => BreakerState::Closed,
            Phase::Open { .. } | Phase::Probing { .. } => BreakerState::Open,
        }
    }

    /// Consecutive failures counted while closed.
    pub fn consecutive_failures(&self) -> u32 {
        match self.inner.lock().phase {
            Phase::Closed { failures } => failures,
            _ => 0,
        }
    }

    /// Cool-down that applies the next time the circuit is open.
    pub fn cooldown(&self) -> Duration {
        self.inner.lock().cooldown
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Probing { .. } if probe => {
                inner.phase = Phase::Closed { failures: 0 };
                inner.cooldown = self.config.initial_backoff;
                info!(host = %self.host, "circuit closed, host recovered");
            }
            Phase::Closed { .. } => inner.phase = Phase::Closed { failures: 0 },
            // A call admitted before the trip finished late; the open state stands.
            _ => {}
        }
    }

    fn on_failure(&self, probe: bool, now: Instant) {
        let mut inner = self.inner.lock();
        match inner.phase {
            Phase::Probing { .. } if probe => {
                inner.cooldown = inner
                    .cooldown
                    .saturating_mul(2)
                    .min(self.config.max_backoff);
                inner.phase = Phase::Open { since: now };
                warn!(
                    host = %self.host,
                    cooldown_secs = inner.cooldown.as_secs(),
                    "probe failed, circuit re-opened"
                );
            }
            Phase::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    inner.phase = Phase::Open { since: now };
                    warn!(
                        host = %self.host,
                        failures,
                        cooldown_secs = inner.cooldown.as_secs(),
                        "circuit opened"
                    );
                } else {
                    inner.phase = Phase::Closed { failures };
                }
            }
            _ => {}
        }
    }

    fn on_abandon(&self) {
        let mut inner = self.inner.lock();
        if let Phase::Probing { since } = inner.phase {
            inner.phase = Phase::Open { since };
            debug!(host = %self.host, "probe abandoned, slot released");
        }
    }
}

/// Admission to make one call through a breaker.
///
/// Settle it with [`success`](Self::success) or [`failure`](Self::failure).
/// Dropping it unsettled records nothing, except that an abandoned probe
/// frees the probe slot.
#[must_use = "settle the permit with the call's outcome"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            settled: false,
        }
    }

    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.probe);
    }

    pub fn failure(mut self, now: Instant) {
        self.settled = true;
        self.breaker.on_failure(self.probe, now);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.on_abandon();
        }
    }
}
