//! Exponential backoff shared by the artifact fetcher and the metadata client.

use std::time::Duration;

use rand::Rng;

/// Upper bound on the uniform jitter added to each delay, as a fraction.
pub const JITTER_FRACTION: f64 = 0.10;

/// Retry schedule: `base_delay * 2^(retry-1)` plus up to 10% jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts allowed after the first one.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Whether to add random jitter on top of the exponential delay.
    pub jitter: bool,
    /// Ceiling applied to server `Retry-After` hints.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            jitter: true,
            max_retry_after: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay for retry number `retry` (1-based), without jitter.
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.base_delay_for(retry);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=JITTER_FRACTION);
        delay + delay.mul_f64(jitter)
    }

    /// Delay before retry `retry`, never shorter than the (capped) server hint.
    pub fn delay_with_hint(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.delay_for(retry);
        match retry_after {
            Some(hint) => delay.max(hint.min(self.max_retry_after)),
            None => delay,
        }
    }
}

/// Parse a `Retry-After` header given as an integer number of seconds.
///
/// HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy {
            jitter: false,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::default();
        for retry in 1..=6 {
            let floor = policy.base_delay_for(retry);
            let ceiling = floor.mul_f64(1.0 + JITTER_FRACTION);
            for _ in 0..200 {
                let delay = policy.delay_for(retry);
                assert!(delay >= floor, "retry {retry}: {delay:?} < {floor:?}");
                assert!(delay <= ceiling, "retry {retry}: {delay:?} > {ceiling:?}");
            }
        }
    }

    #[test]
    fn test_delays_non_decreasing() {
        let policy = RetryPolicy::default();
        // The jitter band of retry k never overlaps the floor of retry k+1.
        for retry in 1..8 {
            let this_ceiling = policy.base_delay_for(retry).mul_f64(1.0 + JITTER_FRACTION);
            assert!(this_ceiling <= policy.base_delay_for(retry + 1));
        }
    }

    #[test]
    fn test_zero_base_delay() {
        let policy = RetryPolicy {
            base_delay: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(policy.delay_for(4), Duration::ZERO);
    }

    #[test]
    fn test_large_retry_saturates() {
        let policy = RetryPolicy::default();
        let _ = policy.delay_for(u32::MAX);
    }

    #[test]
    fn test_retry_after_hint_is_a_floor() {
        let policy = RetryPolicy {
            jitter: false,
            ..Default::default()
        };
        assert_eq!(
            policy.delay_with_hint(1, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.delay_with_hint(1, Some(Duration::from_millis(10))),
            Duration::from_millis(500)
        );
        assert_eq!(
            policy.delay_with_hint(1, Some(Duration::from_secs(3600))),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 7 "), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }
}
