//! Retry/backoff policy for failed negotiations
//!
//! Deterministic exponential backoff: `base * 2^retry_count`, clamped to a
//! maximum. There is no jitter so that retry timing is reproducible in tests.

use crate::config::SessionConfig;
use std::time::Duration;

/// Retry ceiling and backoff curve for one peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated (default: 5)
    pub max_retries: u32,
    /// Delay before the first retry (default: 4s)
    pub base_delay: Duration,
    /// Upper bound on any delay (default: 20s)
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(4000),
            max_delay: Duration::from_millis(20000),
        }
    }
}

impl From<&SessionConfig> for RetryPolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `retry_count` failures
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Backoff for the given retry index (0-indexed)
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(base_ms.saturating_mul(factor));

        delay.min(self.max_delay)
    }

    /// Delay to wait after the `failures`-th consecutive failure
    ///
    /// The first failure waits `next_delay(0)`, the second `next_delay(1)`
    /// and so on.
    pub fn delay_after_failure(&self, failures: u32) -> Duration {
        self.next_delay(failures.saturating_sub(1))
    }
}
