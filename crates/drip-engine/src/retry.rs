use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy for transient provider failures: exponential backoff
/// with a cap and a little jitter. Permanent failures never retry; the
/// schedule here is configuration, not provider behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per recipient, the first one included.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each retry.
    pub base_delay_ms: u64,
    /// Ceiling for the backoff delay.
    pub max_delay_ms: u64,
    /// Randomization factor applied to each delay (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt remains after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff before the attempt following `attempt` (1-indexed):
    /// `base * 2^(attempt-1)`, capped, jittered.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self.base_delay_ms.saturating_mul(1u64 << exp);
        let capped = raw.min(self.max_delay_ms);
        if self.jitter <= 0.0 {
            return Duration::from_millis(capped);
        }
        let factor = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_millis((capped as f64 * factor) as u64)
    }
}
