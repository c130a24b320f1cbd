//! Retry policy for channel deliveries and event replays.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for transient delivery errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Whether to add ±25% jitter to delays.
    #[serde(default = "default_true")]
    pub use_jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_true() -> bool {
    true
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that makes exactly `max_attempts` attempts.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self::with_max_attempts(1)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts.max(1)
    }

    /// Delay to wait after `attempts_made` failed attempts (1-based) before
    /// the next one.
    ///
    /// `initial * 2^(attempts_made - 1)`, capped at `max_delay_ms`. A
    /// transport-provided `retry_after` raises the delay but never past the cap.
    pub fn delay_for(&self, attempts_made: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(32);
        let delay_ms = self
            .initial_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.max_delay_ms);

        let delay_ms = if self.use_jitter {
            apply_jitter(delay_ms)
        } else {
            delay_ms
        };

        let floor_ms = retry_after
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);

        Duration::from_millis(delay_ms.max(floor_ms).min(self.max_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            use_jitter: default_true(),
        }
    }
}

/// ±25% around `delay_ms`.
fn apply_jitter(delay_ms: u64) -> u64 {
    let range = delay_ms / 4;
    if range == 0 {
        return delay_ms;
    }
    let offset = rand::random::<u64>() % (range * 2 + 1);
    delay_ms - range + offset
}
