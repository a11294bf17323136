//! Retry policy: bounded exponential backoff for source polling.
//!
//! The watcher retries transport errors with exponentially growing delays,
//! capped at a maximum, and gives up after a configurable number of
//! attempts. The arithmetic saturates, so extreme attempt counts or
//! settings can never overflow into a zero or tiny delay.
//!
//! # Backoff Schedule (defaults)
//!
//! ```text
//! Failure  Delay
//! -------  -----
//! 1        250ms
//! 2        500ms
//! 3        1s
//! 4        2s
//! 5        4s
//! 6        8s
//! 7        16s
//! 8        32s
//! 9+       60s    (cap)
//! ```
//!
//! Twelve failures in a row exhaust the budget and the poller reports a
//! terminal error. Setting `attempts` to 0 retries forever.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for poll retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Number of consecutive failures tolerated before giving up.
    /// 0 means retry forever.
    #[serde(default = "default_attempts")]
    pub attempts: usize,

    /// Base delay in milliseconds (delay before the first retry).
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Ceiling for the exponential backoff, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_attempts() -> usize {
    12
}

fn default_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 12,
            backoff_ms: 250,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryConfig {
    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 1,
            max_backoff_ms: 10,
        }
    }

    /// Retry forever (daemon operators who prefer liveness over failing
    /// fast can set this).
    pub fn unbounded() -> Self {
        Self {
            attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-indexed: the first failure
    /// sleeps `delay_for_attempt(1)`).
    ///
    /// `min(backoff * 2^(attempt-1), max_backoff)`, saturating.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as u32;
        let multiplier = 2u64.saturating_pow(exponent);
        let delay_ms = self
            .backoff_ms
            .saturating_mul(multiplier)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay_ms)
    }

    /// Whether `failures` consecutive failures exhaust the retry budget.
    pub fn exhausted(&self, failures: usize) -> bool {
        self.attempts != 0 && failures >= self.attempts
    }

    /// Base delay as a `Duration`.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Backoff ceiling as a `Duration`.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}
