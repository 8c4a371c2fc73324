//! Exponential backoff
//!
//! The resolver keeps two of these: one spacing out merges between merge
//! commits received from peers (storm avoidance), one spacing out retries
//! after a failed merge round.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff parameters, as read from the `[backoff]` config table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound for any delay
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt
    pub factor: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 50,
            max_delay_ms: 60_000,
            factor: 2,
        }
    }
}

impl BackoffConfig {
    /// Set the initial delay
    pub fn with_initial_delay_ms(mut self, initial_delay_ms: u64) -> Self {
        self.initial_delay_ms = initial_delay_ms;
        self
    }

    /// Set the maximum delay
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Delay for a given attempt, starting at 0
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = (self.factor.max(1) as u64).saturating_pow(attempt);
        let delay_ms = self.initial_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Stateful backoff: each `next_delay` grows the delay until `reset`
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff at its first attempt
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay to wait now; advances to the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Return to the initial delay
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
