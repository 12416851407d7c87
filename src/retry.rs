use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_INTERVAL_CAP_MS: u64 = 150_000;

/// Backoff applied between scheduler passes that reset failed tasks.
/// A zero interval disables waiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 0,
            max_interval_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn normalized(mut self) -> Self {
        if self.max_interval_ms == 0 {
            self.max_interval_ms = 30_000;
        }
        if self.multiplier <= 0.0 {
            self.multiplier = 2.0;
        }
        if self.max_interval_ms > MAX_INTERVAL_CAP_MS {
            self.max_interval_ms = MAX_INTERVAL_CAP_MS;
        }
        self
    }

    /// Delay before the pass that follows `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.interval_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let backoff = Duration::from_millis(self.interval_ms).as_secs_f64()
            * self.multiplier.powi(exponent);
        let max = Duration::from_millis(self.max_interval_ms);

        if !backoff.is_finite() || backoff >= max.as_secs_f64() {
            max
        } else {
            Duration::from_secs_f64(backoff)
        }
    }
}
