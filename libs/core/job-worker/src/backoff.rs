//! Retry delay computation for polling and streaming.

use rand::Rng;
use std::time::Duration;

/// Computes the next retry delay from the current one.
///
/// Implementations must be pure and safe to call from several tasks at once.
pub trait BackoffSupplier: Send + Sync {
    fn supply_retry_delay(&self, current: Duration) -> Duration;
}

/// Exponential backoff with symmetric jitter.
///
/// `next = clamp(current * backoff_factor, min_delay, max_delay)`, then
/// shifted by a random amount of up to `jitter_factor * next` either way.
/// All arithmetic is done in whole milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    min_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
    jitter_factor: f64,
}

impl ExponentialBackoff {
    /// Create a backoff with the defaults
    ///
    /// Defaults:
    /// - min_delay: 50ms
    /// - max_delay: 5s
    /// - backoff_factor: 1.6
    /// - jitter_factor: 0.1
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lower bound applied before jitter
    pub fn with_min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    /// Set the upper bound applied before jitter
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the multiplier applied to the current delay
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set the jitter factor, clamped to `0.0..=1.0`
    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            backoff_factor: 1.6,
            jitter_factor: 0.1,
        }
    }
}

/// Whole milliseconds of `duration`, saturating at `u64::MAX`
pub(crate) fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl BackoffSupplier for ExponentialBackoff {
    fn supply_retry_delay(&self, current: Duration) -> Duration {
        let min = self.min_delay.as_millis() as f64;
        let max = self.max_delay.as_millis() as f64;
        let grown = (current.as_millis() as f64 * self.backoff_factor).floor();
        let delay = grown.min(max).max(min);

        if self.jitter_factor == 0.0 {
            return Duration::from_millis(delay as u64);
        }

        let spread: f64 = rand::rng().random_range(-1.0..=1.0);
        let jitter = (self.jitter_factor * delay * spread).round();
        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}
