//! Exponential backoff used by reconnecting backends

use std::time::Duration;

/// Exponentially growing delay bounded by `min` and `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    factor: f64,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff starting at `min`, multiplying by `factor` on every
    /// attempt and never exceeding `max`. `min` is at least one millisecond.
    pub fn new(min: Duration, max: Duration, factor: f64) -> Self {
        let min = min.max(Duration::from_millis(1));
        let max = max.max(min);
        let factor = if factor.is_finite() && factor >= 1.0 {
            factor
        } else {
            1.0
        };

        Self {
            min,
            max,
            factor,
            max_attempts: None,
            attempt: 0,
        }
    }

    /// Give up after this many attempts
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Number of delays handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for a given attempt number, without advancing
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(64) as i32;
        let millis = self.min.as_millis() as f64 * self.factor.powi(exponent);
        let max = self.max.as_millis() as f64;

        if !millis.is_finite() || millis >= max {
            self.max
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    /// Delay to wait before the next attempt, or `None` once the attempt
    /// budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(limit) = self.max_attempts {
            if self.attempt >= limit {
                return None;
            }
        }

        let delay = self.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// Start over from the minimum delay
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(30), 2.0)
    }
}
