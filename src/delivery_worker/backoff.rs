use courier_config::QueueConfig;
use rand::Rng;
use std::time::Duration;

/// Retry ceiling and exponential backoff with jitter
///
/// `attempt_count` is the number of failed attempts before the current one.
/// The delay after a failure is `min(max, base * 2^attempt_count)` scaled by a
/// uniform jitter factor in `[0.5, 1.0]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_delivery_attempts,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Whether a transient failure of a message with this `attempt_count`
    /// gets another attempt
    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }

    /// Backoff before jitter
    pub fn exponential(&self, attempt_count: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Backoff scaled by `jitter`, clamped to `[0.5, 1.0]`
    pub fn delay(&self, attempt_count: u32, jitter: f64) -> Duration {
        self.exponential(attempt_count)
            .mul_f64(jitter.clamp(0.5, 1.0))
    }

    /// Draw a jitter factor
    pub fn jitter<R: Rng + ?Sized>(rng: &mut R) -> f64 {
        rng.gen_range(0.5..=1.0)
    }
}
