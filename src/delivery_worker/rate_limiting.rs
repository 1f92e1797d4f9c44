// ============================================================================
// Rate Limiting
// ============================================================================
//
// Token bucket per destination, shared by every worker through the store.
//
// Refill is lazy: on each access
//   tokens = min(capacity, tokens + elapsed * refill_rate)
// then one token is taken if available. The store performs that as a single
// atomic step and answers Granted or Wait(d); the limiter sleeps for the
// advised wait and asks again.
//
// ============================================================================

use crate::metrics::RATE_LIMIT_WAIT;
use crate::store::{BucketDecision, DeliveryStore};
use anyhow::{Context, Result};
use courier_config::RateLimitConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Token bucket arithmetic, used by the in-memory store
///
/// The Redis store runs the same computation in Lua on the server clock.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket
    pub fn new(capacity: u32, refill_per_sec: f64, now: Instant) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_per_sec,
            last_refill: now,
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Apply new parameters without resetting the current fill level.
    /// Time elapsed up to `now` is credited at the previous rate.
    pub fn reconfigure(&mut self, capacity: u32, refill_per_sec: f64, now: Instant) {
        self.refill(now);
        self.capacity = capacity as f64;
        self.refill_per_sec = refill_per_sec;
        self.tokens = self.tokens.min(self.capacity);
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available
    pub fn try_acquire(&mut self, now: Instant) -> BucketDecision {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return BucketDecision::Granted;
        }

        let missing = 1.0 - self.tokens;
        let wait = Duration::from_secs_f64(missing / self.refill_per_sec);
        BucketDecision::Wait(wait.max(Duration::from_millis(1)))
    }
}

/// Blocks callers until the destination's shared bucket yields a token
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn DeliveryStore>,
    capacity: u32,
    refill_per_sec: f64,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn DeliveryStore>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            capacity: config.bucket_capacity,
            refill_per_sec: config.tokens_per_second,
        }
    }

    /// Wait for a token. Returns how long the caller was held back.
    pub async fn acquire(&self, destination: &str) -> Result<Duration> {
        let started = Instant::now();

        loop {
            let decision = self
                .store
                .bucket_acquire(destination, self.capacity, self.refill_per_sec)
                .await
                .context("Failed to acquire rate-limit token")?;

            match decision {
                BucketDecision::Granted => break,
                BucketDecision::Wait(wait) => {
                    debug!(
                        destination = %destination,
                        wait_ms = wait.as_millis() as u64,
                        "Rate limit reached, waiting for token"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }

        let waited = started.elapsed();
        RATE_LIMIT_WAIT.observe(waited.as_secs_f64());
        Ok(waited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bucket_starts_full_then_waits() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(3, 2.0, now);

        for _ in 0..3 {
            assert_eq!(bucket.try_acquire(now), BucketDecision::Granted);
        }
        match bucket.try_acquire(now) {
            BucketDecision::Wait(wait) => assert_eq!(wait, Duration::from_millis(500)),
            other => panic!("expected wait, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_refills_lazily_up_to_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2, 10.0, start);
        bucket.try_acquire(start);
        bucket.try_acquire(start);

        // 150ms at 10/s -> 1.5 tokens
        let later = start + Duration::from_millis(150);
        assert_eq!(bucket.try_acquire(later), BucketDecision::Granted);
        assert!((bucket.tokens() - 0.5).abs() < 1e-9);

        // Long idle never overfills
        let much_later = later + Duration::from_secs(60);
        assert_eq!(bucket.try_acquire(much_later), BucketDecision::Granted);
        assert!((bucket.tokens() - 1.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_clamps_tokens() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(10, 1.0, now);
        bucket.reconfigure(4, 1.0, now);
        assert_eq!(bucket.tokens(), 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_credits_elapsed_time_at_old_rate() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(1, 1.0, start);
        assert_eq!(bucket.try_acquire(start), BucketDecision::Granted);

        // 2s at 1/s is capped by the old capacity of 1
        let later = start + Duration::from_secs(2);
        bucket.reconfigure(100, 100.0, later);
        assert!((bucket.tokens() - 1.0).abs() < 1e-9);

        assert_eq!(bucket.try_acquire(later), BucketDecision::Granted);
        assert!(bucket.tokens().abs() < 1e-9);
    }
}
