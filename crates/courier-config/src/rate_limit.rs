// ============================================================================
// Rate Limit Configuration
// ============================================================================

use crate::constants::*;
use crate::env_parse;

/// Token bucket parameters, applied per destination
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub tokens_per_second: f64,
    pub bucket_capacity: u32,
}

impl RateLimitConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            tokens_per_second: env_parse("TOKENS_PER_SECOND", DEFAULT_TOKENS_PER_SECOND),
            bucket_capacity: env_parse("BUCKET_CAPACITY", DEFAULT_BUCKET_CAPACITY),
        }
    }

    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        if self.tokens_per_second <= 0.0 || !self.tokens_per_second.is_finite() {
            anyhow::bail!("TOKENS_PER_SECOND must be a positive number");
        }
        if self.bucket_capacity == 0 {
            anyhow::bail!("BUCKET_CAPACITY must be greater than zero");
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_second: DEFAULT_TOKENS_PER_SECOND,
            bucket_capacity: DEFAULT_BUCKET_CAPACITY,
        }
    }
}
