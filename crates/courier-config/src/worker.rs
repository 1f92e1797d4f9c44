// ============================================================================
// Worker / Queue Configuration
// ============================================================================

use crate::constants::*;
use crate::env_parse;
use std::time::Duration;

/// Consumer loop, retry and retention settings
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Destinations (one stream each) served by this process
    pub destinations: Vec<String>,
    /// Prefix of the ephemeral consumer identity ("{prefix}-{pid}-{start_ms}")
    pub worker_name_prefix: String,
    /// Entries idle longer than this become reclaimable by other consumers
    pub claim_idle_threshold_ms: u64,
    /// Max entries per read / claim batch
    pub read_batch_size: usize,
    /// How long a read waits for new entries
    pub block_timeout_ms: u64,
    /// Retry ceiling before an entry is dead-lettered
    pub max_delivery_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Dedup window for message ids (enqueue and delivered markers)
    pub idempotency_ttl_secs: u64,
    /// Backlog cap before oldest-entry eviction
    pub max_stream_length: usize,
    pub dlq_max_length: usize,
}

impl QueueConfig {
    pub(crate) fn from_env() -> Self {
        let destinations = std::env::var("DESTINATIONS")
            .unwrap_or_else(|_| DEFAULT_DESTINATION.to_string())
            .split(',')
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();

        Self {
            destinations,
            worker_name_prefix: env_parse(
                "WORKER_NAME_PREFIX",
                DEFAULT_WORKER_NAME_PREFIX.to_string(),
            ),
            claim_idle_threshold_ms: env_parse(
                "CLAIM_IDLE_THRESHOLD_MS",
                DEFAULT_CLAIM_IDLE_THRESHOLD_MS,
            ),
            read_batch_size: env_parse("READ_BATCH_SIZE", DEFAULT_READ_BATCH_SIZE),
            block_timeout_ms: env_parse("BLOCK_TIMEOUT_MS", DEFAULT_BLOCK_TIMEOUT_MS),
            max_delivery_attempts: env_parse(
                "MAX_DELIVERY_ATTEMPTS",
                DEFAULT_MAX_DELIVERY_ATTEMPTS,
            ),
            retry_base_delay_ms: env_parse("RETRY_BASE_DELAY_MS", DEFAULT_RETRY_BASE_DELAY_MS),
            retry_max_delay_ms: env_parse("RETRY_MAX_DELAY_MS", DEFAULT_RETRY_MAX_DELAY_MS),
            idempotency_ttl_secs: env_parse("IDEMPOTENCY_TTL_SECS", DEFAULT_IDEMPOTENCY_TTL_SECS),
            max_stream_length: env_parse("MAX_STREAM_LENGTH", DEFAULT_MAX_STREAM_LENGTH),
            dlq_max_length: env_parse("DLQ_MAX_LENGTH", DEFAULT_DLQ_MAX_LENGTH),
        }
    }

    pub fn claim_idle_threshold(&self) -> Duration {
        Duration::from_millis(self.claim_idle_threshold_ms)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        if self.destinations.is_empty() {
            anyhow::bail!("DESTINATIONS must name at least one destination");
        }
        if self.read_batch_size == 0 {
            anyhow::bail!("READ_BATCH_SIZE must be greater than zero");
        }
        if self.max_stream_length == 0 || self.dlq_max_length == 0 {
            anyhow::bail!("MAX_STREAM_LENGTH and DLQ_MAX_LENGTH must be greater than zero");
        }
        if self.idempotency_ttl_secs == 0 {
            anyhow::bail!("IDEMPOTENCY_TTL_SECS must be greater than zero");
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            anyhow::bail!(
                "RETRY_BASE_DELAY_MS ({}) must not exceed RETRY_MAX_DELAY_MS ({})",
                self.retry_base_delay_ms,
                self.retry_max_delay_ms
            );
        }
        // A worker holds the failed entry while it sleeps before requeueing it
        if self.retry_max_delay_ms >= self.claim_idle_threshold_ms {
            anyhow::bail!(
                "RETRY_MAX_DELAY_MS ({}) must be below CLAIM_IDLE_THRESHOLD_MS ({})",
                self.retry_max_delay_ms,
                self.claim_idle_threshold_ms
            );
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            destinations: vec![DEFAULT_DESTINATION.to_string()],
            worker_name_prefix: DEFAULT_WORKER_NAME_PREFIX.to_string(),
            claim_idle_threshold_ms: DEFAULT_CLAIM_IDLE_THRESHOLD_MS,
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            block_timeout_ms: DEFAULT_BLOCK_TIMEOUT_MS,
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            idempotency_ttl_secs: DEFAULT_IDEMPOTENCY_TTL_SECS,
            max_stream_length: DEFAULT_MAX_STREAM_LENGTH,
            dlq_max_length: DEFAULT_DLQ_MAX_LENGTH,
        }
    }
}
