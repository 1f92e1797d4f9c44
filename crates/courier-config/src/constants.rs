// ============================================================================
// Configuration Constants
// ============================================================================

// Admin surface
pub(crate) const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub(crate) const DEFAULT_ADMIN_PORT: u16 = 8090;

// Store
pub(crate) const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub(crate) const DEFAULT_KEY_PREFIX: &str = "courier";
pub(crate) const DEFAULT_CONSUMER_GROUP: &str = "delivery-workers";
pub(crate) const DEFAULT_DESTINATION: &str = "default";
pub(crate) const DEFAULT_WORKER_NAME_PREFIX: &str = "worker";

// Consumer loop
// Entries owned by a consumer that has been silent for a minute are considered orphaned.
pub(crate) const DEFAULT_CLAIM_IDLE_THRESHOLD_MS: u64 = 60_000;
pub(crate) const DEFAULT_READ_BATCH_SIZE: usize = 10;
pub(crate) const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 5_000;

// Retry / DLQ
pub(crate) const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;
pub(crate) const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
pub(crate) const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

// Retention
pub(crate) const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = SECONDS_PER_DAY;
pub(crate) const DEFAULT_MAX_STREAM_LENGTH: usize = 10_000;
pub(crate) const DEFAULT_DLQ_MAX_LENGTH: usize = 10_000;

// Rate limiting (per destination, shared by every worker)
pub(crate) const DEFAULT_TOKENS_PER_SECOND: f64 = 20.0;
pub(crate) const DEFAULT_BUCKET_CAPACITY: u32 = 20;

// Transport
pub(crate) const DEFAULT_TRANSPORT_TIMEOUT_MS: u64 = 10_000;

pub(crate) const SECONDS_PER_DAY: u64 = 86_400;

/// Queue depth ratio (of `max_stream_length`) at which health reports the stream as near capacity
pub const NEAR_CAPACITY_RATIO: f64 = 0.9;
