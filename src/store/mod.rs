// ============================================================================
// Delivery Store
// ============================================================================
//
// The shared durable substrate every worker coordinates through: per
// destination it holds the delivery stream, its consumer group (cursor and
// pending-entries ledger), the dead-letter stream, idempotency records,
// delivered markers and the rate-limit bucket.
//
// Every method is a single atomic operation on the store. Composite
// workflows (deliver then ack) are sequenced by the worker. Steps that must
// not run once another consumer has claimed the entry (renew, requeue,
// dead-letter) check ownership inside the same atomic operation.
//
// Implementations:
// - redis.rs  - Redis Streams + Lua (production, any number of processes)
// - memory.rs - in-process (tests, single-process development)
//
// ============================================================================

mod memory;
mod redis;
mod retry;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;
pub use retry::execute_redis_with_retry;

use crate::message::{EntryId, StreamEntry};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Store unreachable or timed out; the operation may succeed later
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Consumer group (or its stream) does not exist
    #[error("consumer group missing: {0}")]
    NoGroup(String),

    /// The store rejected the command or replied with an unexpected shape
    #[error("store protocol error: {0}")]
    Protocol(String),

    #[error("store codec error: {0}")]
    Codec(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub fn is_no_group(&self) -> bool {
        matches!(self, StoreError::NoGroup(_))
    }
}

impl From<courier_redis::RedisError> for StoreError {
    fn from(err: courier_redis::RedisError) -> Self {
        if courier_redis::is_no_group(&err) {
            StoreError::NoGroup(err.to_string())
        } else if err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

impl From<crate::message::InvalidEntryId> for StoreError {
    fn from(err: crate::message::InvalidEntryId) -> Self {
        StoreError::Protocol(err.to_string())
    }
}

/// Result of an idempotency-checked append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Enqueued(EntryId),
    /// The message id was seen within the TTL; nothing was appended
    Duplicate(EntryId),
}

impl AppendOutcome {
    pub fn entry_id(&self) -> EntryId {
        match self {
            AppendOutcome::Enqueued(id) | AppendOutcome::Duplicate(id) => *id,
        }
    }
}

/// Entries handed to a consumer by a read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadBatch {
    pub entries: Vec<StreamEntry>,
    /// Ids still owned by the consumer whose data was already evicted or deleted
    pub vanished: Vec<EntryId>,
}

impl ReadBatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.vanished.is_empty()
    }
}

/// Normalized claim result: where to continue scanning, and what was taken
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimBatch {
    /// `EntryId::ZERO` once the whole pending ledger has been scanned
    pub next_cursor: EntryId,
    pub entries: Vec<StreamEntry>,
    pub vanished: Vec<EntryId>,
}

/// Answer of one atomic token-bucket attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketDecision {
    Granted,
    /// No token yet; try again after this long
    Wait(Duration),
}

/// Where to move a consumer group's cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPosition {
    /// Stream tail; current backlog is skipped
    Latest,
    /// Stream start; everything still in the stream is read again
    Beginning,
}

/// Pending-ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    pub idle_ms: u64,
    pub deliveries: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerInfo {
    pub name: String,
    pub pending: u64,
    pub idle_ms: u64,
}

/// Raw numbers behind the admin health snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub length: u64,
    pub dlq_length: u64,
    pub pending: u64,
    pub consumers: Vec<ConsumerInfo>,
    /// Group cursor; `None` when the group does not exist
    pub last_delivered_id: Option<EntryId>,
}

/// Shared durable store behind the queue, worker, limiter and control plane
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn ping(&self) -> StoreResult<()>;

    /// Create the consumer group (and stream) if missing; true if it was created
    async fn ensure_group(&self, destination: &str) -> StoreResult<bool>;

    /// Materialize `consumer` in the group roster without reading anything
    async fn register_consumer(&self, destination: &str, consumer: &str) -> StoreResult<()>;

    /// Append unless `message_id` has an unexpired idempotency record.
    /// Check, append and record happen in one atomic step.
    async fn append_idempotent(
        &self,
        destination: &str,
        message_id: &str,
        payload: &[u8],
        max_len: usize,
        ttl: Duration,
    ) -> StoreResult<AppendOutcome>;

    /// Append without consulting the idempotency records (retries, DLQ replays)
    async fn append(
        &self,
        destination: &str,
        message_id: &str,
        payload: &[u8],
        max_len: usize,
    ) -> StoreResult<EntryId>;

    /// Never-delivered entries, assigned to `consumer`. Waits up to `block`
    /// for something to arrive; a zero `block` does not wait.
    async fn read_new(
        &self,
        destination: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StoreResult<ReadBatch>;

    /// Entries already in `consumer`'s pending ledger
    async fn read_owned(
        &self,
        destination: &str,
        consumer: &str,
        count: usize,
    ) -> StoreResult<ReadBatch>;

    /// Take ownership of entries idle for at least `min_idle`, scanning the
    /// ledger from `cursor`
    async fn claim_idle(
        &self,
        destination: &str,
        consumer: &str,
        min_idle: Duration,
        cursor: EntryId,
        count: usize,
    ) -> StoreResult<ClaimBatch>;

    /// Reset the idle time of `id` if `consumer` still owns it. Returns false
    /// when the entry was claimed by another consumer or already settled.
    async fn renew_claim(
        &self,
        destination: &str,
        consumer: &str,
        id: EntryId,
    ) -> StoreResult<bool>;

    /// Replace `id` with a fresh copy at the tail: append `payload`, then ack
    /// and delete `id`, in one atomic step and only while `consumer` owns
    /// `id`. Returns the new entry id, or None when ownership was lost and
    /// nothing changed.
    async fn requeue_owned(
        &self,
        destination: &str,
        consumer: &str,
        id: EntryId,
        message_id: &str,
        payload: &[u8],
        max_len: usize,
    ) -> StoreResult<Option<EntryId>>;

    /// Acknowledge and delete. Returns false when the entry was already gone.
    async fn ack_delete(&self, destination: &str, id: EntryId) -> StoreResult<bool>;

    async fn mark_delivered(
        &self,
        destination: &str,
        message_id: &str,
        ttl: Duration,
    ) -> StoreResult<()>;

    async fn is_delivered(&self, destination: &str, message_id: &str) -> StoreResult<bool>;

    /// One atomic token-bucket attempt with lazy refill
    async fn bucket_acquire(
        &self,
        destination: &str,
        capacity: u32,
        refill_per_sec: f64,
    ) -> StoreResult<BucketDecision>;

    /// Append `record` to the DLQ stream and ack+delete `id` from the main
    /// stream in one atomic step. Appends nothing and returns None unless
    /// `consumer` still owns `id` and its data is still in the stream.
    async fn dead_letter(
        &self,
        destination: &str,
        consumer: &str,
        id: EntryId,
        record: &[u8],
        dlq_max_len: usize,
    ) -> StoreResult<Option<EntryId>>;

    /// Oldest-first DLQ records
    async fn dead_letters(
        &self,
        destination: &str,
        count: usize,
    ) -> StoreResult<Vec<(EntryId, Vec<u8>)>>;

    async fn dead_letter_record(
        &self,
        destination: &str,
        id: EntryId,
    ) -> StoreResult<Option<Vec<u8>>>;

    async fn remove_dead_letter(&self, destination: &str, id: EntryId) -> StoreResult<bool>;

    async fn stream_stats(&self, destination: &str) -> StoreResult<StreamStats>;

    /// Pending ledger page, ids strictly after `after` (from the start when None)
    async fn pending_entries(
        &self,
        destination: &str,
        after: Option<EntryId>,
        count: usize,
    ) -> StoreResult<Vec<PendingEntry>>;

    /// Move ownership of `ids` to `consumer` regardless of idle time.
    /// Returns the ids that were actually transferred.
    async fn transfer(
        &self,
        destination: &str,
        consumer: &str,
        ids: &[EntryId],
    ) -> StoreResult<Vec<EntryId>>;

    async fn set_cursor(&self, destination: &str, position: CursorPosition) -> StoreResult<()>;

    /// Delete the stream and its group, then recreate both empty
    async fn recreate(&self, destination: &str) -> StoreResult<()>;
}
