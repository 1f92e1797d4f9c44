// ============================================================================
// Stream Queue Operations
// ============================================================================
//
// Producer-facing enqueue and the worker's requeue / ack_delete.
//
// enqueue:   idempotency check + capped append + idempotency record, as one
//            atomic store operation (a duplicate returns the prior entry id)
// requeue:   replace an entry the caller still owns with a copy at the tail,
//            bypassing the idempotency records; the copy keeps the original
//            message_id. Appending the copy and acking + deleting the
//            original is one store operation, skipped if ownership was lost.
// ack_delete: acknowledge and delete; re-acking a missing entry is a no-op
//
// The stream is capped at max_stream_length. On overflow the oldest entries
// are evicted, whether or not they were consumed. That loss is bounded and is
// surfaced through queue depth in the health snapshot.
//
// ============================================================================

use crate::message::{EntryId, NewMessage, QueueMessage};
use crate::metrics::{DUPLICATES_SUPPRESSED_TOTAL, MESSAGES_ENQUEUED_TOTAL};
use crate::store::{AppendOutcome, DeliveryStore, StoreError};
use courier_config::QueueConfig;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid message: {0}")]
    Invalid(String),

    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of a producer enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { entry_id: EntryId },
    /// Same message_id seen within the idempotency TTL; nothing appended
    Duplicate { entry_id: EntryId },
}

impl EnqueueOutcome {
    pub fn entry_id(&self) -> EntryId {
        match self {
            EnqueueOutcome::Enqueued { entry_id } | EnqueueOutcome::Duplicate { entry_id } => {
                *entry_id
            }
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueOutcome::Duplicate { .. })
    }
}

#[derive(Clone)]
pub struct StreamQueue {
    store: Arc<dyn DeliveryStore>,
    max_stream_length: usize,
    idempotency_ttl: Duration,
}

impl StreamQueue {
    pub fn new(store: Arc<dyn DeliveryStore>, config: &QueueConfig) -> Self {
        Self {
            store,
            max_stream_length: config.max_stream_length,
            idempotency_ttl: config.idempotency_ttl(),
        }
    }

    pub fn max_stream_length(&self) -> usize {
        self.max_stream_length
    }

    /// Enqueue a new message for `destination`
    pub async fn enqueue(
        &self,
        destination: &str,
        message: NewMessage,
    ) -> Result<EnqueueOutcome, QueueError> {
        validate(destination, &message)?;

        let message = QueueMessage::new(destination, message);
        let bytes = message.encode()?;

        let outcome = self
            .store
            .append_idempotent(
                destination,
                &message.message_id,
                &bytes,
                self.max_stream_length,
                self.idempotency_ttl,
            )
            .await?;

        match outcome {
            AppendOutcome::Enqueued(entry_id) => {
                MESSAGES_ENQUEUED_TOTAL
                    .with_label_values(&[destination])
                    .inc();
                debug!(
                    destination = %destination,
                    message_id = %message.message_id,
                    entry_id = %entry_id,
                    "Message enqueued"
                );
                Ok(EnqueueOutcome::Enqueued { entry_id })
            }
            AppendOutcome::Duplicate(entry_id) => {
                DUPLICATES_SUPPRESSED_TOTAL
                    .with_label_values(&[destination, "enqueue"])
                    .inc();
                info!(
                    destination = %destination,
                    message_id = %message.message_id,
                    prior_entry_id = %entry_id,
                    "Duplicate enqueue suppressed (idempotency)"
                );
                Ok(EnqueueOutcome::Duplicate { entry_id })
            }
        }
    }

    /// Replace `entry_id` with `message` at the tail of the stream.
    ///
    /// Returns None, with nothing appended or acknowledged, when `consumer`
    /// no longer owns `entry_id`.
    pub async fn requeue(
        &self,
        consumer: &str,
        entry_id: EntryId,
        message: &QueueMessage,
    ) -> Result<Option<EntryId>, QueueError> {
        let bytes = message.encode()?;
        let requeued = self
            .store
            .requeue_owned(
                &message.destination,
                consumer,
                entry_id,
                &message.message_id,
                &bytes,
                self.max_stream_length,
            )
            .await?;

        if let Some(new_entry_id) = requeued {
            debug!(
                destination = %message.destination,
                message_id = %message.message_id,
                attempt_count = message.attempt_count,
                entry_id = %new_entry_id,
                replaced = %entry_id,
                "Message requeued"
            );
        }
        Ok(requeued)
    }

    /// Acknowledge and delete an entry. Returns false when it was already gone.
    pub async fn ack_delete(&self, destination: &str, entry_id: EntryId) -> Result<bool, QueueError> {
        Ok(self.store.ack_delete(destination, entry_id).await?)
    }
}

fn validate(destination: &str, message: &NewMessage) -> Result<(), QueueError> {
    if destination.trim().is_empty() {
        return Err(QueueError::Invalid("destination must not be empty".into()));
    }
    if message.message_id.trim().is_empty() {
        return Err(QueueError::Invalid("message_id must not be empty".into()));
    }
    if message.recipient.trim().is_empty() {
        return Err(QueueError::Invalid("recipient must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn queue() -> (Arc<MemoryStore>, StreamQueue) {
        let store = Arc::new(MemoryStore::new());
        let queue = StreamQueue::new(store.clone(), &QueueConfig::default());
        (store, queue)
    }

    #[tokio::test]
    async fn test_enqueue_twice_appends_once() {
        let (store, queue) = queue();
        let first = queue
            .enqueue("sms", NewMessage::new("m1", "r1", json!("hello")))
            .await
            .unwrap();
        let second = queue
            .enqueue("sms", NewMessage::new("m1", "r1", json!("hello again")))
            .await
            .unwrap();

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(first.entry_id(), second.entry_id());
        assert_eq!(store.stream_stats("sms").await.unwrap().length, 1);
    }

    #[tokio::test]
    async fn test_requeue_replaces_owned_entry() {
        let (store, queue) = queue();
        store.ensure_group("sms").await.unwrap();
        let original = queue
            .enqueue("sms", NewMessage::new("m1", "r1", json!("hello")))
            .await
            .unwrap()
            .entry_id();
        store.read_new("sms", "w1", 10, Duration::ZERO).await.unwrap();

        let retry = QueueMessage::new("sms", NewMessage::new("m1", "r1", json!("hello"))).next_attempt();
        assert!(queue.requeue("w2", original, &retry).await.unwrap().is_none());

        let copy = queue.requeue("w1", original, &retry).await.unwrap().unwrap();
        assert_ne!(copy, original);
        let stats = store.stream_stats("sms").await.unwrap();
        assert_eq!((stats.length, stats.pending), (1, 0));

        // Idempotency records still point at the original enqueue
        let again = queue
            .enqueue("sms", NewMessage::new("m1", "r1", json!("hello")))
            .await
            .unwrap();
        assert!(again.is_duplicate());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_fields() {
        let (_, queue) = queue();
        let err = queue
            .enqueue("sms", NewMessage::new("", "r1", json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Invalid(_)));

        let err = queue
            .enqueue(" ", NewMessage::new("m1", "r1", json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Invalid(_)));

        let err = queue
            .enqueue("sms", NewMessage::new("m1", "", json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_ack_delete_missing_entry_is_noop() {
        let (_, queue) = queue();
        assert!(!queue.ack_delete("sms", EntryId::new(1, 0)).await.unwrap());
    }
}
