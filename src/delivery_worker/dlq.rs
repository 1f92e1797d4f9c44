// ============================================================================
// Dead-Letter Handler
// ============================================================================
//
// Terminal parking lot for entries that exhausted their retry budget or hit a
// permanent failure. Each record is the original message enriched with the
// failure reason, the attempt count and the time it was moved, stored as JSON
// in a bounded DLQ stream next to the main stream.
//
// Moving is one atomic store step (DLQ append + ack + delete), taken only by
// the consumer that still owns the entry. DLQ records are never retried
// automatically; an operator can list, requeue or discard them.
//
// ============================================================================

use crate::message::{DeadLetterEntry, DeadLetterRecord, EntryId, QueueMessage};
use crate::metrics::MESSAGES_DEAD_LETTERED_TOTAL;
use crate::store::DeliveryStore;
use anyhow::{Context, Result};
use chrono::Utc;
use courier_config::QueueConfig;
use std::sync::Arc;
use tracing::{info, warn};

/// What an operator requeue produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlqRequeue {
    pub dlq_id: EntryId,
    pub entry_id: EntryId,
}

#[derive(Clone)]
pub struct DeadLetterHandler {
    store: Arc<dyn DeliveryStore>,
    dlq_max_length: usize,
    max_stream_length: usize,
}

impl DeadLetterHandler {
    pub fn new(store: Arc<dyn DeliveryStore>, config: &QueueConfig) -> Self {
        Self {
            store,
            dlq_max_length: config.dlq_max_length,
            max_stream_length: config.max_stream_length,
        }
    }

    /// Move an entry to the DLQ.
    ///
    /// Returns the DLQ id, or None when `consumer` no longer owns the entry
    /// (claimed or settled by another consumer) and nothing was appended.
    pub async fn move_to_dlq(
        &self,
        destination: &str,
        consumer: &str,
        entry_id: EntryId,
        message: &QueueMessage,
        reason: &str,
        total_attempts: u32,
    ) -> Result<Option<EntryId>> {
        let record = DeadLetterEntry {
            message: message.clone(),
            original_entry_id: entry_id,
            failure_reason: reason.to_string(),
            total_attempts,
            moved_at: Utc::now(),
        }
        .to_json()
        .context("Failed to serialize dead-letter record")?;

        let dlq_id = self
            .store
            .dead_letter(destination, consumer, entry_id, &record, self.dlq_max_length)
            .await
            .context("Failed to move entry to DLQ")?;

        match dlq_id {
            Some(dlq_id) => {
                MESSAGES_DEAD_LETTERED_TOTAL
                    .with_label_values(&[destination])
                    .inc();
                warn!(
                    destination = %destination,
                    message_id = %message.message_id,
                    entry_id = %entry_id,
                    dlq_id = %dlq_id,
                    total_attempts = total_attempts,
                    reason = %reason,
                    "Message moved to dead-letter queue"
                );
            }
            None => {
                info!(
                    destination = %destination,
                    consumer = %consumer,
                    entry_id = %entry_id,
                    "Entry no longer owned, nothing dead-lettered"
                );
            }
        }
        Ok(dlq_id)
    }

    /// Oldest-first DLQ records. Unreadable records are skipped with a warning.
    pub async fn list(&self, destination: &str, count: usize) -> Result<Vec<DeadLetterRecord>> {
        let raw = self
            .store
            .dead_letters(destination, count)
            .await
            .context("Failed to read DLQ")?;

        let mut records = Vec::with_capacity(raw.len());
        for (id, bytes) in raw {
            match DeadLetterEntry::from_json(&bytes) {
                Ok(entry) => records.push(DeadLetterRecord { id, entry }),
                Err(e) => warn!(
                    destination = %destination,
                    dlq_id = %id,
                    error = %e,
                    "Skipping unreadable DLQ record"
                ),
            }
        }
        Ok(records)
    }

    /// Put a dead-lettered message back on the main stream with a fresh retry
    /// budget, then drop the DLQ record. Returns None when `dlq_id` is unknown.
    pub async fn requeue(&self, destination: &str, dlq_id: EntryId) -> Result<Option<DlqRequeue>> {
        let Some(bytes) = self
            .store
            .dead_letter_record(destination, dlq_id)
            .await
            .context("Failed to read DLQ record")?
        else {
            return Ok(None);
        };

        let entry = DeadLetterEntry::from_json(&bytes).context("DLQ record is not readable")?;
        let message = QueueMessage {
            attempt_count: 0,
            ..entry.message
        };
        let payload = message.encode().context("Failed to encode message")?;

        let entry_id = self
            .store
            .append(
                destination,
                &message.message_id,
                &payload,
                self.max_stream_length,
            )
            .await
            .context("Failed to requeue DLQ record")?;

        self.store
            .remove_dead_letter(destination, dlq_id)
            .await
            .context("Failed to remove requeued DLQ record")?;

        info!(
            destination = %destination,
            message_id = %message.message_id,
            dlq_id = %dlq_id,
            entry_id = %entry_id,
            "DLQ record requeued"
        );
        Ok(Some(DlqRequeue { dlq_id, entry_id }))
    }

    /// Drop a DLQ record. Returns false when it did not exist.
    pub async fn discard(&self, destination: &str, dlq_id: EntryId) -> Result<bool> {
        let removed = self
            .store
            .remove_dead_letter(destination, dlq_id)
            .await
            .context("Failed to discard DLQ record")?;

        if removed {
            info!(destination = %destination, dlq_id = %dlq_id, "DLQ record discarded");
        }
        Ok(removed)
    }
}
