// ============================================================================
// Delivery Worker Loop
// ============================================================================
//
// One Worker serves one destination under one consumer identity. Each
// iteration:
//
// 1. Claim step - take over entries idle longer than the claim threshold
//    (orphaned by a crashed or stalled consumer), continuing a persistent
//    scan cursor through the pending ledger.
// 2. Owned step - re-process entries already owned by this consumer
//    (force-claimed by an operator, or left behind by a failed ack).
// 3. Read step - read new entries, blocking only when steps 1-2 found nothing.
//
// Every entry goes through: decode -> delivered-marker check -> rate-limit
// token -> claim renewal -> executor send -> transition() -> side effects.
//
// Renewal resets the entry's idle time and confirms this consumer still owns
// it. Once another consumer has claimed an entry, this worker neither sends
// it nor applies any further ownership-checked effect to it.
//
// Store errors end the iteration; the loop backs off (100ms -> 30s) and tries
// again. A missing consumer group (destroyed by an operator) triggers
// re-registration. Shutdown is checked between iterations, so an in-flight
// backoff sleep and its requeue always complete.
//
// ============================================================================

use crate::delivery_worker::backoff::RetryPolicy;
use crate::delivery_worker::executor::DeliveryError;
use crate::delivery_worker::processor::{
    DeliveryOutcome, NextState, SideEffect, Transition, transition,
};
use crate::delivery_worker::state::WorkerState;
use crate::delivery_worker::stream_queue::QueueError;
use crate::message::{EntryId, QueueMessage, StreamEntry};
use crate::metrics::{
    DELIVERY_DURATION, DELIVERY_RETRIES_TOTAL, DUPLICATES_SUPPRESSED_TOTAL,
    ENTRIES_CLAIMED_TOTAL, MESSAGES_DELIVERED_TOTAL,
};
use crate::store::StoreError;
use crate::utils::log_safe_id;
use anyhow::{Context, Result};
use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const INITIAL_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(30);
const SUMMARY_INTERVAL: Duration = Duration::from_secs(30);

/// Ephemeral consumer identity: "{prefix}-{pid}-{start_ms}"
pub fn consumer_name(prefix: &str) -> String {
    format!(
        "{}-{}-{}",
        prefix,
        std::process::id(),
        Utc::now().timestamp_millis()
    )
}

/// Counters since the last summary log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub duplicates: u64,
    pub claimed: u64,
    /// Attempt number (1-based) of the most recent successful send
    pub last_delivered_attempt: Option<u32>,
    /// Entries abandoned because another consumer claimed them
    pub lost: u64,
}

pub struct Worker {
    state: Arc<WorkerState>,
    destination: String,
    consumer: String,
    registered: bool,
    claim_cursor: EntryId,
    rng: StdRng,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(
        state: Arc<WorkerState>,
        destination: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self::with_rng(state, destination, consumer, StdRng::from_entropy())
    }

    /// Worker with a caller-supplied jitter source
    pub fn with_rng(
        state: Arc<WorkerState>,
        destination: impl Into<String>,
        consumer: impl Into<String>,
        rng: StdRng,
    ) -> Self {
        Self {
            state,
            destination: destination.into(),
            consumer: consumer.into(),
            registered: false,
            claim_cursor: EntryId::ZERO,
            rng,
            stats: WorkerStats::default(),
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Make sure the group exists and this consumer is in its roster
    pub async fn register(&mut self) -> Result<()> {
        let created = self
            .state
            .store
            .ensure_group(&self.destination)
            .await
            .context("Failed to create consumer group")?;
        if created {
            info!(destination = %self.destination, "Consumer group created");
        }

        self.state
            .store
            .register_consumer(&self.destination, &self.consumer)
            .await
            .context("Failed to register consumer")?;

        self.registered = true;
        self.claim_cursor = EntryId::ZERO;
        info!(
            destination = %self.destination,
            consumer = %self.consumer,
            "Consumer registered"
        );
        Ok(())
    }

    /// Run until `shutdown` is set
    pub async fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        info!(
            destination = %self.destination,
            consumer = %self.consumer,
            "Delivery worker started"
        );

        let mut error_backoff = INITIAL_ERROR_BACKOFF;
        let mut last_summary = Instant::now();

        while !shutdown.load(Ordering::SeqCst) {
            let result = if self.registered {
                self.run_once().await.map(|_| ())
            } else {
                self.register().await
            };

            match result {
                Ok(()) => error_backoff = INITIAL_ERROR_BACKOFF,
                Err(e) if is_no_group(&e) => {
                    warn!(
                        destination = %self.destination,
                        consumer = %self.consumer,
                        "Consumer group missing, re-registering"
                    );
                    self.registered = false;
                }
                Err(e) => {
                    error!(
                        destination = %self.destination,
                        consumer = %self.consumer,
                        error = %format!("{:#}", e),
                        backoff_ms = error_backoff.as_millis() as u64,
                        "Worker iteration failed, backing off"
                    );
                    tokio::time::sleep(error_backoff).await;
                    error_backoff = (error_backoff * 2).min(MAX_ERROR_BACKOFF);
                }
            }

            if last_summary.elapsed() >= SUMMARY_INTERVAL {
                self.log_summary();
                last_summary = Instant::now();
            }
        }

        self.log_summary();
        info!(
            destination = %self.destination,
            consumer = %self.consumer,
            "Delivery worker stopped gracefully"
        );
        Ok(())
    }

    /// One claim / owned / read pass. Returns the number of entries handled.
    pub async fn run_once(&mut self) -> Result<usize> {
        let batch_size = self.state.config.queue.read_batch_size;
        let mut handled = 0;

        // 1. Orphaned entries
        let claim = self
            .state
            .store
            .claim_idle(
                &self.destination,
                &self.consumer,
                self.state.config.queue.claim_idle_threshold(),
                self.claim_cursor,
                batch_size,
            )
            .await
            .context("Failed to claim idle entries")?;
        self.claim_cursor = claim.next_cursor;

        if !claim.entries.is_empty() {
            ENTRIES_CLAIMED_TOTAL
                .with_label_values(&[&self.destination])
                .inc_by(claim.entries.len() as u64);
            self.stats.claimed += claim.entries.len() as u64;
            info!(
                destination = %self.destination,
                consumer = %self.consumer,
                count = claim.entries.len(),
                "Claimed idle entries from other consumers"
            );
        }
        handled += self.discard_vanished(&claim.vanished).await?;
        for entry in claim.entries {
            self.process_entry(entry).await?;
            handled += 1;
        }

        // 2. Entries this consumer already owns
        let owned = self
            .state
            .store
            .read_owned(&self.destination, &self.consumer, batch_size)
            .await
            .context("Failed to read owned entries")?;
        handled += self.discard_vanished(&owned.vanished).await?;
        for entry in owned.entries {
            self.process_entry(entry).await?;
            handled += 1;
        }

        // 3. New entries
        let block = if handled == 0 {
            self.state.config.queue.block_timeout()
        } else {
            Duration::ZERO
        };
        let fresh = self
            .state
            .store
            .read_new(&self.destination, &self.consumer, batch_size, block)
            .await
            .context("Failed to read new entries")?;
        for entry in fresh.entries {
            self.process_entry(entry).await?;
            handled += 1;
        }

        Ok(handled)
    }

    /// Ledger ids whose data is gone (evicted or already deleted)
    async fn discard_vanished(&self, ids: &[EntryId]) -> Result<usize> {
        for id in ids {
            self.state
                .queue
                .ack_delete(&self.destination, *id)
                .await
                .context("Failed to ack vanished entry")?;
            debug!(
                destination = %self.destination,
                entry_id = %id,
                "Acked entry whose data was already removed"
            );
        }
        Ok(ids.len())
    }

    async fn process_entry(&mut self, entry: StreamEntry) -> Result<()> {
        let message = match QueueMessage::decode(&entry.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    destination = %self.destination,
                    entry_id = %entry.id,
                    error = %e,
                    "Malformed entry payload"
                );
                let message = self.malformed_placeholder(&entry);
                let outcome = DeliveryOutcome::Failed(DeliveryError::Permanent(format!(
                    "malformed payload: {}",
                    e
                )));
                return self.settle(entry.id, &message, outcome).await;
            }
        };

        let outcome = if self
            .state
            .guard
            .was_delivered(&self.destination, &message.message_id)
            .await?
        {
            DeliveryOutcome::AlreadyDelivered
        } else {
            self.state.limiter.acquire(&self.destination).await?;

            if !self.renew_claim(entry.id).await? {
                return Ok(());
            }

            let timer = DELIVERY_DURATION
                .with_label_values(&[&self.destination])
                .start_timer();
            let result = self
                .state
                .executor
                .send(&message.recipient, &message.payload)
                .await;
            timer.observe_duration();

            match result {
                Ok(receipt) => DeliveryOutcome::Delivered {
                    provider_ref: receipt.provider_ref,
                },
                Err(e) => DeliveryOutcome::Failed(e),
            }
        };

        self.settle(entry.id, &message, outcome).await
    }

    /// Reset the entry's idle time. False when another consumer owns it now.
    async fn renew_claim(&mut self, entry_id: EntryId) -> Result<bool> {
        let renewed = self
            .state
            .store
            .renew_claim(&self.destination, &self.consumer, entry_id)
            .await
            .context("Failed to renew claim")?;
        if !renewed {
            self.stats.lost += 1;
            info!(
                destination = %self.destination,
                consumer = %self.consumer,
                entry_id = %entry_id,
                "Entry claimed by another consumer, skipping"
            );
        }
        Ok(renewed)
    }

    /// Stand-in for an entry that cannot be decoded, so it can still be
    /// dead-lettered with its raw bytes
    fn malformed_placeholder(&self, entry: &StreamEntry) -> QueueMessage {
        QueueMessage {
            message_id: entry
                .message_id
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            destination: self.destination.clone(),
            recipient: String::new(),
            payload: serde_json::Value::String(String::from_utf8_lossy(&entry.payload).into_owned()),
            enqueued_at: Utc::now(),
            attempt_count: 0,
            metadata: Default::default(),
        }
    }

    async fn settle(
        &mut self,
        entry_id: EntryId,
        message: &QueueMessage,
        outcome: DeliveryOutcome,
    ) -> Result<()> {
        let jitter = RetryPolicy::jitter(&mut self.rng);
        let Transition { next, effects } =
            transition(message, &outcome, &self.state.policy, jitter);

        let recipient_hash = log_safe_id(&message.recipient, self.state.hash_salt());
        match &next {
            NextState::Delivered => {
                let provider_ref = match &outcome {
                    DeliveryOutcome::Delivered { provider_ref } => provider_ref.as_str(),
                    _ => "",
                };
                info!(
                    destination = %self.destination,
                    message_id = %message.message_id,
                    recipient_hash = %recipient_hash,
                    attempt = message.attempt_number(),
                    provider_ref = %provider_ref,
                    "Message delivered"
                );
            }
            NextState::Skipped => {
                info!(
                    destination = %self.destination,
                    message_id = %message.message_id,
                    "Message already delivered, skipping (deduplication)"
                );
            }
            NextState::Retrying {
                attempt_count,
                delay,
            } => {
                warn!(
                    destination = %self.destination,
                    message_id = %message.message_id,
                    recipient_hash = %recipient_hash,
                    attempt = message.attempt_number(),
                    next_attempt_count = attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    reason = %failure_reason(&outcome),
                    "Delivery failed, scheduling retry"
                );
            }
            NextState::DeadLettered { .. } => {}
        }

        for effect in effects {
            if !self.apply(entry_id, message, effect).await? {
                self.stats.lost += 1;
                info!(
                    destination = %self.destination,
                    consumer = %self.consumer,
                    message_id = %message.message_id,
                    entry_id = %entry_id,
                    "Entry claimed by another consumer, abandoning"
                );
                return Ok(());
            }
        }

        match next {
            NextState::Delivered => {
                MESSAGES_DELIVERED_TOTAL
                    .with_label_values(&[&self.destination])
                    .inc();
                self.stats.delivered += 1;
                self.stats.last_delivered_attempt = Some(message.attempt_number());
            }
            NextState::Skipped => {
                DUPLICATES_SUPPRESSED_TOTAL
                    .with_label_values(&[&self.destination, "delivery"])
                    .inc();
                self.stats.duplicates += 1;
            }
            NextState::Retrying { .. } => {
                DELIVERY_RETRIES_TOTAL
                    .with_label_values(&[&self.destination])
                    .inc();
                self.stats.retried += 1;
            }
            NextState::DeadLettered { .. } => self.stats.dead_lettered += 1,
        }
        Ok(())
    }

    /// Apply one side effect. Returns false when the entry is no longer owned
    /// by this consumer and the remaining effects must be dropped.
    async fn apply(
        &self,
        entry_id: EntryId,
        message: &QueueMessage,
        effect: SideEffect,
    ) -> Result<bool> {
        match effect {
            SideEffect::MarkDelivered => {
                self.state
                    .guard
                    .mark_delivered(&self.destination, &message.message_id)
                    .await?;
            }
            SideEffect::AckDelete => {
                let removed = self
                    .state
                    .queue
                    .ack_delete(&self.destination, entry_id)
                    .await
                    .context("Failed to ack entry")?;
                if !removed {
                    debug!(
                        destination = %self.destination,
                        entry_id = %entry_id,
                        "Entry was already removed"
                    );
                }
            }
            SideEffect::RenewClaim => {
                return Ok(self
                    .state
                    .store
                    .renew_claim(&self.destination, &self.consumer, entry_id)
                    .await
                    .context("Failed to renew claim")?);
            }
            SideEffect::Sleep(delay) => tokio::time::sleep(delay).await,
            SideEffect::Requeue(retry) => {
                let requeued = self
                    .state
                    .queue
                    .requeue(&self.consumer, entry_id, &retry)
                    .await
                    .context("Failed to requeue message")?;
                return Ok(requeued.is_some());
            }
            SideEffect::DeadLetter {
                reason,
                total_attempts,
            } => {
                let moved = self
                    .state
                    .dead_letters
                    .move_to_dlq(
                        &self.destination,
                        &self.consumer,
                        entry_id,
                        message,
                        &reason,
                        total_attempts,
                    )
                    .await?;
                return Ok(moved.is_some());
            }
        }
        Ok(true)
    }

    fn log_summary(&mut self) {
        let stats = std::mem::take(&mut self.stats);
        info!(
            destination = %self.destination,
            consumer = %self.consumer,
            delivered = stats.delivered,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered,
            duplicates = stats.duplicates,
            claimed = stats.claimed,
            lost = stats.lost,
            "Delivery worker metrics (last 30s)"
        );
    }
}

fn failure_reason(outcome: &DeliveryOutcome) -> &str {
    match outcome {
        DeliveryOutcome::Failed(e) => e.reason(),
        _ => "",
    }
}

/// Whether an iteration failed because the consumer group no longer exists
pub fn is_no_group(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<StoreError>()
            .is_some_and(StoreError::is_no_group)
            || matches!(
                cause.downcast_ref::<QueueError>(),
                Some(QueueError::Store(e)) if e.is_no_group()
            )
    })
}
