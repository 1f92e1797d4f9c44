// ============================================================================
// Message Deduplication
// ============================================================================
//
// Two layers keyed by the caller-supplied message_id:
//
// 1. Enqueue: the idempotency record, checked and written atomically with the
//    append (see StreamQueue::enqueue). A second enqueue within the TTL is a
//    no-op returning the prior entry id.
// 2. Delivery: a delivered marker, set after the transport accepts a message
//    and checked before every send. It suppresses re-delivery when the group
//    cursor is rewound, when a reclaimed entry was in fact already sent, and
//    when a send succeeded but its ack did not land.
//
// Both expire after IDEMPOTENCY_TTL_SECS.
//
// ============================================================================

use crate::store::DeliveryStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn DeliveryStore>,
    ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn DeliveryStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Check if message was already delivered
    pub async fn was_delivered(&self, destination: &str, message_id: &str) -> Result<bool> {
        self.store
            .is_delivered(destination, message_id)
            .await
            .context("Failed to check delivered marker")
    }

    /// Mark message as delivered (for deduplication)
    pub async fn mark_delivered(&self, destination: &str, message_id: &str) -> Result<()> {
        self.store
            .mark_delivered(destination, message_id, self.ttl)
            .await
            .context("Failed to set delivered marker")?;

        debug!(
            destination = %destination,
            message_id = %message_id,
            ttl_secs = self.ttl.as_secs(),
            "Marked message as delivered"
        );
        Ok(())
    }
}
