// ============================================================================
// Admin Control Plane
// ============================================================================
//
// Operator actions on one destination's queue:
//
// - health():           depth, consumers, pending, DLQ depth, group cursor
// - reset_to_latest():  move the group cursor to the stream tail (skip backlog)
// - reset_to_begin():   move the cursor to the stream start; delivered markers
//                       keep already-sent messages from going out twice
// - destroy_recreate(): drop the stream and group and start empty
// - force_claim():      hand every pending entry to one named consumer
//
// ============================================================================

use crate::message::EntryId;
use crate::metrics::{DLQ_DEPTH, QUEUE_DEPTH};
use crate::store::{ConsumerInfo, CursorPosition, DeliveryStore};
use anyhow::{Context, Result};
use courier_config::{NEAR_CAPACITY_RATIO, QueueConfig};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

const FORCE_CLAIM_PAGE: usize = 100;

/// Snapshot of one destination's queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueHealth {
    pub destination: String,
    pub queue_depth: u64,
    pub consumers: Vec<ConsumerInfo>,
    pub pending_count: u64,
    pub dlq_depth: u64,
    /// Group cursor: the last entry handed to any consumer
    pub last_delivered_id: Option<EntryId>,
    pub max_stream_length: usize,
    /// Depth at or above NEAR_CAPACITY_RATIO of the cap; oldest entries are
    /// about to be evicted
    pub near_capacity: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForceClaimReport {
    pub destination: String,
    pub worker_id: String,
    /// Pending entries inspected
    pub scanned: usize,
    pub transferred: usize,
    /// Ids that were already owned by `worker_id`
    pub already_owned: usize,
}

#[derive(Clone)]
pub struct ControlPlane {
    store: Arc<dyn DeliveryStore>,
    max_stream_length: usize,
}

impl ControlPlane {
    pub fn new(store: Arc<dyn DeliveryStore>, config: &QueueConfig) -> Self {
        Self {
            store,
            max_stream_length: config.max_stream_length,
        }
    }

    pub async fn health(&self, destination: &str) -> Result<QueueHealth> {
        let stats = self
            .store
            .stream_stats(destination)
            .await
            .context("Failed to read stream stats")?;

        let near_capacity =
            stats.length as f64 >= self.max_stream_length as f64 * NEAR_CAPACITY_RATIO;
        if near_capacity {
            warn!(
                destination = %destination,
                queue_depth = stats.length,
                max_stream_length = self.max_stream_length,
                "Queue near capacity, oldest entries will be evicted"
            );
        }

        QUEUE_DEPTH
            .with_label_values(&[destination])
            .set(stats.length as i64);
        DLQ_DEPTH
            .with_label_values(&[destination])
            .set(stats.dlq_length as i64);

        Ok(QueueHealth {
            destination: destination.to_string(),
            queue_depth: stats.length,
            consumers: stats.consumers,
            pending_count: stats.pending,
            dlq_depth: stats.dlq_length,
            last_delivered_id: stats.last_delivered_id,
            max_stream_length: self.max_stream_length,
            near_capacity,
        })
    }

    /// Skip the current backlog
    pub async fn reset_to_latest(&self, destination: &str) -> Result<()> {
        self.move_cursor(destination, CursorPosition::Latest).await
    }

    /// Re-read everything still in the stream
    pub async fn reset_to_begin(&self, destination: &str) -> Result<()> {
        self.move_cursor(destination, CursorPosition::Beginning)
            .await
    }

    async fn move_cursor(&self, destination: &str, position: CursorPosition) -> Result<()> {
        self.store
            .ensure_group(destination)
            .await
            .context("Failed to create consumer group")?;
        self.store
            .set_cursor(destination, position)
            .await
            .context("Failed to move group cursor")?;

        info!(destination = %destination, position = ?position, "Consumer group cursor moved");
        Ok(())
    }

    /// Drop the stream and group, pending entries and backlog included
    pub async fn destroy_recreate(&self, destination: &str) -> Result<()> {
        self.store
            .recreate(destination)
            .await
            .context("Failed to recreate stream")?;

        warn!(destination = %destination, "Stream and consumer group destroyed and recreated");
        Ok(())
    }

    /// Transfer every pending entry owned by another consumer to `worker_id`
    pub async fn force_claim(&self, destination: &str, worker_id: &str) -> Result<ForceClaimReport> {
        let mut report = ForceClaimReport {
            destination: destination.to_string(),
            worker_id: worker_id.to_string(),
            scanned: 0,
            transferred: 0,
            already_owned: 0,
        };

        let mut after: Option<EntryId> = None;
        loop {
            let page = self
                .store
                .pending_entries(destination, after, FORCE_CLAIM_PAGE)
                .await
                .context("Failed to read pending entries")?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id);
            report.scanned += page.len();

            let ids: Vec<EntryId> = page
                .iter()
                .filter(|p| p.consumer != worker_id)
                .map(|p| p.id)
                .collect();
            report.already_owned += page.len() - ids.len();

            if !ids.is_empty() {
                let moved = self
                    .store
                    .transfer(destination, worker_id, &ids)
                    .await
                    .context("Failed to transfer pending entries")?;
                report.transferred += moved.len();
            }

            if page.len() < FORCE_CLAIM_PAGE {
                break;
            }
        }

        info!(
            destination = %destination,
            worker_id = %worker_id,
            scanned = report.scanned,
            transferred = report.transferred,
            "Pending entries force-claimed"
        );
        Ok(report)
    }
}
