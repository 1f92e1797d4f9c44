// ============================================================================
// In-Memory Delivery Store
// ============================================================================
//
// Single-process implementation of the store with the same observable
// semantics as the Redis one: consumer groups with a cursor and a pending
// ledger, exactly capped streams, TTL'd idempotency records and
// delivered markers, and a token bucket per destination.
//
// Expired idempotency records and delivered markers are swept lazily from the
// write paths, at most once per SWEEP_INTERVAL per destination.
//
// Time comes from tokio's clock, so tests can run it with a paused clock.
//
// ============================================================================

use super::{
    AppendOutcome, BucketDecision, ClaimBatch, ConsumerInfo, CursorPosition, DeliveryStore,
    PendingEntry, ReadBatch, StoreError, StoreResult, StreamStats,
};
use crate::delivery_worker::rate_limiting::TokenBucket;
use crate::message::{EntryId, StreamEntry};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct StoredEntry {
    message_id: String,
    payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct PendingState {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    cursor: EntryId,
    pending: BTreeMap<EntryId, PendingState>,
    /// Consumer name -> last time it interacted with the group
    consumers: BTreeMap<String, Instant>,
}

impl GroupState {
    fn touch(&mut self, consumer: &str, now: Instant) {
        self.consumers.insert(consumer.to_string(), now);
    }

    fn owned_by(&self, id: &EntryId, consumer: &str) -> bool {
        self.pending.get(id).is_some_and(|state| state.consumer == consumer)
    }
}

#[derive(Debug, Default)]
struct Log {
    entries: BTreeMap<EntryId, StoredEntry>,
    last_id: EntryId,
}

impl Log {
    fn next_id(&mut self) -> EntryId {
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let id = if now_ms > self.last_id.ms {
            EntryId::new(now_ms, 0)
        } else {
            EntryId::new(self.last_id.ms, self.last_id.seq + 1)
        };
        self.last_id = id;
        id
    }

    fn push(&mut self, entry: StoredEntry, max_len: usize) -> EntryId {
        let id = self.next_id();
        self.entries.insert(id, entry);
        while self.entries.len() > max_len {
            self.entries.pop_first();
        }
        id
    }
}

#[derive(Debug, Default)]
struct Destination {
    stream: Log,
    dlq: Log,
    group: Option<GroupState>,
    idempotency: HashMap<String, (EntryId, Instant)>,
    delivered: HashMap<String, Instant>,
    next_sweep: Option<Instant>,
    bucket: Option<TokenBucket>,
}

impl Destination {
    fn group_mut(&mut self, name: &str) -> StoreResult<&mut GroupState> {
        self.group
            .as_mut()
            .ok_or_else(|| StoreError::NoGroup(format!("no consumer group for {}", name)))
    }

    fn sweep_expired(&mut self, now: Instant) {
        if self.next_sweep.is_some_and(|at| now < at) {
            return;
        }
        self.idempotency
            .retain(|_, (_, expires_at)| !expired(expires_at, now));
        self.delivered.retain(|_, expires_at| !expired(expires_at, now));
        self.next_sweep = Some(now + SWEEP_INTERVAL);
    }

    fn take_new(
        &mut self,
        destination: &str,
        consumer: &str,
        count: usize,
        now: Instant,
    ) -> StoreResult<ReadBatch> {
        let Destination { stream, group, .. } = self;
        let group = group
            .as_mut()
            .ok_or_else(|| StoreError::NoGroup(format!("no consumer group for {}", destination)))?;
        group.touch(consumer, now);

        let mut batch = ReadBatch::default();
        let start = std::ops::Bound::Excluded(group.cursor);
        for (id, entry) in stream
            .entries
            .range((start, std::ops::Bound::Unbounded))
            .take(count)
        {
            group.pending.insert(
                *id,
                PendingState {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            batch.entries.push(StreamEntry {
                id: *id,
                message_id: Some(entry.message_id.clone()),
                payload: entry.payload.clone(),
            });
        }
        if let Some(last) = batch.entries.last() {
            group.cursor = last.id;
        }
        Ok(batch)
    }
}

/// In-process [`DeliveryStore`]
#[derive(Default)]
pub struct MemoryStore {
    destinations: Mutex<HashMap<String, Destination>>,
    appended: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn expired(expires_at: &Instant, now: Instant) -> bool {
    *expires_at <= now
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn ensure_group(&self, destination: &str) -> StoreResult<bool> {
        let mut destinations = self.destinations.lock().await;
        let dest = destinations.entry(destination.to_string()).or_default();
        if dest.group.is_some() {
            return Ok(false);
        }
        dest.group = Some(GroupState::default());
        Ok(true)
    }

    async fn register_consumer(&self, destination: &str, consumer: &str) -> StoreResult<()> {
        let mut destinations = self.destinations.lock().await;
        let dest = destinations.entry(destination.to_string()).or_default();
        dest.group_mut(destination)?.touch(consumer, Instant::now());
        Ok(())
    }

    async fn append_idempotent(
        &self,
        destination: &str,
        message_id: &str,
        payload: &[u8],
        max_len: usize,
        ttl: Duration,
    ) -> StoreResult<AppendOutcome> {
        let now = Instant::now();
        let mut destinations = self.destinations.lock().await;
        let dest = destinations.entry(destination.to_string()).or_default();
        dest.sweep_expired(now);

        if let Some((prior, expires_at)) = dest.idempotency.get(message_id)
            && !expired(expires_at, now)
        {
            return Ok(AppendOutcome::Duplicate(*prior));
        }

        let id = dest.stream.push(
            StoredEntry {
                message_id: message_id.to_string(),
                payload: payload.to_vec(),
            },
            max_len,
        );
        dest.idempotency
            .insert(message_id.to_string(), (id, now + ttl));
        drop(destinations);

        self.appended.notify_waiters();
        Ok(AppendOutcome::Enqueued(id))
    }

    async fn append(
        &self,
        destination: &str,
        message_id: &str,
        payload: &[u8],
        max_len: usize,
    ) -> StoreResult<EntryId> {
        let mut destinations = self.destinations.lock().await;
        let dest = destinations.entry(destination.to_string()).or_default();
        let id = dest.stream.push(
            StoredEntry {
                message_id: message_id.to_string(),
                payload: payload.to_vec(),
            },
            max_len,
        );
        drop(destinations);

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_new(
        &self,
        destination: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StoreResult<ReadBatch> {
        let deadline = Instant::now() + block;

        loop {
            // Register interest before looking, so an append in between is not missed
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            {
                let mut destinations = self.destinations.lock().await;
                let dest = destinations.entry(destination.to_string()).or_default();
                let batch = dest.take_new(destination, consumer, count, Instant::now())?;
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }

            if Instant::now() >= deadline {
                return Ok(ReadBatch::default());
            }
            let _ = tokio::time::timeout_at(deadline, appended).await;
        }
    }

    async fn read_owned(
        &self,
        destination: &str,
        consumer: &str,
        count: usize,
    ) -> StoreResult<ReadBatch> {
        let now = Instant::now();
        let mut destinations = self.destinations.lock().await;
        let dest = destinations.entry(destination.to_string()).or_default();
        let Destination { stream, group, .. } = dest;
        let group = group
            .as_mut()
            .ok_or_else(|| StoreError::NoGroup(format!("no consumer group for {}", destination)))?;
        group.touch(consumer, now);

        let mut batch = ReadBatch::default();
        for (id, _) in group.pending.iter().filter(|(_, s)| s.consumer == consumer) {
            if batch.entries.len() + batch.vanished.len() >= count {
                break;
            }
            match stream.entries.get(id) {
                Some(entry) => batch.entries.push(StreamEntry {
                    id: *id,
                    message_id: Some(entry.message_id.clone()),
                    payload: entry.payload.clone(),
                }),
                None => batch.vanished.push(*id),
            }
        }
        Ok(batch)
    }

    async fn claim_idle(
        &self,
        destination: &str,
        consumer: &str,
        min_idle: Duration,
        cursor: EntryId,
        count: usize,
    ) -> StoreResult<ClaimBatch> {
        let now = Instant::now();
        let mut destinations = self.destinations.lock().await;
        let dest = destinations.entry(destination.to_string()).or_default();
        let Destination { stream, group, .. } = dest;
        let group = group
            .as_mut()
            .ok_or_else(|| StoreError::NoGroup(format!("no consumer group for {}", destination)))?;
        group.touch(consumer, now);

        let mut batch = ClaimBatch::default();
        let mut taken = 0;
        let mut next_cursor = EntryId::ZERO;
        let candidates: Vec<EntryId> = group.pending.range(cursor..).map(|(id, _)| *id).collect();

        for id in candidates {
            if taken >= count {
                next_cursor = id;
                break;
            }
            let Some(state) = group.pending.get_mut(&id) else {
                continue;
            };
            if now.saturating_duration_since(state.delivered_at) < min_idle {
                continue;
            }
            taken += 1;
            match stream.entries.get(&id) {
                Some(entry) => {
                    state.consumer = consumer.to_string();
                    state.delivered_at = now;
                    state.deliveries += 1;
                    batch.entries.push(StreamEntry {
                        id,
                        message_id: Some(entry.message_id.clone()),
                        payload: entry.payload.clone(),
                    });
                }
                None => {
                    // Data is gone; drop it from the ledger and report it
                    group.pending.remove(&id);
                    batch.vanished.push(id);
                }
            }
        }

        batch.next_cursor = next_cursor;
        Ok(batch)
    }

    async fn renew_claim(
        &self,
        destination: &str,
        consumer: &str,
        id: EntryId,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let mut destinations = self.destinations.lock().await;
        let dest = destinations.entry(destination.to_string()).or_default();
        let Destination { stream, group, .. } = dest;
        let group = group
            .as_mut()
            .ok_or_else(|| StoreError::NoGroup(format!("no consumer group for {}", destination)))?;
        if !stream.entries.contains_key(&id) {
            return Ok(false);
        }
        let Some(state) = group
            .pending
            .get_mut(&id)
            .filter(|state| state.consumer == consumer)
        else {
            return Ok(false);
        };
        state.delivered_at = now;
        group.touch(consumer, now);
        Ok(true)
    }

    async fn requeue_owned(
        &self,
        destination: &str,
        consumer: &str,
        id: EntryId,
        message_id: &str,
        payload: &[u8],
        max_len: usize,
    ) -> StoreResult<Option<EntryId>> {
        let mut destinations = self.destinations.lock().await;
        let dest = destinations.entry(destination.to_string()).or_default();
        if !dest.group_mut(destination)?.owned_by(&id, consumer)
            || !dest.stream.entries.contains_key(&id)
        {
            return Ok(None);
        }

        let new_id = dest.stream.push(
            StoredEntry {
                message_id: message_id.to_string(),
                payload: payload.to_vec(),
            },
            max_len,
        );
        dest.group_mut(destination)?.pending.remove(&id);
        dest.stream.entries.remove(&id);
        drop(destinations);

        self.appended.notify_waiters();
        Ok(Some(new_id))
    }

    async fn ack_delete(&self, destination: &str, id: EntryId) -> StoreResult<bool> {
        let mut destinations = self.destinations.lock().await;
        let Some(dest) = destinations.get_mut(destination) else {
            return Ok(false);
        };
        if let Some(group) = dest.group.as_mut() {
            group.pending.remove(&id);
        }
        Ok(dest.stream.entries.remove(&id).is_some())
    }

    async fn mark_delivered(
        &self,
        destination: &str,
        message_id: &str,
        ttl: Duration,
    ) -> StoreResult<()> {
        let now = Instant::now();
        let mut destinations = self.destinations.lock().await;
        let dest = destinations.entry(destination.to_string()).or_default();
        dest.sweep_expired(now);
        dest.delivered.insert(message_id.to_string(), now + ttl);
        Ok(())
    }

    async fn is_delivered(&self, destination: &str, message_id: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let destinations = self.destinations.lock().await;
        Ok(destinations
            .get(destination)
            .and_then(|dest| dest.delivered.get(message_id))
            .is_some_and(|expires_at| !expired(expires_at, now)))
    }

    async fn bucket_acquire(
        &self,
        destination: &str,
        capacity: u32,
        refill_per_sec: f64,
    ) -> StoreResult<BucketDecision> {
        let now = Instant::now();
        let mut destinations = self.destinations.lock().await;
        let dest = destinations.entry(destination.to_string()).or_default();
        let bucket = dest
            .bucket
            .get_or_insert_with(|| TokenBucket::new(capacity, refill_per_sec, now));
        bucket.reconfigure(capacity, refill_per_sec, now);
        Ok(bucket.try_acquire(now))
    }

    async fn dead_letter(
        &self,
        destination: &str,
        consumer: &str,
        id: EntryId,
        record: &[u8],
        dlq_max_len: usize,
    ) -> StoreResult<Option<EntryId>> {
        let mut destinations = self.destinations.lock().await;
        let dest = destinations.entry(destination.to_string()).or_default();

        let group = dest.group_mut(destination)?;
        if !group.owned_by(&id, consumer) {
            return Ok(None);
        }
        group.pending.remove(&id);
        if dest.stream.entries.remove(&id).is_none() {
            return Ok(None);
        }

        let dlq_id = dest.dlq.push(
            StoredEntry {
                message_id: String::new(),
                payload: record.to_vec(),
            },
            dlq_max_len,
        );
        Ok(Some(dlq_id))
    }

    async fn dead_letters(
        &self,
        destination: &str,
        count: usize,
    ) -> StoreResult<Vec<(EntryId, Vec<u8>)>> {
        let destinations = self.destinations.lock().await;
        Ok(destinations
            .get(destination)
            .map(|dest| {
                dest.dlq
                    .entries
                    .iter()
                    .take(count)
                    .map(|(id, entry)| (*id, entry.payload.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn dead_letter_record(
        &self,
        destination: &str,
        id: EntryId,
    ) -> StoreResult<Option<Vec<u8>>> {
        let destinations = self.destinations.lock().await;
        Ok(destinations
            .get(destination)
            .and_then(|dest| dest.dlq.entries.get(&id))
            .map(|entry| entry.payload.clone()))
    }

    async fn remove_dead_letter(&self, destination: &str, id: EntryId) -> StoreResult<bool> {
        let mut destinations = self.destinations.lock().await;
        Ok(destinations
            .get_mut(destination)
            .is_some_and(|dest| dest.dlq.entries.remove(&id).is_some()))
    }

    async fn stream_stats(&self, destination: &str) -> StoreResult<StreamStats> {
        let now = Instant::now();
        let destinations = self.destinations.lock().await;
        let Some(dest) = destinations.get(destination) else {
            return Ok(StreamStats::default());
        };

        let mut stats = StreamStats {
            length: dest.stream.entries.len() as u64,
            dlq_length: dest.dlq.entries.len() as u64,
            ..StreamStats::default()
        };

        if let Some(group) = &dest.group {
            stats.pending = group.pending.len() as u64;
            stats.last_delivered_id = Some(group.cursor);
            stats.consumers = group
                .consumers
                .iter()
                .map(|(name, seen)| ConsumerInfo {
                    name: name.clone(),
                    pending: group
                        .pending
                        .values()
                        .filter(|p| &p.consumer == name)
                        .count() as u64,
                    idle_ms: now.saturating_duration_since(*seen).as_millis() as u64,
                })
                .collect();
        }
        Ok(stats)
    }

    async fn pending_entries(
        &self,
        destination: &str,
        after: Option<EntryId>,
        count: usize,
    ) -> StoreResult<Vec<PendingEntry>> {
        let now = Instant::now();
        let mut destinations = self.destinations.lock().await;
        let dest = destinations.entry(destination.to_string()).or_default();
        let group = dest.group_mut(destination)?;

        let start = match after {
            Some(id) => std::ops::Bound::Excluded(id),
            None => std::ops::Bound::Unbounded,
        };
        Ok(group
            .pending
            .range((start, std::ops::Bound::Unbounded))
            .take(count)
            .map(|(id, state)| PendingEntry {
                id: *id,
                consumer: state.consumer.clone(),
                idle_ms: now.saturating_duration_since(state.delivered_at).as_millis() as u64,
                deliveries: state.deliveries,
            })
            .collect())
    }

    async fn transfer(
        &self,
        destination: &str,
        consumer: &str,
        ids: &[EntryId],
    ) -> StoreResult<Vec<EntryId>> {
        let now = Instant::now();
        let mut destinations = self.destinations.lock().await;
        let dest = destinations.entry(destination.to_string()).or_default();
        let Destination { stream, group, .. } = dest;
        let group = group
            .as_mut()
            .ok_or_else(|| StoreError::NoGroup(format!("no consumer group for {}", destination)))?;
        group.touch(consumer, now);

        let mut moved = Vec::new();
        for id in ids {
            if !stream.entries.contains_key(id) {
                group.pending.remove(id);
                continue;
            }
            if let Some(state) = group.pending.get_mut(id) {
                state.consumer = consumer.to_string();
                state.delivered_at = now;
                state.deliveries += 1;
                moved.push(*id);
            }
        }
        Ok(moved)
    }

    async fn set_cursor(&self, destination: &str, position: CursorPosition) -> StoreResult<()> {
        let mut destinations = self.destinations.lock().await;
        let dest = destinations.entry(destination.to_string()).or_default();
        let last_id = dest.stream.last_id;
        let group = dest.group_mut(destination)?;
        group.cursor = match position {
            CursorPosition::Latest => last_id,
            CursorPosition::Beginning => EntryId::ZERO,
        };
        Ok(())
    }

    async fn recreate(&self, destination: &str) -> StoreResult<()> {
        let mut destinations = self.destinations.lock().await;
        let dest = destinations.entry(destination.to_string()).or_default();
        dest.stream.entries.clear();
        dest.group = Some(GroupState::default());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 100;

    async fn store_with_group(destination: &str) -> MemoryStore {
        let store = MemoryStore::new();
        store.ensure_group(destination).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_idempotent_append_returns_prior_id() {
        let store = store_with_group("d").await;
        let ttl = Duration::from_secs(60);

        let first = store.append_idempotent("d", "m1", b"a", MAX, ttl).await.unwrap();
        let second = store.append_idempotent("d", "m1", b"b", MAX, ttl).await.unwrap();

        assert!(matches!(first, AppendOutcome::Enqueued(_)));
        assert_eq!(second, AppendOutcome::Duplicate(first.entry_id()));
        assert_eq!(store.stream_stats("d").await.unwrap().length, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idempotency_record_expires() {
        let store = store_with_group("d").await;
        let ttl = Duration::from_secs(10);

        store.append_idempotent("d", "m1", b"a", MAX, ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        let again = store.append_idempotent("d", "m1", b"a", MAX, ttl).await.unwrap();

        assert!(matches!(again, AppendOutcome::Enqueued(_)));
        assert_eq!(store.stream_stats("d").await.unwrap().length, 2);
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest() {
        let store = store_with_group("d").await;
        let first = store.append("d", "m1", b"1", 2).await.unwrap();
        store.append("d", "m2", b"2", 2).await.unwrap();
        store.append("d", "m3", b"3", 2).await.unwrap();

        let batch = store.read_new("d", "c", 10, Duration::ZERO).await.unwrap();
        let ids: Vec<_> = batch.entries.iter().map(|e| e.message_id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["m2", "m3"]);
        assert!(batch.entries.iter().all(|e| e.id != first));
    }

    #[tokio::test]
    async fn test_read_new_advances_cursor_and_records_owner() {
        let store = store_with_group("d").await;
        store.append("d", "m1", b"1", MAX).await.unwrap();
        store.append("d", "m2", b"2", MAX).await.unwrap();

        let a = store.read_new("d", "c1", 1, Duration::ZERO).await.unwrap();
        let b = store.read_new("d", "c2", 10, Duration::ZERO).await.unwrap();
        assert_eq!(a.entries.len(), 1);
        assert_eq!(b.entries.len(), 1);
        assert_ne!(a.entries[0].id, b.entries[0].id);

        let owned = store.read_owned("d", "c1", 10).await.unwrap();
        assert_eq!(owned.entries, a.entries);

        let stats = store.stream_stats("d").await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.last_delivered_id, Some(b.entries[0].id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_wakes_on_append() {
        let store = std::sync::Arc::new(store_with_group("d").await);
        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .read_new("d", "c1", 10, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        store.append("d", "m1", b"1", MAX).await.unwrap();

        let batch = reader.await.unwrap();
        assert_eq!(batch.entries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_times_out_empty() {
        let store = store_with_group("d").await;
        let batch = store
            .read_new("d", "c1", 10, Duration::from_millis(250))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_idle_respects_threshold_and_reports_vanished() {
        let store = store_with_group("d").await;
        let keep = store.append("d", "m1", b"1", MAX).await.unwrap();
        let gone = store.append("d", "m2", b"2", MAX).await.unwrap();
        store.read_new("d", "dead", 10, Duration::ZERO).await.unwrap();

        let early = store
            .claim_idle("d", "alive", Duration::from_secs(30), EntryId::ZERO, 10)
            .await
            .unwrap();
        assert!(early.entries.is_empty());

        // Simulate data loss for one pending entry
        store.destinations.lock().await.get_mut("d").unwrap().stream.entries.remove(&gone);
        tokio::time::advance(Duration::from_secs(31)).await;

        let claimed = store
            .claim_idle("d", "alive", Duration::from_secs(30), EntryId::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(claimed.entries.len(), 1);
        assert_eq!(claimed.entries[0].id, keep);
        assert_eq!(claimed.vanished, vec![gone]);
        assert!(claimed.next_cursor.is_zero());

        let pending = store.pending_entries("d", None, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].consumer, "alive");
        assert_eq!(pending[0].deliveries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_cursor_pages_through_ledger() {
        let store = store_with_group("d").await;
        for i in 0..3 {
            store.append("d", &format!("m{}", i), b"x", MAX).await.unwrap();
        }
        store.read_new("d", "dead", 10, Duration::ZERO).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;

        let first = store
            .claim_idle("d", "c", Duration::ZERO, EntryId::ZERO, 2)
            .await
            .unwrap();
        assert_eq!(first.entries.len(), 2);
        assert!(!first.next_cursor.is_zero());

        let rest = store
            .claim_idle("d", "c", Duration::ZERO, first.next_cursor, 2)
            .await
            .unwrap();
        assert_eq!(rest.entries.len(), 1);
        assert!(rest.next_cursor.is_zero());
    }

    #[tokio::test]
    async fn test_ack_delete_is_idempotent() {
        let store = store_with_group("d").await;
        store.append("d", "m1", b"1", MAX).await.unwrap();
        let batch = store.read_new("d", "c", 10, Duration::ZERO).await.unwrap();
        let id = batch.entries[0].id;

        assert!(store.ack_delete("d", id).await.unwrap());
        assert!(!store.ack_delete("d", id).await.unwrap());
        assert!(!store.ack_delete("unknown", id).await.unwrap());

        let stats = store.stream_stats("d").await.unwrap();
        assert_eq!((stats.length, stats.pending), (0, 0));
    }

    #[tokio::test]
    async fn test_dead_letter_moves_entry_once() {
        let store = store_with_group("d").await;
        store.append("d", "m1", b"1", MAX).await.unwrap();
        let id = store.read_new("d", "c", 10, Duration::ZERO).await.unwrap().entries[0].id;

        let dlq_id = store.dead_letter("d", "c", id, b"{\"r\":1}", MAX).await.unwrap();
        assert!(dlq_id.is_some());
        assert!(store.dead_letter("d", "c", id, b"{}", MAX).await.unwrap().is_none());

        let stats = store.stream_stats("d").await.unwrap();
        assert_eq!((stats.length, stats.dlq_length, stats.pending), (0, 1, 0));
        assert_eq!(
            store.dead_letter_record("d", dlq_id.unwrap()).await.unwrap().unwrap(),
            b"{\"r\":1}".to_vec()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_settling_steps_require_ownership() {
        let store = store_with_group("d").await;
        store.append("d", "m1", b"1", MAX).await.unwrap();
        let id = store.read_new("d", "a", 10, Duration::ZERO).await.unwrap().entries[0].id;

        tokio::time::advance(Duration::from_secs(2)).await;
        let claimed = store
            .claim_idle("d", "b", Duration::from_secs(1), EntryId::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(claimed.entries.len(), 1);

        // "a" lost the entry to "b"; none of its steps may touch it
        assert!(!store.renew_claim("d", "a", id).await.unwrap());
        assert!(store.requeue_owned("d", "a", id, "m1", b"1", MAX).await.unwrap().is_none());
        assert!(store.dead_letter("d", "a", id, b"{}", MAX).await.unwrap().is_none());

        let stats = store.stream_stats("d").await.unwrap();
        assert_eq!((stats.length, stats.pending, stats.dlq_length), (1, 1, 0));

        let copy = store.requeue_owned("d", "b", id, "m1", b"2", MAX).await.unwrap();
        let copy = copy.unwrap();
        assert!(copy > id);
        let stats = store.stream_stats("d").await.unwrap();
        assert_eq!((stats.length, stats.pending), (1, 0));
        assert!(store.dead_letter("d", "b", id, b"{}", MAX).await.unwrap().is_none());

        let batch = store.read_new("d", "b", 10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.entries[0].id, copy);
        assert_eq!(batch.entries[0].payload, b"2".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_claim_resets_idle_time() {
        let store = store_with_group("d").await;
        store.append("d", "m1", b"1", MAX).await.unwrap();
        let id = store.read_new("d", "a", 10, Duration::ZERO).await.unwrap().entries[0].id;

        tokio::time::advance(Duration::from_millis(900)).await;
        assert!(store.renew_claim("d", "a", id).await.unwrap());
        tokio::time::advance(Duration::from_millis(900)).await;

        let claimed = store
            .claim_idle("d", "b", Duration::from_secs(1), EntryId::ZERO, 10)
            .await
            .unwrap();
        assert!(claimed.entries.is_empty());
        assert_eq!(store.pending_entries("d", None, 10).await.unwrap()[0].consumer, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_records_are_swept() {
        let store = store_with_group("d").await;
        let ttl = Duration::from_secs(1);
        for i in 0..1000 {
            let id = format!("m{}", i);
            store.append_idempotent("d", &id, b"x", 10_000, ttl).await.unwrap();
            store.mark_delivered("d", &id, ttl).await.unwrap();
        }

        tokio::time::advance(Duration::from_secs(3600)).await;
        for i in 0..10 {
            let id = format!("n{}", i);
            store.append_idempotent("d", &id, b"x", 10_000, ttl).await.unwrap();
            store.mark_delivered("d", &id, ttl).await.unwrap();
        }

        let destinations = store.destinations.lock().await;
        let dest = destinations.get("d").unwrap();
        assert_eq!(dest.idempotency.len(), 10);
        assert_eq!(dest.delivered.len(), 10);
    }

    #[tokio::test]
    async fn test_reads_without_group_fail_with_no_group() {
        let store = MemoryStore::new();
        let err = store
            .read_new("d", "c", 10, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.is_no_group());
    }

    #[tokio::test]
    async fn test_set_cursor_and_recreate() {
        let store = store_with_group("d").await;
        store.append("d", "m1", b"1", MAX).await.unwrap();
        store.append("d", "m2", b"2", MAX).await.unwrap();

        store.set_cursor("d", CursorPosition::Latest).await.unwrap();
        assert!(store.read_new("d", "c", 10, Duration::ZERO).await.unwrap().is_empty());

        store.set_cursor("d", CursorPosition::Beginning).await.unwrap();
        assert_eq!(store.read_new("d", "c", 10, Duration::ZERO).await.unwrap().entries.len(), 2);

        store.recreate("d").await.unwrap();
        let stats = store.stream_stats("d").await.unwrap();
        assert_eq!((stats.length, stats.pending), (0, 0));
        assert!(stats.consumers.is_empty());
    }
}
