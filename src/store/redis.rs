// ============================================================================
// Redis Delivery Store
// ============================================================================
//
// Key layout (the destination is the hash tag, so every multi-key script
// touches a single cluster slot):
//
//   {prefix}:{destination}:stream            delivery stream + consumer group
//   {prefix}:{destination}:dlq               dead-letter stream
//   {prefix}:{destination}:idem:{message_id} idempotency record -> entry id
//   {prefix}:{destination}:delivered:{id}    delivered marker
//   {prefix}:{destination}:bucket            token bucket hash (tokens, ts)
//
// Composite steps that must be atomic run as Lua scripts:
// - enqueue: idempotency check + XADD + record
// - bucket:  lazy refill + take, on the Redis server clock
// - renew: XCLAIM to self with min-idle 0, resetting the idle time
// - requeue: XADD copy + XACK + XDEL of the original
// - dead-letter: XDEL + XACK + XADD to the DLQ
//
// The last three first check XPENDING and do nothing unless the calling
// consumer still owns the entry.
//
// XREADGROUP BLOCK holds the connection for its whole timeout, so a store
// should not be shared between workers; give each worker task its own.
//
// ============================================================================

use super::{
    AppendOutcome, BucketDecision, ClaimBatch, ConsumerInfo, CursorPosition, DeliveryStore,
    PendingEntry, ReadBatch, StoreError, StoreResult, StreamStats, execute_redis_with_retry,
};
use crate::message::{EntryId, StreamEntry};
use async_trait::async_trait;
use courier_config::StoreConfig;
use courier_redis::{RedisClient, Script, StreamBatch, StreamRecord};
use std::time::Duration;
use tracing::{debug, info};

const FIELD_MESSAGE_ID: &str = "message_id";
const FIELD_PAYLOAD: &str = "payload";
const FIELD_RECORD: &str = "record";

/// KEYS: stream, idem | ARGV: max_len, ttl_secs, message_id, payload
/// Returns {1, new_id} or {0, prior_id}
const ENQUEUE_SCRIPT: &str = r#"
local prior = redis.call('GET', KEYS[2])
if prior then
  return {0, prior}
end
local id = redis.call('XADD', KEYS[1], 'MAXLEN', '~', ARGV[1], '*',
  'message_id', ARGV[3], 'payload', ARGV[4])
redis.call('SET', KEYS[2], id, 'EX', ARGV[2])
return {1, id}
"#;

/// KEYS: bucket | ARGV: capacity, refill_per_sec
/// Elapsed time refills at the stored parameters before the new ones apply.
/// Returns milliseconds to wait, 0 when a token was taken
const BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts', 'capacity', 'rate')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end
local prev_capacity = tonumber(state[3]) or capacity
local prev_rate = tonumber(state[4]) or rate
local elapsed = math.max(0, now - ts)
tokens = math.min(prev_capacity, tokens + elapsed * prev_rate / 1000)
tokens = math.min(capacity, tokens)
local wait = 0
if tokens >= 1 then
  tokens = tokens - 1
else
  wait = math.max(1, math.ceil((1 - tokens) * 1000 / rate))
end
redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', now,
  'capacity', ARGV[1], 'rate', ARGV[2])
redis.call('PEXPIRE', KEYS[1], math.ceil(capacity * 1000 / rate) + 60000)
return wait
"#;

/// KEYS: stream | ARGV: group, entry_id, consumer
/// Returns 1 when the idle time was reset, 0 when the entry is not ours
const RENEW_SCRIPT: &str = r#"
local row = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1)[1]
if not row or row[2] ~= ARGV[3] then
  return 0
end
redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[3], 0, ARGV[2], 'JUSTID')
return 1
"#;

/// KEYS: stream | ARGV: group, entry_id, consumer, max_len, message_id, payload
/// Returns the id of the copy, or nil when the entry is not ours or its data is gone
const REQUEUE_SCRIPT: &str = r#"
local row = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1)[1]
if not row or row[2] ~= ARGV[3] then
  return false
end
if #redis.call('XRANGE', KEYS[1], ARGV[2], ARGV[2]) == 0 then
  return false
end
local id = redis.call('XADD', KEYS[1], 'MAXLEN', '~', ARGV[4], '*',
  'message_id', ARGV[5], 'payload', ARGV[6])
redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
redis.call('XDEL', KEYS[1], ARGV[2])
return id
"#;

/// KEYS: stream, dlq | ARGV: group, entry_id, dlq_max_len, record, consumer
/// Returns the DLQ entry id, or nil when the entry is not ours or was already gone
const DEAD_LETTER_SCRIPT: &str = r#"
local row = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1)[1]
if not row or row[2] ~= ARGV[5] then
  return false
end
local removed = redis.call('XDEL', KEYS[1], ARGV[2])
redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
if removed == 0 then
  return false
end
return redis.call('XADD', KEYS[2], 'MAXLEN', '~', ARGV[3], '*', 'record', ARGV[4])
"#;

/// Redis Streams implementation of [`DeliveryStore`]
#[derive(Clone)]
pub struct RedisStore {
    client: RedisClient,
    prefix: String,
    group: String,
    enqueue_script: Script,
    bucket_script: Script,
    renew_script: Script,
    requeue_script: Script,
    dead_letter_script: Script,
}

impl RedisStore {
    /// Open a dedicated managed connection
    pub async fn connect(config: &StoreConfig) -> StoreResult<Self> {
        let client = RedisClient::connect(&config.redis_url).await?;
        Ok(Self::with_client(
            client,
            &config.key_prefix,
            &config.consumer_group,
        ))
    }

    pub fn with_client(client: RedisClient, prefix: &str, group: &str) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
            group: group.to_string(),
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            bucket_script: Script::new(BUCKET_SCRIPT),
            renew_script: Script::new(RENEW_SCRIPT),
            requeue_script: Script::new(REQUEUE_SCRIPT),
            dead_letter_script: Script::new(DEAD_LETTER_SCRIPT),
        }
    }

    fn key(&self, destination: &str, suffix: &str) -> String {
        format!("{}:{{{}}}:{}", self.prefix, destination, suffix)
    }

    fn stream_key(&self, destination: &str) -> String {
        self.key(destination, "stream")
    }

    fn dlq_key(&self, destination: &str) -> String {
        self.key(destination, "dlq")
    }

    fn idempotency_key(&self, destination: &str, message_id: &str) -> String {
        self.key(destination, &format!("idem:{}", message_id))
    }

    fn delivered_key(&self, destination: &str, message_id: &str) -> String {
        self.key(destination, &format!("delivered:{}", message_id))
    }

    fn bucket_key(&self, destination: &str) -> String {
        self.key(destination, "bucket")
    }
}

fn to_entry(record: StreamRecord) -> StoreResult<StreamEntry> {
    Ok(StreamEntry {
        id: record.id.parse()?,
        message_id: record.field_str(FIELD_MESSAGE_ID),
        payload: record.field(FIELD_PAYLOAD).unwrap_or_default().to_vec(),
    })
}

fn to_read_batch(batch: StreamBatch) -> StoreResult<ReadBatch> {
    Ok(ReadBatch {
        entries: batch
            .records
            .into_iter()
            .map(to_entry)
            .collect::<StoreResult<_>>()?,
        vanished: batch
            .tombstones
            .iter()
            .map(|id| id.parse())
            .collect::<Result<_, _>>()?,
    })
}

#[async_trait]
impl DeliveryStore for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        execute_redis_with_retry(&self.client, "ping", |mut c| async move { c.ping().await })
            .await?;
        Ok(())
    }

    async fn ensure_group(&self, destination: &str) -> StoreResult<bool> {
        let stream = self.stream_key(destination);
        let (stream, group) = (stream.as_str(), self.group.as_str());

        let created = execute_redis_with_retry(&self.client, "ensure_group", move |mut c| async move {
            c.xgroup_create(stream, group, "0").await
        })
        .await?;

        if created {
            info!(stream = %stream, group = %group, "Created consumer group");
        }
        Ok(created)
    }

    async fn register_consumer(&self, destination: &str, consumer: &str) -> StoreResult<()> {
        let stream = self.stream_key(destination);
        let (stream, group) = (stream.as_str(), self.group.as_str());

        execute_redis_with_retry(&self.client, "register_consumer", move |mut c| async move {
            c.xgroup_create_consumer(stream, group, consumer).await
        })
        .await?;
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
        let stream = self.stream_key(destination);
        let idem = self.idempotency_key(destination, message_id);
        let (stream, idem) = (stream.as_str(), idem.as_str());
        let ttl_secs = ttl.as_secs().max(1);
        let script = &self.enqueue_script;

        let (created, id): (i64, String) =
            execute_redis_with_retry(&self.client, "append_idempotent", move |mut c| async move {
                script
                    .key(stream)
                    .key(idem)
                    .arg(max_len)
                    .arg(ttl_secs)
                    .arg(message_id)
                    .arg(payload)
                    .invoke_async(c.connection_mut())
                    .await
            })
            .await?;

        let id: EntryId = id.parse()?;
        Ok(if created == 1 {
            AppendOutcome::Enqueued(id)
        } else {
            AppendOutcome::Duplicate(id)
        })
    }

    async fn append(
        &self,
        destination: &str,
        message_id: &str,
        payload: &[u8],
        max_len: usize,
    ) -> StoreResult<EntryId> {
        let stream = self.stream_key(destination);
        let stream = stream.as_str();
        let fields = [
            (FIELD_MESSAGE_ID, message_id.as_bytes()),
            (FIELD_PAYLOAD, payload),
        ];
        let fields = &fields[..];

        let id = execute_redis_with_retry(&self.client, "append", move |mut c| async move {
            c.xadd_capped(stream, max_len, fields).await
        })
        .await?;
        Ok(id.parse()?)
    }

    async fn read_new(
        &self,
        destination: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StoreResult<ReadBatch> {
        let stream = self.stream_key(destination);
        let (stream, group) = (stream.as_str(), self.group.as_str());
        // BLOCK 0 means "forever" to Redis; a zero timeout is sent as no BLOCK
        let block_ms = Some(block.as_millis() as u64).filter(|ms| *ms > 0);

        let batch = execute_redis_with_retry(&self.client, "read_new", move |mut c| async move {
            c.xreadgroup(stream, group, consumer, ">", count, block_ms)
                .await
        })
        .await?;
        to_read_batch(batch)
    }

    async fn read_owned(
        &self,
        destination: &str,
        consumer: &str,
        count: usize,
    ) -> StoreResult<ReadBatch> {
        let stream = self.stream_key(destination);
        let (stream, group) = (stream.as_str(), self.group.as_str());

        let batch = execute_redis_with_retry(&self.client, "read_owned", move |mut c| async move {
            c.xreadgroup(stream, group, consumer, "0", count, None).await
        })
        .await?;
        to_read_batch(batch)
    }

    async fn claim_idle(
        &self,
        destination: &str,
        consumer: &str,
        min_idle: Duration,
        cursor: EntryId,
        count: usize,
    ) -> StoreResult<ClaimBatch> {
        let stream = self.stream_key(destination);
        let (stream, group) = (stream.as_str(), self.group.as_str());
        let start = cursor.to_string();
        let start = start.as_str();
        let min_idle_ms = min_idle.as_millis() as u64;

        let reply = execute_redis_with_retry(&self.client, "claim_idle", move |mut c| async move {
            c.xautoclaim(stream, group, consumer, min_idle_ms, start, count)
                .await
        })
        .await?;

        let next_cursor = reply.next_cursor.parse()?;
        let batch = to_read_batch(reply.batch)?;
        Ok(ClaimBatch {
            next_cursor,
            entries: batch.entries,
            vanished: batch.vanished,
        })
    }

    async fn renew_claim(
        &self,
        destination: &str,
        consumer: &str,
        id: EntryId,
    ) -> StoreResult<bool> {
        let stream = self.stream_key(destination);
        let (stream, group) = (stream.as_str(), self.group.as_str());
        let id = id.to_string();
        let id = id.as_str();
        let script = &self.renew_script;

        let renewed: i64 =
            execute_redis_with_retry(&self.client, "renew_claim", move |mut c| async move {
                script
                    .key(stream)
                    .arg(group)
                    .arg(id)
                    .arg(consumer)
                    .invoke_async(c.connection_mut())
                    .await
            })
            .await?;
        Ok(renewed == 1)
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
        let stream = self.stream_key(destination);
        let (stream, group) = (stream.as_str(), self.group.as_str());
        let id = id.to_string();
        let id = id.as_str();
        let script = &self.requeue_script;

        let new_id: Option<String> =
            execute_redis_with_retry(&self.client, "requeue_owned", move |mut c| async move {
                script
                    .key(stream)
                    .arg(group)
                    .arg(id)
                    .arg(consumer)
                    .arg(max_len)
                    .arg(message_id)
                    .arg(payload)
                    .invoke_async(c.connection_mut())
                    .await
            })
            .await?;

        new_id.map(|id| id.parse().map_err(StoreError::from)).transpose()
    }

    async fn ack_delete(&self, destination: &str, id: EntryId) -> StoreResult<bool> {
        let stream = self.stream_key(destination);
        let (stream, group) = (stream.as_str(), self.group.as_str());
        let id = id.to_string();
        let id = id.as_str();

        let deleted = execute_redis_with_retry(&self.client, "ack_delete", move |mut c| async move {
            c.xack_del(stream, group, id).await
        })
        .await?;
        Ok(deleted > 0)
    }

    async fn mark_delivered(
        &self,
        destination: &str,
        message_id: &str,
        ttl: Duration,
    ) -> StoreResult<()> {
        let key = self.delivered_key(destination, message_id);
        let key = key.as_str();
        let ttl_secs = ttl.as_secs().max(1);

        execute_redis_with_retry(&self.client, "mark_delivered", move |mut c| async move {
            c.set_ex(key, "1", ttl_secs).await
        })
        .await?;
        Ok(())
    }

    async fn is_delivered(&self, destination: &str, message_id: &str) -> StoreResult<bool> {
        let key = self.delivered_key(destination, message_id);
        let key = key.as_str();

        Ok(
            execute_redis_with_retry(&self.client, "is_delivered", move |mut c| async move {
                c.exists(key).await
            })
            .await?,
        )
    }

    async fn bucket_acquire(
        &self,
        destination: &str,
        capacity: u32,
        refill_per_sec: f64,
    ) -> StoreResult<BucketDecision> {
        let key = self.bucket_key(destination);
        let key = key.as_str();
        let script = &self.bucket_script;

        let wait_ms: i64 =
            execute_redis_with_retry(&self.client, "bucket_acquire", move |mut c| async move {
                script
                    .key(key)
                    .arg(capacity)
                    .arg(refill_per_sec)
                    .invoke_async(c.connection_mut())
                    .await
            })
            .await?;

        Ok(if wait_ms <= 0 {
            BucketDecision::Granted
        } else {
            BucketDecision::Wait(Duration::from_millis(wait_ms as u64))
        })
    }

    async fn dead_letter(
        &self,
        destination: &str,
        consumer: &str,
        id: EntryId,
        record: &[u8],
        dlq_max_len: usize,
    ) -> StoreResult<Option<EntryId>> {
        let stream = self.stream_key(destination);
        let dlq = self.dlq_key(destination);
        let (stream, dlq, group) = (stream.as_str(), dlq.as_str(), self.group.as_str());
        let id = id.to_string();
        let id = id.as_str();
        let script = &self.dead_letter_script;

        let dlq_id: Option<String> =
            execute_redis_with_retry(&self.client, "dead_letter", move |mut c| async move {
                script
                    .key(stream)
                    .key(dlq)
                    .arg(group)
                    .arg(id)
                    .arg(dlq_max_len)
                    .arg(record)
                    .arg(consumer)
                    .invoke_async(c.connection_mut())
                    .await
            })
            .await?;

        dlq_id.map(|id| id.parse().map_err(StoreError::from)).transpose()
    }

    async fn dead_letters(
        &self,
        destination: &str,
        count: usize,
    ) -> StoreResult<Vec<(EntryId, Vec<u8>)>> {
        let dlq = self.dlq_key(destination);
        let dlq = dlq.as_str();

        let records = execute_redis_with_retry(&self.client, "dead_letters", move |mut c| async move {
            c.xrange(dlq, "-", "+", count).await
        })
        .await?;

        records
            .into_iter()
            .map(|r| {
                let id = r.id.parse()?;
                Ok((id, r.field(FIELD_RECORD).unwrap_or_default().to_vec()))
            })
            .collect()
    }

    async fn dead_letter_record(
        &self,
        destination: &str,
        id: EntryId,
    ) -> StoreResult<Option<Vec<u8>>> {
        let dlq = self.dlq_key(destination);
        let dlq = dlq.as_str();
        let id = id.to_string();
        let id = id.as_str();

        let records =
            execute_redis_with_retry(&self.client, "dead_letter_record", move |mut c| async move {
                c.xrange(dlq, id, id, 1).await
            })
            .await?;

        Ok(records
            .into_iter()
            .next()
            .map(|r| r.field(FIELD_RECORD).unwrap_or_default().to_vec()))
    }

    async fn remove_dead_letter(&self, destination: &str, id: EntryId) -> StoreResult<bool> {
        let dlq = self.dlq_key(destination);
        let dlq = dlq.as_str();
        let id = id.to_string();
        let id = id.as_str();

        let removed =
            execute_redis_with_retry(&self.client, "remove_dead_letter", move |mut c| async move {
                c.xdel(dlq, &[id]).await
            })
            .await?;
        Ok(removed > 0)
    }

    async fn stream_stats(&self, destination: &str) -> StoreResult<StreamStats> {
        let stream = self.stream_key(destination);
        let dlq = self.dlq_key(destination);
        let (stream, dlq, group) = (stream.as_str(), dlq.as_str(), self.group.as_str());

        let (length, dlq_length, group_info) =
            execute_redis_with_retry(&self.client, "stream_stats", move |mut c| async move {
                let length = c.xlen(stream).await?;
                let dlq_length = c.xlen(dlq).await?;
                // XINFO GROUPS errors on a missing key
                let group_info = if c.exists(stream).await? {
                    c.xinfo_group(stream, group).await?
                } else {
                    None
                };
                Ok::<_, courier_redis::RedisError>((length, dlq_length, group_info))
            })
            .await?;

        let Some(group_info) = group_info else {
            return Ok(StreamStats {
                length,
                dlq_length,
                ..StreamStats::default()
            });
        };

        let (pending, consumers) =
            execute_redis_with_retry(&self.client, "stream_consumers", move |mut c| async move {
                let pending = c.xpending_count(stream, group).await?;
                let consumers = c.xinfo_consumers(stream, group).await?;
                Ok::<_, courier_redis::RedisError>((pending, consumers))
            })
            .await?;

        Ok(StreamStats {
            length,
            dlq_length,
            pending,
            consumers: consumers
                .into_iter()
                .map(|c| ConsumerInfo {
                    name: c.name,
                    pending: c.pending,
                    idle_ms: c.idle_ms,
                })
                .collect(),
            last_delivered_id: Some(group_info.last_delivered_id.parse()?),
        })
    }

    async fn pending_entries(
        &self,
        destination: &str,
        after: Option<EntryId>,
        count: usize,
    ) -> StoreResult<Vec<PendingEntry>> {
        let stream = self.stream_key(destination);
        let (stream, group) = (stream.as_str(), self.group.as_str());
        // "(" makes the start exclusive
        let start = after
            .map(|id| format!("({}", id))
            .unwrap_or_else(|| "-".to_string());
        let start = start.as_str();

        let rows = execute_redis_with_retry(&self.client, "pending_entries", move |mut c| async move {
            c.xpending_range(stream, group, start, "+", count).await
        })
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(PendingEntry {
                    id: row.id.parse()?,
                    consumer: row.consumer,
                    idle_ms: row.idle_ms,
                    deliveries: row.deliveries,
                })
            })
            .collect()
    }

    async fn transfer(
        &self,
        destination: &str,
        consumer: &str,
        ids: &[EntryId],
    ) -> StoreResult<Vec<EntryId>> {
        let stream = self.stream_key(destination);
        let (stream, group) = (stream.as_str(), self.group.as_str());
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        let ids = &ids[..];

        let moved = execute_redis_with_retry(&self.client, "transfer", move |mut c| async move {
            c.xclaim_ids(stream, group, consumer, 0, ids).await
        })
        .await?;

        debug!(stream = %stream, consumer = %consumer, moved = moved.len(), "Transferred pending entries");
        moved
            .iter()
            .map(|id| id.parse().map_err(StoreError::from))
            .collect()
    }

    async fn set_cursor(&self, destination: &str, position: CursorPosition) -> StoreResult<()> {
        let stream = self.stream_key(destination);
        let (stream, group) = (stream.as_str(), self.group.as_str());
        let id = match position {
            CursorPosition::Latest => "$",
            CursorPosition::Beginning => "0",
        };

        execute_redis_with_retry(&self.client, "set_cursor", move |mut c| async move {
            c.xgroup_setid(stream, group, id).await
        })
        .await?;
        Ok(())
    }

    async fn recreate(&self, destination: &str) -> StoreResult<()> {
        let stream = self.stream_key(destination);
        let (stream, group) = (stream.as_str(), self.group.as_str());

        execute_redis_with_retry(&self.client, "recreate", move |mut c| async move {
            c.del(&[stream]).await?;
            c.xgroup_create(stream, group, "0").await
        })
        .await?;
        Ok(())
    }
}
