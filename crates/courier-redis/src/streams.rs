//! Redis Streams and consumer group support
//!
//! Every reply is parsed from raw [`Value`]s. RESP2 flat arrays and RESP3 maps
//! are both accepted, and trailing elements a command grew in later server
//! versions are ignored.

use crate::{RedisClient, Result, shape_error};
use redis::Value;
use std::collections::HashMap;

/// Entry in a Redis Stream (binary values)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub id: String,
    pub fields: HashMap<String, Vec<u8>>,
}

impl StreamRecord {
    /// Field value as bytes
    pub fn field(&self, name: &str) -> Option<&[u8]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    /// Field value as (lossy) UTF-8
    pub fn field_str(&self, name: &str) -> Option<String> {
        self.fields
            .get(name)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }
}

/// Entries returned by a read or claim
///
/// `tombstones` lists ids that are still in the pending ledger but whose data
/// was already deleted from the stream (Redis reports them with a nil body).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamBatch {
    pub records: Vec<StreamRecord>,
    pub tombstones: Vec<String>,
}

impl StreamBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.tombstones.is_empty()
    }
}

/// Normalized `XAUTOCLAIM` reply: `(next_cursor, claimed entries)`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimReply {
    /// "0-0" once the whole pending ledger has been scanned
    pub next_cursor: String,
    pub batch: StreamBatch,
}

/// One row of `XPENDING key group start end count`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub deliveries: u64,
}

/// One row of `XINFO CONSUMERS`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub name: String,
    pub pending: u64,
    pub idle_ms: u64,
}

/// One row of `XINFO GROUPS`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub name: String,
    pub consumers: u64,
    pub pending: u64,
    pub last_delivered_id: String,
}

impl RedisClient {
    // ============================================================================
    // Stream Operations
    // ============================================================================

    /// XADD key MAXLEN ~ max_len * field value ...
    ///
    /// Approximate trimming: Redis evicts the oldest entries in whole macro
    /// nodes, so the stream may briefly exceed `max_len` by a small amount.
    pub async fn xadd_capped(
        &mut self,
        key: &str,
        max_len: usize,
        fields: &[(&str, &[u8])],
    ) -> Result<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(key).arg("MAXLEN").arg("~").arg(max_len).arg("*");
        for (name, value) in fields {
            cmd.arg(*name).arg(*value);
        }
        cmd.query_async(self.connection_mut()).await
    }

    /// XLEN - Get stream length
    pub async fn xlen(&mut self, key: &str) -> Result<u64> {
        redis::cmd("XLEN")
            .arg(key)
            .query_async(self.connection_mut())
            .await
    }

    /// XRANGE key start end COUNT count
    pub async fn xrange(
        &mut self,
        key: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<StreamRecord>> {
        let value: Value = redis::cmd("XRANGE")
            .arg(key)
            .arg(start)
            .arg(end)
            .arg("COUNT")
            .arg(count)
            .query_async(self.connection_mut())
            .await?;
        Ok(parse_entries(&value)?.records)
    }

    /// XDEL - Delete stream entries
    pub async fn xdel(&mut self, key: &str, ids: &[&str]) -> Result<i64> {
        redis::cmd("XDEL")
            .arg(key)
            .arg(ids)
            .query_async(self.connection_mut())
            .await
    }

    /// XACK + XDEL in one MULTI/EXEC
    ///
    /// Returns the number of entries deleted from the stream (0 when the entry
    /// was already gone).
    pub async fn xack_del(&mut self, key: &str, group: &str, id: &str) -> Result<i64> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("XACK").arg(key).arg(group).arg(id).ignore();
        pipe.cmd("XDEL").arg(key).arg(id);

        let (deleted,): (i64,) = pipe.query_async(self.connection_mut()).await?;
        Ok(deleted)
    }

    // ============================================================================
    // Consumer Group Operations
    // ============================================================================

    /// XGROUP CREATE key group start MKSTREAM
    ///
    /// Returns false if the group already existed.
    pub async fn xgroup_create(&mut self, key: &str, group: &str, start: &str) -> Result<bool> {
        let result: Result<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(group)
            .arg(start)
            .arg("MKSTREAM")
            .query_async(self.connection_mut())
            .await;

        match result {
            Ok(()) => Ok(true),
            Err(e) if crate::is_busy_group(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// XGROUP CREATECONSUMER key group consumer
    ///
    /// Makes the consumer visible in `XINFO CONSUMERS` before its first read.
    pub async fn xgroup_create_consumer(
        &mut self,
        key: &str,
        group: &str,
        consumer: &str,
    ) -> Result<bool> {
        let created: i64 = redis::cmd("XGROUP")
            .arg("CREATECONSUMER")
            .arg(key)
            .arg(group)
            .arg(consumer)
            .query_async(self.connection_mut())
            .await?;
        Ok(created == 1)
    }

    /// XGROUP SETID key group id
    pub async fn xgroup_setid(&mut self, key: &str, group: &str, id: &str) -> Result<()> {
        redis::cmd("XGROUP")
            .arg("SETID")
            .arg(key)
            .arg(group)
            .arg(id)
            .query_async(self.connection_mut())
            .await
    }

    /// XREADGROUP GROUP group consumer [COUNT n] [BLOCK ms] STREAMS key id
    ///
    /// `id` is ">" for never-delivered entries, or "0" to re-read this
    /// consumer's own pending entries. Returns an empty batch on timeout.
    pub async fn xreadgroup(
        &mut self,
        key: &str,
        group: &str,
        consumer: &str,
        id: &str,
        count: usize,
        block_ms: Option<u64>,
    ) -> Result<StreamBatch> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer);
        cmd.arg("COUNT").arg(count);
        if let Some(block_ms) = block_ms {
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS").arg(key).arg(id);

        let value: Value = cmd.query_async(self.connection_mut()).await?;
        parse_read_reply(&value)
    }

    /// XAUTOCLAIM key group consumer min_idle start COUNT count
    pub async fn xautoclaim(
        &mut self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        start: &str,
        count: usize,
    ) -> Result<ClaimReply> {
        let value: Value = redis::cmd("XAUTOCLAIM")
            .arg(key)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(start)
            .arg("COUNT")
            .arg(count)
            .query_async(self.connection_mut())
            .await?;
        parse_claim_reply(&value)
    }

    /// XCLAIM key group consumer min_idle id... JUSTID
    ///
    /// Returns the ids whose ownership actually moved.
    pub async fn xclaim_ids(
        &mut self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[&str],
    ) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let value: Value = redis::cmd("XCLAIM")
            .arg(key)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(ids)
            .arg("JUSTID")
            .query_async(self.connection_mut())
            .await?;
        match &value {
            Value::Array(items) | Value::Set(items) => items.iter().map(as_string).collect(),
            Value::Nil => Ok(Vec::new()),
            other => Err(shape_error("XCLAIM reply", format!("{other:?}"))),
        }
    }

    /// XPENDING key group (summary form), returns the ledger size
    pub async fn xpending_count(&mut self, key: &str, group: &str) -> Result<u64> {
        let value: Value = redis::cmd("XPENDING")
            .arg(key)
            .arg(group)
            .query_async(self.connection_mut())
            .await?;
        match &value {
            Value::Array(items) => items.first().map(as_u64).unwrap_or(Ok(0)),
            other => Err(shape_error("XPENDING summary", format!("{other:?}"))),
        }
    }

    /// XPENDING key group start end count (extended form)
    pub async fn xpending_range(
        &mut self,
        key: &str,
        group: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<PendingRecord>> {
        let value: Value = redis::cmd("XPENDING")
            .arg(key)
            .arg(group)
            .arg(start)
            .arg(end)
            .arg(count)
            .query_async(self.connection_mut())
            .await?;

        let rows = match &value {
            Value::Array(rows) => rows,
            Value::Nil => return Ok(Vec::new()),
            other => return Err(shape_error("XPENDING range", format!("{other:?}"))),
        };

        rows.iter()
            .map(|row| match row {
                Value::Array(cols) if cols.len() >= 4 => Ok(PendingRecord {
                    id: as_string(&cols[0])?,
                    consumer: as_string(&cols[1])?,
                    idle_ms: as_u64(&cols[2])?,
                    deliveries: as_u64(&cols[3])?,
                }),
                other => Err(shape_error("XPENDING row", format!("{other:?}"))),
            })
            .collect()
    }

    /// XINFO CONSUMERS key group
    pub async fn xinfo_consumers(&mut self, key: &str, group: &str) -> Result<Vec<ConsumerRecord>> {
        let value: Value = redis::cmd("XINFO")
            .arg("CONSUMERS")
            .arg(key)
            .arg(group)
            .query_async(self.connection_mut())
            .await?;

        list_of_maps(&value)?
            .into_iter()
            .map(|info| {
                Ok(ConsumerRecord {
                    name: info.get("name").map(as_string).transpose()?.unwrap_or_default(),
                    pending: info.get("pending").map(as_u64).transpose()?.unwrap_or(0),
                    idle_ms: info.get("idle").map(as_u64).transpose()?.unwrap_or(0),
                })
            })
            .collect()
    }

    /// XINFO GROUPS key, filtered to one group
    pub async fn xinfo_group(&mut self, key: &str, group: &str) -> Result<Option<GroupRecord>> {
        let value: Value = redis::cmd("XINFO")
            .arg("GROUPS")
            .arg(key)
            .query_async(self.connection_mut())
            .await?;

        for info in list_of_maps(&value)? {
            let name = info.get("name").map(as_string).transpose()?.unwrap_or_default();
            if name != group {
                continue;
            }
            return Ok(Some(GroupRecord {
                name,
                consumers: info.get("consumers").map(as_u64).transpose()?.unwrap_or(0),
                pending: info.get("pending").map(as_u64).transpose()?.unwrap_or(0),
                last_delivered_id: info
                    .get("last-delivered-id")
                    .map(as_string)
                    .transpose()?
                    .unwrap_or_else(|| "0-0".to_string()),
            }));
        }
        Ok(None)
    }
}

// ============================================================================
// Reply parsing
// ============================================================================

fn as_bytes(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::BulkString(bytes) => Ok(bytes.clone()),
        Value::SimpleString(s) => Ok(s.as_bytes().to_vec()),
        Value::VerbatimString { text, .. } => Ok(text.as_bytes().to_vec()),
        Value::Int(i) => Ok(i.to_string().into_bytes()),
        Value::Okay => Ok(b"OK".to_vec()),
        other => Err(shape_error("string value", format!("{other:?}"))),
    }
}

fn as_string(value: &Value) -> Result<String> {
    as_bytes(value).map(|b| String::from_utf8_lossy(&b).into_owned())
}

fn as_u64(value: &Value) -> Result<u64> {
    match value {
        Value::Int(i) => Ok((*i).max(0) as u64),
        other => as_string(other)?
            .parse()
            .map_err(|_| shape_error("integer value", format!("{other:?}"))),
    }
}

/// Field/value pairs from either a flat RESP2 array or a RESP3 map
fn pairs(value: &Value) -> Result<Vec<(&Value, &Value)>> {
    match value {
        Value::Array(items) => Ok(items.chunks_exact(2).map(|c| (&c[0], &c[1])).collect()),
        Value::Map(entries) => Ok(entries.iter().map(|(k, v)| (k, v)).collect()),
        other => Err(shape_error("field map", format!("{other:?}"))),
    }
}

fn field_map(value: &Value) -> Result<HashMap<String, Vec<u8>>> {
    pairs(value)?
        .into_iter()
        .map(|(k, v)| Ok((as_string(k)?, as_bytes(v)?)))
        .collect()
}

fn list_of_maps(value: &Value) -> Result<Vec<HashMap<String, Value>>> {
    let items = match value {
        Value::Array(items) => items,
        Value::Nil => return Ok(Vec::new()),
        other => return Err(shape_error("info list", format!("{other:?}"))),
    };
    items
        .iter()
        .map(|item| {
            pairs(item)?
                .into_iter()
                .map(|(k, v)| Ok((as_string(k)?, v.clone())))
                .collect()
        })
        .collect()
}

/// `[[id, [field, value, ...]], [id, nil], ...]`
fn parse_entries(value: &Value) -> Result<StreamBatch> {
    let items = match value {
        Value::Array(items) => items,
        Value::Nil => return Ok(StreamBatch::default()),
        other => return Err(shape_error("stream entries", format!("{other:?}"))),
    };

    let mut batch = StreamBatch::default();
    for item in items {
        match item {
            Value::Array(parts) if !parts.is_empty() => {
                let id = as_string(&parts[0])?;
                match parts.get(1) {
                    None | Some(Value::Nil) => batch.tombstones.push(id),
                    Some(fields) => batch.records.push(StreamRecord {
                        id,
                        fields: field_map(fields)?,
                    }),
                }
            }
            // XAUTOCLAIM on Redis 6.2 reports vanished entries as a bare nil
            Value::Nil => {}
            other => return Err(shape_error("stream entry", format!("{other:?}"))),
        }
    }
    Ok(batch)
}

/// XREADGROUP: nil on timeout, `[[key, entries]]` (RESP2) or `{key: entries}` (RESP3)
fn parse_read_reply(value: &Value) -> Result<StreamBatch> {
    let streams: Vec<(&Value, &Value)> = match value {
        Value::Nil => return Ok(StreamBatch::default()),
        Value::Array(items) => items
            .iter()
            .map(|s| match s {
                Value::Array(kv) if kv.len() >= 2 => Ok((&kv[0], &kv[1])),
                other => Err(shape_error("XREADGROUP stream", format!("{other:?}"))),
            })
            .collect::<Result<_>>()?,
        Value::Map(entries) => entries.iter().map(|(k, v)| (k, v)).collect(),
        other => return Err(shape_error("XREADGROUP reply", format!("{other:?}"))),
    };

    let mut batch = StreamBatch::default();
    for (_, entries) in streams {
        let parsed = parse_entries(entries)?;
        batch.records.extend(parsed.records);
        batch.tombstones.extend(parsed.tombstones);
    }
    Ok(batch)
}

/// XAUTOCLAIM: `[next_cursor, entries]` plus, since Redis 7, `deleted_ids`.
/// Only the first two elements are interpreted; anything after is ignored
/// except that deleted ids are surfaced as tombstones.
fn parse_claim_reply(value: &Value) -> Result<ClaimReply> {
    let items = match value {
        Value::Array(items) if items.len() >= 2 => items,
        other => return Err(shape_error("XAUTOCLAIM reply", format!("{other:?}"))),
    };

    let next_cursor = as_string(&items[0])?;
    let mut batch = parse_entries(&items[1])?;

    if let Some(Value::Array(deleted)) = items.get(2) {
        for id in deleted {
            if let Ok(id) = as_string(id) {
                batch.tombstones.push(id);
            }
        }
    }

    Ok(ClaimReply { next_cursor, batch })
}
