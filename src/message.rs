// ============================================================================
// Queue Message Model
// ============================================================================
//
// QueueMessage is what producers hand to the queue and what the worker hands
// to the transport. It travels through the stream as MessagePack (named
// fields) under the `payload` field, next to a plain `message_id` field so
// tooling can read the idempotency key without decoding.
//
// Dead-letter records are stored as JSON so operators can read them directly
// with XRANGE.
//
// ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Log-assigned entry id: `<milliseconds>-<sequence>`, totally ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    /// "0-0", the smallest possible id (start of stream / end of a claim scan)
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid stream entry id: {0:?}")]
pub struct InvalidEntryId(pub String);

impl FromStr for EntryId {
    type Err = InvalidEntryId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidEntryId(s.to_string());
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            // Redis accepts "<ms>" as shorthand for "<ms>-0"
            None => (s, "0"),
        };
        Ok(EntryId {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

impl Serialize for EntryId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntryId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// What a producer submits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewMessage {
    /// Caller-supplied idempotency key
    pub message_id: String,
    pub recipient: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl NewMessage {
    pub fn new(
        message_id: impl Into<String>,
        recipient: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            recipient: recipient.into(),
            payload,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A message as it lives in the delivery stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueMessage {
    pub message_id: String,
    pub destination: String,
    pub recipient: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    /// Failed attempts that preceded this copy of the message
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl QueueMessage {
    pub fn new(destination: impl Into<String>, message: NewMessage) -> Self {
        Self {
            message_id: message.message_id,
            destination: destination.into(),
            recipient: message.recipient,
            payload: message.payload,
            enqueued_at: Utc::now(),
            attempt_count: 0,
            metadata: message.metadata,
        }
    }

    /// 1-based number of the delivery attempt this copy represents
    pub fn attempt_number(&self) -> u32 {
        self.attempt_count.saturating_add(1)
    }

    /// Copy to re-enqueue after a failed attempt
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt_count: self.attempt_count.saturating_add(1),
            ..self.clone()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Raw entry as read from the stream, before decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub message_id: Option<String>,
    pub payload: Vec<u8>,
}

/// Record appended to the DLQ stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterEntry {
    pub message: QueueMessage,
    /// Id the message had in the main stream when it was dead-lettered
    pub original_entry_id: EntryId,
    pub failure_reason: String,
    pub total_attempts: u32,
    pub moved_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// A DLQ record together with its id in the DLQ stream
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeadLetterRecord {
    pub id: EntryId,
    #[serde(flatten)]
    pub entry: DeadLetterEntry,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_id_parse_and_order() {
        let a: EntryId = "1700000000000-0".parse().unwrap();
        let b: EntryId = "1700000000000-3".parse().unwrap();
        let c: EntryId = "1700000000001-0".parse().unwrap();
        assert!(a < b && b < c);
        assert_eq!(b.to_string(), "1700000000000-3");
        assert_eq!("42".parse::<EntryId>().unwrap(), EntryId::new(42, 0));
        assert!("abc-1".parse::<EntryId>().is_err());
        assert!("".parse::<EntryId>().is_err());
    }

    #[test]
    fn test_queue_message_msgpack() {
        let message = QueueMessage::new(
            "whatsapp",
            NewMessage::new("m1", "+15550001111", json!({"text": "Your visit is confirmed"}))
                .with_metadata("conversation", "c-9"),
        );

        let bytes = message.encode().unwrap();
        let decoded = QueueMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.attempt_number(), 1);
    }

    #[test]
    fn test_next_attempt_increments() {
        let message = QueueMessage::new("sms", NewMessage::new("m2", "r", json!("hi")));
        let retry = message.next_attempt().next_attempt();
        assert_eq!(retry.attempt_count, 2);
        assert_eq!(retry.message_id, message.message_id);
        assert_eq!(retry.enqueued_at, message.enqueued_at);
    }

    #[test]
    fn test_garbage_payload_fails_to_decode() {
        assert!(QueueMessage::decode(b"\xc1not msgpack").is_err());
    }

    #[test]
    fn test_dead_letter_json() {
        let entry = DeadLetterEntry {
            message: QueueMessage::new("sms", NewMessage::new("m3", "r", json!({"t": 1}))),
            original_entry_id: EntryId::new(10, 2),
            failure_reason: "invalid recipient".to_string(),
            total_attempts: 1,
            moved_at: Utc::now(),
        };
        let json = String::from_utf8(entry.to_json().unwrap()).unwrap();
        assert!(json.contains("\"original_entry_id\":\"10-2\""));
        assert!(json.contains("invalid recipient"));
        assert_eq!(DeadLetterEntry::from_json(json.as_bytes()).unwrap(), entry);
    }
}
