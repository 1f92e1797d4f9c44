//! # Courier Redis
//!
//! Low-level Redis client for the Courier delivery queue.
//!
//! ## Design Principles
//!
//! - **No business logic** - key naming, codecs and retry policy live in `courier`
//! - **Normalized replies** - stream replies are parsed from raw [`redis::Value`]s so
//!   optional or version-specific fields (e.g. the third element of `XAUTOCLAIM`
//!   added in Redis 7) are ignored instead of breaking deserialization
//! - **Binary-safe** - field values are kept as bytes
//!
//! ## Example
//!
//! ```rust,no_run
//! use courier_redis::RedisClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = RedisClient::connect("redis://localhost:6379").await?;
//!     client.xgroup_create("jobs", "workers", "$").await?;
//!     let id = client.xadd_capped("jobs", 1000, &[("payload", b"hello".as_slice())]).await?;
//!     println!("appended {id}");
//!     Ok(())
//! }
//! ```

mod client;
mod streams;

pub use client::RedisClient;
pub use streams::{
    ClaimReply, ConsumerRecord, GroupRecord, PendingRecord, StreamBatch, StreamRecord,
};

// Re-export commonly used types
pub use redis::{ErrorKind, RedisError, Script, Value};

/// Result type for Redis operations
pub type Result<T> = std::result::Result<T, RedisError>;

/// Build a type error for replies that do not have the expected shape
pub(crate) fn shape_error(what: &'static str, detail: impl Into<String>) -> RedisError {
    RedisError::from((ErrorKind::TypeError, what, detail.into()))
}

/// True when the error is Redis reporting a missing consumer group or stream
pub fn is_no_group(err: &RedisError) -> bool {
    err.code() == Some("NOGROUP") || err.to_string().contains("NOGROUP")
}

/// True when the error is Redis reporting that a consumer group already exists
pub fn is_busy_group(err: &RedisError) -> bool {
    err.code() == Some("BUSYGROUP") || err.to_string().contains("BUSYGROUP")
}
