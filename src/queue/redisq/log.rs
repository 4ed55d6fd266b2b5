//! Durable log abstraction consumed by the stream consumer.
//!
//! The consumer needs five primitives from the backing log: append an entry,
//! read as a consumer-group member, acknowledge, trim approximately and
//! create a group if it is missing. Redis Streams provide all five
//! natively; `MemoryStreamLog` emulates them for tests.

use std::collections::HashMap;

use async_trait::async_trait;

/// Result type for log operations.
pub type LogResult<T> = std::result::Result<T, LogError>;

/// Errors returned by a `StreamLog`.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Consumer group not found: {0}")]
    NoGroup(String),

    #[error("Log operation timed out")]
    Timeout,

    #[error("Log unavailable: {0}")]
    Unavailable(String),

    #[error("Log error: {0}")]
    Other(String),
}

/// One stream entry as returned by a group read.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawMessage {
    pub id: String,
    pub fields: HashMap<String, Vec<u8>>,
}

impl RawMessage {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.fields.get(key).map(Vec::as_slice)
    }

    /// Field value as text. Absent or non UTF-8 values read as "".
    pub fn get_str(&self, key: &str) -> &str {
        self.get(key)
            .and_then(|value| std::str::from_utf8(value).ok())
            .unwrap_or("")
    }

    /// An entry removed from the log after delivery surfaces with no field values.
    pub fn is_deleted(&self) -> bool {
        self.fields.values().all(Vec::is_empty)
    }
}

/// Where a group read starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries never delivered to the group (`>`).
    New,
    /// This consumer's pending entries with ids after the given one.
    After(String),
}

impl ReadCursor {
    /// The id argument as Redis expects it.
    pub fn as_id(&self) -> &str {
        match self {
            ReadCursor::New => ">",
            ReadCursor::After(id) => id,
        }
    }
}

/// Arguments of a consumer-group read.
#[derive(Debug, Clone)]
pub struct GroupRead<'a> {
    pub stream: &'a str,
    pub group: &'a str,
    pub consumer: &'a str,
    pub cursor: ReadCursor,
    pub count: usize,
}

/// Durable append-only log with consumer groups.
#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Append one entry and return its id.
    async fn append(&self, stream: &str, fields: Vec<(String, Vec<u8>)>) -> LogResult<String>;

    /// Read up to `count` entries as a group member. Never blocks waiting for data.
    async fn read_group(&self, read: GroupRead<'_>) -> LogResult<Vec<RawMessage>>;

    /// Acknowledge entries, returning how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> LogResult<u64>;

    /// Trim the stream to roughly `max_len` entries, returning how many were removed.
    async fn trim_approx(&self, stream: &str, max_len: u64) -> LogResult<u64>;

    /// Create the group (and the stream) unless it already exists.
    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> LogResult<()>;
}
