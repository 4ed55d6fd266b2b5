//! Redis Streams `StreamLog` implementation.

use async_trait::async_trait;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError, Value};
use tracing::{debug, info};

use super::log::{GroupRead, LogError, LogResult, RawMessage, StreamLog};

/// Stream log backed by a Redis server.
///
/// Uses `XADD`, `XREADGROUP`, `XACK`, `XTRIM MAXLEN ~` and
/// `XGROUP CREATE ... MKSTREAM`.
#[derive(Clone)]
pub struct RedisStreamLog {
    conn: ConnectionManager,
}

impl RedisStreamLog {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    pub async fn new(url: &str) -> LogResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(url = %url, "Connected to Redis for streams");

        Ok(Self { conn })
    }

    /// Wrap an existing connection.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

fn value_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::BulkString(bytes) => bytes.clone(),
        Value::SimpleString(s) => s.as_bytes().to_vec(),
        Value::Int(i) => i.to_string().into_bytes(),
        _ => Vec::new(),
    }
}

fn map_error(e: RedisError, stream: &str, group: &str) -> LogError {
    if e.code() == Some("NOGROUP") {
        LogError::NoGroup(format!("{}/{}", stream, group))
    } else {
        LogError::Redis(e)
    }
}

#[async_trait]
impl StreamLog for RedisStreamLog {
    async fn append(&self, stream: &str, fields: Vec<(String, Vec<u8>)>) -> LogResult<String> {
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", &fields).await?;
        Ok(id)
    }

    async fn read_group(&self, read: GroupRead<'_>) -> LogResult<Vec<RawMessage>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(read.group, read.consumer)
            .count(read.count);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[read.stream], &[read.cursor.as_id()], &options)
            .await
            .map_err(|e| map_error(e, read.stream, read.group))?;

        // No new entries reads as nil.
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let msgs = reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|entry| RawMessage {
                fields: entry
                    .map
                    .iter()
                    .map(|(k, v)| (k.clone(), value_bytes(v)))
                    .collect(),
                id: entry.id,
            })
            .collect();
        Ok(msgs)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> LogResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let acked: u64 = conn.xack(stream, group, ids).await?;
        Ok(acked)
    }

    async fn trim_approx(&self, stream: &str, max_len: u64) -> LogResult<u64> {
        let mut conn = self.conn.clone();
        let max_len = usize::try_from(max_len).unwrap_or(usize::MAX);
        let removed: u64 = conn.xtrim(stream, StreamMaxlen::Approx(max_len)).await?;
        Ok(removed)
    }

    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> LogResult<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(stream, group, start_id).await;

        match created {
            Ok(()) => {
                info!(stream = %stream, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %stream, group = %group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
