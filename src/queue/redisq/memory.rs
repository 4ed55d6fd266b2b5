//! In-memory `StreamLog` for testing.
//!
//! Emulates Redis consumer-group semantics: entries get monotonically
//! increasing `ms-seq` ids, a group tracks its last delivered id and a
//! pending entries list owned by consumers, and entries removed from the
//! stream while pending are returned with no fields.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::log::{GroupRead, LogError, LogResult, RawMessage, ReadCursor, StreamLog};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
struct EntryId {
    ms: u64,
    seq: u64,
}

impl EntryId {
    fn next_after(last: EntryId) -> EntryId {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        if now > last.ms {
            EntryId { ms: now, seq: 0 }
        } else {
            EntryId {
                ms: last.ms,
                seq: last.seq + 1,
            }
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = LogError;

    fn from_str(s: &str) -> LogResult<Self> {
        let invalid = || LogError::Other(format!("Invalid stream ID specified: {}", s));
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        Ok(EntryId {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: EntryId,
    /// Pending entry id to owning consumer.
    pending: BTreeMap<EntryId, String>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<EntryId, Vec<(String, Vec<u8>)>>,
    groups: HashMap<String, Group>,
    last_id: EntryId,
}

impl Stream {
    fn raw(&self, id: EntryId) -> RawMessage {
        let fields = self
            .entries
            .get(&id)
            .map(|fields| fields.iter().cloned().collect())
            .unwrap_or_default();
        RawMessage {
            id: id.to_string(),
            fields,
        }
    }
}

/// In-memory log with Redis stream semantics.
#[derive(Debug, Default)]
pub struct MemoryStreamLog {
    streams: RwLock<HashMap<String, Stream>>,
    fail_reads: RwLock<u32>,
    fail_trims: RwLock<bool>,
    hang_reads: RwLock<bool>,
    read_calls: RwLock<u64>,
}

impl MemoryStreamLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` group reads fail.
    pub async fn set_fail_reads(&self, count: u32) {
        *self.fail_reads.write().await = count;
    }

    pub async fn set_fail_trims(&self, fail: bool) {
        *self.fail_trims.write().await = fail;
    }

    /// Make group reads never complete, as a stalled server would.
    pub async fn set_hang_reads(&self, hang: bool) {
        *self.hang_reads.write().await = hang;
    }

    /// Number of group reads issued so far.
    pub async fn read_calls(&self) -> u64 {
        *self.read_calls.read().await
    }

    /// Number of entries retained in `stream`.
    pub async fn len(&self, stream: &str) -> usize {
        self.streams
            .read()
            .await
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    pub async fn is_empty(&self, stream: &str) -> bool {
        self.len(stream).await == 0
    }

    /// Number of entries delivered to `group` but not acknowledged.
    pub async fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .read()
            .await
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Ids of the entries pending in `group`, oldest first.
    pub async fn pending_ids(&self, stream: &str, group: &str) -> Vec<String> {
        self.streams
            .read()
            .await
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.keys().map(EntryId::to_string).collect())
            .unwrap_or_default()
    }

    pub async fn group_exists(&self, stream: &str, group: &str) -> bool {
        self.streams
            .read()
            .await
            .get(stream)
            .is_some_and(|s| s.groups.contains_key(group))
    }

    /// Remove one entry from the stream, leaving pending lists untouched.
    pub async fn delete(&self, stream: &str, id: &str) -> LogResult<bool> {
        let id: EntryId = id.parse()?;
        Ok(self
            .streams
            .write()
            .await
            .get_mut(stream)
            .is_some_and(|s| s.entries.remove(&id).is_some()))
    }
}

#[async_trait]
impl StreamLog for MemoryStreamLog {
    async fn append(&self, stream: &str, fields: Vec<(String, Vec<u8>)>) -> LogResult<String> {
        if fields.is_empty() {
            return Err(LogError::Other("Entry has no fields".to_string()));
        }
        let mut streams = self.streams.write().await;
        let s = streams.entry(stream.to_string()).or_default();
        let id = EntryId::next_after(s.last_id);
        s.last_id = id;
        s.entries.insert(id, fields);
        Ok(id.to_string())
    }

    async fn read_group(&self, read: GroupRead<'_>) -> LogResult<Vec<RawMessage>> {
        *self.read_calls.write().await += 1;
        if *self.hang_reads.read().await {
            futures::future::pending::<()>().await;
        }
        {
            let mut fail_reads = self.fail_reads.write().await;
            if *fail_reads > 0 {
                *fail_reads -= 1;
                return Err(LogError::Unavailable("Mock read failure".to_string()));
            }
        }

        let mut streams = self.streams.write().await;
        let no_group = || LogError::NoGroup(format!("{}/{}", read.stream, read.group));
        let s = streams.get_mut(read.stream).ok_or_else(no_group)?;
        let group = s.groups.get_mut(read.group).ok_or_else(no_group)?;

        let ids: Vec<EntryId> = match &read.cursor {
            ReadCursor::New => {
                let ids: Vec<EntryId> = s
                    .entries
                    .range(group.last_delivered..)
                    .map(|(id, _)| *id)
                    .filter(|id| *id > group.last_delivered)
                    .take(read.count)
                    .collect();
                for id in &ids {
                    group.pending.insert(*id, read.consumer.to_string());
                }
                if let Some(last) = ids.last() {
                    group.last_delivered = *last;
                }
                ids
            }
            ReadCursor::After(cursor) => {
                let cursor: EntryId = cursor.parse()?;
                group
                    .pending
                    .range(cursor..)
                    .filter(|(id, owner)| **id > cursor && owner.as_str() == read.consumer)
                    .map(|(id, _)| *id)
                    .take(read.count)
                    .collect()
            }
        };

        Ok(ids.into_iter().map(|id| s.raw(id)).collect())
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> LogResult<u64> {
        let ids = ids
            .iter()
            .map(|id| id.parse::<EntryId>())
            .collect::<LogResult<Vec<_>>>()?;

        let mut streams = self.streams.write().await;
        let Some(group) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter(|id| group.pending.remove(*id).is_some())
            .count() as u64)
    }

    async fn trim_approx(&self, stream: &str, max_len: u64) -> LogResult<u64> {
        if *self.fail_trims.read().await {
            return Err(LogError::Unavailable("Mock trim failure".to_string()));
        }

        let mut streams = self.streams.write().await;
        let Some(s) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let max_len = usize::try_from(max_len).unwrap_or(usize::MAX);
        let mut removed = 0;
        while s.entries.len() > max_len {
            if s.entries.pop_first().is_none() {
                break;
            }
            removed += 1;
        }
        Ok(removed)
    }

    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> LogResult<()> {
        let mut streams = self.streams.write().await;
        let s = streams.entry(stream.to_string()).or_default();
        if s.groups.contains_key(group) {
            return Ok(());
        }
        let last_delivered = match start_id {
            "$" => s.last_id,
            id => id.parse()?,
        };
        s.groups.insert(
            group.to_string(),
            Group {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }
}
