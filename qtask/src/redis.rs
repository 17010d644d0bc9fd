//! Capability surface over a Redis-Streams-compatible store.
//!
//! The runtime only ever issues five stream verbs (XADD, XREADGROUP, XACK,
//! XGROUP CREATE, XAUTOCLAIM), so that is the whole trait. Commands are
//! built with `redis::cmd` rather than the typed stream helpers because the
//! typed replies hash their field lists and the encoding contract requires
//! field insertion order to survive the round trip.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Stream store errors, classified by how the runtime reacts to them.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The store is unreachable or the session dropped. Loops back off and
    /// retry; never fatal to a consumer.
    #[error("stream store unreachable: {0}")]
    Connection(String),
    /// The stream or consumer group does not exist yet (NOGROUP). Triggers
    /// an idempotent group re-creation attempt.
    #[error("missing stream or consumer group: {0}")]
    NoGroup(String),
    /// The store predates the command (XAUTOCLAIM needs the 6.2 generation).
    #[error("command not supported by the stream store: {0}")]
    UnsupportedCommand(String),
    /// Any other command failure.
    #[error("stream command failed: {0}")]
    Command(String),
}

impl From<redis::RedisError> for StreamError {
    fn from(error: redis::RedisError) -> Self {
        if error.is_io_error() || error.is_connection_refusal() || error.is_connection_dropped() {
            return StreamError::Connection(error.to_string());
        }
        if error.code() == Some("NOGROUP") {
            return StreamError::NoGroup(error.to_string());
        }
        let detail = error.to_string();
        if detail.contains("unknown command") {
            return StreamError::UnsupportedCommand(detail);
        }
        StreamError::Command(detail)
    }
}

/// One entry as returned by the store: an opaque id plus the *flat*
/// alternating field/value list from the wire. Pairing the list back into a
/// mapping is the consumer's job, since the wire does not guarantee that
/// every entry was written by a well-behaved producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<String>,
}

#[async_trait]
pub trait StreamClient: Send + Sync {
    /// `XADD stream id field value [field value ...]`. An id of `"*"` asks
    /// the server to assign one; the assigned id is returned.
    async fn xadd(
        &self,
        stream: &str,
        id: &str,
        fields: &[(String, String)],
    ) -> Result<String, StreamError>;

    /// `XREADGROUP GROUP group consumer BLOCK block_ms STREAMS stream ">"`.
    /// `None` means the block timeout elapsed with no new entries.
    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block_ms: u64,
    ) -> Result<Option<Vec<StreamEntry>>, StreamError>;

    /// `XACK stream group id`.
    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError>;

    /// `XGROUP CREATE stream group start_id MKSTREAM`. A BUSYGROUP response
    /// (the group already exists) is success.
    async fn xgroup_create(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), StreamError>;

    /// `XAUTOCLAIM stream group consumer min_idle_ms start_id COUNT count`.
    /// Returns the next scan cursor and the reclaimed entries.
    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        start_id: &str,
        count: usize,
    ) -> Result<(String, Vec<StreamEntry>), StreamError>;
}

/// Stream client backed by a real Redis-compatible store.
///
/// A fresh async connection is obtained per operation instead of caching
/// one, so a store reconnect transparently repoints subsequent calls.
pub struct RedisStreamClient {
    client: redis::Client,
}

impl RedisStreamClient {
    /// Open a client and verify the endpoint answers PING, so a bad address
    /// fails at connect time rather than in the first consumer loop.
    pub async fn connect(url: &str) -> Result<Self, StreamError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_async_connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StreamError> {
        Ok(self.client.get_async_connection().await?)
    }
}

#[async_trait]
impl StreamClient for RedisStreamClient {
    async fn xadd(
        &self,
        stream: &str,
        id: &str,
        fields: &[(String, String)],
    ) -> Result<String, StreamError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg(id);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        Ok(cmd.query_async::<_, String>(&mut conn).await?)
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block_ms: u64,
    ) -> Result<Option<Vec<StreamEntry>>, StreamError> {
        let mut conn = self.connection().await?;
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        match reply {
            // Nil is the normal shape of a block timeout with no new entries.
            redis::Value::Nil => Ok(None),
            value => Ok(Some(parse_read_reply(&value))),
        }
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError> {
        let mut conn = self.connection().await?;
        redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn xgroup_create(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), StreamError> {
        let mut conn = self.connection().await?;
        let result: Result<String, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) if error.code() == Some("BUSYGROUP") => {
                debug!(stream, group, "consumer group already exists");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        start_id: &str,
        count: usize,
    ) -> Result<(String, Vec<StreamEntry>), StreamError> {
        let mut conn = self.connection().await?;
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(start_id)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        // Reply shape: [next-cursor, [[id, [field, value, ...]], ...], ...]
        // (a third element of deleted ids appears in the 7.0 generation).
        let redis::Value::Bulk(parts) = &reply else {
            return Err(StreamError::Command(format!(
                "unexpected XAUTOCLAIM reply: {reply:?}"
            )));
        };
        let next_cursor = parts.first().and_then(as_string).unwrap_or_default();
        let entries = match parts.get(1) {
            Some(redis::Value::Bulk(entries)) => {
                entries.iter().filter_map(parse_entry).collect()
            }
            _ => Vec::new(),
        };
        Ok((next_cursor, entries))
    }
}

/// Flatten an XREADGROUP reply (`[[stream, [[id, fields], ...]], ...]`) into
/// the entry list of the single stream we asked for.
fn parse_read_reply(value: &redis::Value) -> Vec<StreamEntry> {
    let mut out = Vec::new();
    if let redis::Value::Bulk(streams) = value {
        for stream in streams {
            if let redis::Value::Bulk(parts) = stream {
                if let Some(redis::Value::Bulk(entries)) = parts.get(1) {
                    out.extend(entries.iter().filter_map(parse_entry));
                }
            }
        }
    }
    out
}

fn parse_entry(value: &redis::Value) -> Option<StreamEntry> {
    let redis::Value::Bulk(parts) = value else {
        return None;
    };
    let id = parts.first().and_then(as_string)?;
    let fields = match parts.get(1) {
        Some(redis::Value::Bulk(raw)) => raw.iter().filter_map(as_string).collect(),
        _ => Vec::new(),
    };
    Some(StreamEntry { id, fields })
}

fn as_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        redis::Value::Status(status) => Some(status.clone()),
        redis::Value::Int(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Default)]
struct MockGroup {
    /// Offset of the next never-delivered entry in the stream.
    next_index: usize,
    /// Delivered-but-unacknowledged entries, in delivery order.
    pending: Vec<MockPending>,
}

struct MockPending {
    entry_index: usize,
    id: String,
    consumer: String,
    delivered_at: Instant,
}

#[derive(Default)]
struct MockStream {
    entries: Vec<StreamEntry>,
    groups: HashMap<String, MockGroup>,
}

#[derive(Default)]
struct MockState {
    streams: HashMap<String, MockStream>,
    sequence: u64,
    down: bool,
    autoclaim_unsupported: bool,
    /// Every XACK call, for at-most-one-ack assertions.
    acks: Vec<(String, String, String)>,
}

/// In-memory stream store with consumer-group and pending-entry semantics,
/// for exercising the runtime without a live store.
#[derive(Clone, Default)]
pub struct MockStreamClient {
    state: Arc<Mutex<MockState>>,
    autoclaim_calls: Arc<AtomicUsize>,
}

impl MockStreamClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store becoming unreachable (and recovering).
    pub fn set_connected(&self, connected: bool) {
        self.lock().down = !connected;
    }

    /// Simulate a store generation that predates XAUTOCLAIM.
    pub fn set_autoclaim_supported(&self, supported: bool) {
        self.lock().autoclaim_unsupported = !supported;
    }

    /// Append an entry with an arbitrary flat field list, bypassing the
    /// pairwise encoding producers apply. Lets tests exercise malformed
    /// entries written by foreign producers.
    pub fn push_raw_entry(&self, stream: &str, fields: Vec<String>) -> String {
        let mut state = self.lock();
        state.sequence += 1;
        let id = format!("{}-0", state.sequence);
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .entries
            .push(StreamEntry {
                id: id.clone(),
                fields,
            });
        id
    }

    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.lock()
            .streams
            .get(stream)
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    pub fn group_exists(&self, stream: &str, group: &str) -> bool {
        self.lock()
            .streams
            .get(stream)
            .is_some_and(|s| s.groups.contains_key(group))
    }

    /// Entry ids currently pending (delivered, unacknowledged) in a group.
    pub fn pending(&self, stream: &str, group: &str) -> Vec<String> {
        self.lock()
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.iter().map(|p| p.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of XACK calls issued for one entry id.
    pub fn ack_count(&self, stream: &str, group: &str, id: &str) -> usize {
        self.lock()
            .acks
            .iter()
            .filter(|(s, g, i)| s == stream && g == group && i == id)
            .count()
    }

    pub fn autoclaim_calls(&self) -> usize {
        self.autoclaim_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("poisoned MockStreamClient mutex")
    }

    fn check_up(state: &MockState) -> Result<(), StreamError> {
        if state.down {
            return Err(StreamError::Connection("mock store is down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StreamClient for MockStreamClient {
    async fn xadd(
        &self,
        stream: &str,
        id: &str,
        fields: &[(String, String)],
    ) -> Result<String, StreamError> {
        let mut state = self.lock();
        Self::check_up(&state)?;
        let id = if id == "*" {
            state.sequence += 1;
            format!("{}-0", state.sequence)
        } else {
            id.to_string()
        };
        let flat = fields
            .iter()
            .flat_map(|(f, v)| [f.clone(), v.clone()])
            .collect();
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .entries
            .push(StreamEntry {
                id: id.clone(),
                fields: flat,
            });
        Ok(id)
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block_ms: u64,
    ) -> Result<Option<Vec<StreamEntry>>, StreamError> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            {
                let mut state = self.lock();
                Self::check_up(&state)?;
                let Some(mock_stream) = state.streams.get_mut(stream) else {
                    return Err(StreamError::NoGroup(format!(
                        "NOGROUP no such stream {stream}"
                    )));
                };
                let MockStream { entries, groups } = mock_stream;
                let Some(mock_group) = groups.get_mut(group) else {
                    return Err(StreamError::NoGroup(format!(
                        "NOGROUP no such group {group} for stream {stream}"
                    )));
                };
                if mock_group.next_index < entries.len() {
                    let start = mock_group.next_index;
                    let batch: Vec<StreamEntry> = entries[start..].to_vec();
                    for (offset, entry) in batch.iter().enumerate() {
                        mock_group.pending.push(MockPending {
                            entry_index: start + offset,
                            id: entry.id.clone(),
                            consumer: consumer.to_string(),
                            delivered_at: Instant::now(),
                        });
                    }
                    mock_group.next_index = entries.len();
                    return Ok(Some(batch));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), StreamError> {
        let mut state = self.lock();
        Self::check_up(&state)?;
        state
            .acks
            .push((stream.to_string(), group.to_string(), id.to_string()));
        if let Some(mock_group) = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        {
            mock_group.pending.retain(|p| p.id != id);
        }
        Ok(())
    }

    async fn xgroup_create(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), StreamError> {
        let mut state = self.lock();
        Self::check_up(&state)?;
        let mock_stream = state.streams.entry(stream.to_string()).or_default();
        let start_index = if start_id == "$" {
            mock_stream.entries.len()
        } else {
            0
        };
        // Re-creating an existing group is BUSYGROUP, which the client
        // contract treats as success; the group keeps its position.
        mock_stream
            .groups
            .entry(group.to_string())
            .or_insert_with(|| MockGroup {
                next_index: start_index,
                pending: Vec::new(),
            });
        Ok(())
    }

    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        _start_id: &str,
        count: usize,
    ) -> Result<(String, Vec<StreamEntry>), StreamError> {
        self.autoclaim_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        Self::check_up(&state)?;
        if state.autoclaim_unsupported {
            return Err(StreamError::UnsupportedCommand(
                "ERR unknown command 'XAUTOCLAIM'".to_string(),
            ));
        }
        let Some(mock_stream) = state.streams.get_mut(stream) else {
            return Err(StreamError::NoGroup(format!(
                "NOGROUP no such stream {stream}"
            )));
        };
        let entries = mock_stream.entries.clone();
        let Some(mock_group) = mock_stream.groups.get_mut(group) else {
            return Err(StreamError::NoGroup(format!(
                "NOGROUP no such group {group} for stream {stream}"
            )));
        };
        let min_idle = Duration::from_millis(min_idle_ms);
        let mut claimed = Vec::new();
        for pending in mock_group.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if pending.delivered_at.elapsed() >= min_idle {
                pending.consumer = consumer.to_string();
                pending.delivered_at = Instant::now();
                claimed.push(entries[pending.entry_index].clone());
            }
        }
        Ok(("0-0".to_string(), claimed))
    }
}
