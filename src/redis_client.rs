//! Redis-backed collaborators: `INFO` statistics for the poller, a stream
//! change feed and a hash writer for the latency probe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, InfoDict};
use tracing::{debug, info};

use crate::error::{MonitorError, MonitorResult};
use crate::monitor::sources::StatsSource;
use crate::probe::{
    ChangeFeed, FeedBatch, FeedRecord, FeedSource, ProbeDocument, ProbeKey, RecordWriter,
    SequenceCursor,
};
use crate::timing::as_millis;

/// Cursor of an empty stream.
const STREAM_START: &str = "0-0";

/// Field of a stream entry holding the record id.
const ID_FIELD: &str = "id";

pub fn open_client(url: &str) -> MonitorResult<redis::Client> {
    redis::Client::open(url)
        .map_err(|e| MonitorError::Config(format!("invalid Redis URL \"{url}\": {e}")))
}

/// Opens a `ConnectionManager` that reconnects on failure.
///
/// Clones share one multiplexed connection, so blocking commands (the
/// change feed) go through [`RedisFeedSource`] instead.
pub async fn connect(url: &str) -> MonitorResult<ConnectionManager> {
    let client = open_client(url)?;
    let conn = ConnectionManager::new(client)
        .await
        .map_err(|e| MonitorError::infra("redis", format!("cannot connect to {url}: {e}")))?;
    info!("connected to {url}");
    Ok(conn)
}

// ─── Stats ───────────────────────────────────────────────────────

/// Numeric value of `metric` in an `INFO` reply. Keyspace lines
/// (`db0:keys=1,expires=0`) are addressed as `db0.keys`, `db0.expires`.
pub fn info_stat(info: &InfoDict, metric: &str) -> Option<f64> {
    if let Some(v) = info.get::<f64>(metric) {
        return Some(v);
    }
    let (line, field) = metric.split_once('.')?;
    let value: String = info.get(line)?;
    value
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == field)
        .and_then(|(_, v)| v.parse().ok())
}

/// `StatsSource` over `INFO` plus the pseudo-metric `dbsize`.
#[derive(Clone)]
pub struct RedisStats {
    conn: ConnectionManager,
}

impl RedisStats {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn dbsize(&self) -> MonitorResult<u64> {
        let mut conn = self.conn.clone();
        let n: u64 = redis::cmd("DBSIZE").query_async(&mut conn).await?;
        Ok(n)
    }
}

#[async_trait]
impl StatsSource for RedisStats {
    async fn stat(&self, metric: &str) -> MonitorResult<Option<f64>> {
        if metric == "dbsize" {
            return Ok(Some(self.dbsize().await? as f64));
        }
        let mut conn = self.conn.clone();
        let info: InfoDict = redis::cmd("INFO").arg("all").query_async(&mut conn).await?;
        Ok(info_stat(&info, metric))
    }
}

// ─── Change feed ─────────────────────────────────────────────────

/// Change feed backed by a Redis stream whose entries carry the record id
/// in an `id` field.
pub struct RedisStreamFeed {
    conn: MultiplexedConnection,
    stream: String,
    batch_size: usize,
}

impl RedisStreamFeed {
    /// `conn` should not be shared; polls block it for up to a heartbeat.
    pub fn new(conn: MultiplexedConnection, stream: impl Into<String>, batch_size: usize) -> Self {
        Self {
            conn,
            stream: stream.into(),
            batch_size: batch_size.max(1),
        }
    }
}

/// Opens a fresh connection per feed. It closes once the last handle to
/// the feed is dropped, taking any pending `XREAD BLOCK` with it.
pub struct RedisFeedSource {
    client: redis::Client,
    stream: String,
    batch_size: usize,
}

impl RedisFeedSource {
    pub fn new(client: redis::Client, stream: impl Into<String>, batch_size: usize) -> Self {
        Self {
            client,
            stream: stream.into(),
            batch_size,
        }
    }
}

#[async_trait]
impl FeedSource for RedisFeedSource {
    async fn open(&self) -> MonitorResult<Arc<dyn ChangeFeed>> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!(stream = %self.stream, "feed connection opened");
        Ok(Arc::new(RedisStreamFeed::new(
            conn,
            self.stream.clone(),
            self.batch_size,
        )))
    }
}

fn feed_record(entry: &StreamId) -> FeedRecord {
    FeedRecord {
        id: entry.get::<String>(ID_FIELD).unwrap_or_default(),
        seq: Some(SequenceCursor::new(entry.id.clone())),
    }
}

#[async_trait]
impl ChangeFeed for RedisStreamFeed {
    async fn current_cursor(&self) -> MonitorResult<SequenceCursor> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrevrange_count(&self.stream, "+", "-", 1).await?;
        let cursor = reply
            .ids
            .first()
            .map_or_else(|| STREAM_START.to_owned(), |e| e.id.clone());
        Ok(SequenceCursor::new(cursor))
    }

    async fn poll(&self, since: &SequenceCursor, heartbeat: Duration) -> MonitorResult<FeedBatch> {
        let mut conn = self.conn.clone();
        // BLOCK 0 waits forever.
        let block_ms = as_millis(heartbeat).max(1) as usize;
        let opts = StreamReadOptions::default()
            .block(block_ms)
            .count(self.batch_size);
        let reply: StreamReadReply = conn
            .xread_options(&[&self.stream], &[since.as_str()], &opts)
            .await?;

        let records: Vec<FeedRecord> = reply
            .keys
            .iter()
            .flat_map(|k| k.ids.iter())
            .map(feed_record)
            .collect();
        let last_seq = records.last().and_then(|r| r.seq.clone());
        debug!(stream = %self.stream, records = records.len(), "feed round");
        Ok(FeedBatch { records, last_seq })
    }
}

// ─── Writer ──────────────────────────────────────────────────────

/// Writes probe documents as hashes at `<prefix>:<key>`. With a change
/// stream configured, the hash write and its change entry go out in one
/// `MULTI`, standing in for a source system that emits change events.
#[derive(Clone)]
pub struct RedisWriter {
    conn: ConnectionManager,
    prefix: String,
    change_stream: Option<String>,
}

impl RedisWriter {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            change_stream: None,
        }
    }

    #[must_use]
    pub fn publishing_to(mut self, stream: impl Into<String>) -> Self {
        self.change_stream = Some(stream.into());
        self
    }
}

#[async_trait]
impl RecordWriter for RedisWriter {
    async fn write(&self, key: &ProbeKey, doc: &ProbeDocument) -> MonitorResult<()> {
        let mut conn = self.conn.clone();
        let hash_key = format!("{}:{key}", self.prefix);

        let mut pipe = redis::pipe();
        pipe.atomic().hset_multiple(&hash_key, &doc.fields()).ignore();
        if let Some(stream) = &self.change_stream {
            pipe.xadd(stream, "*", &[(ID_FIELD, key.as_str())]).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_numeric_fields_and_keyspace() {
        let info = InfoDict::new(
            "# Server\r\nredis_version:7.2.4\r\nuptime_in_seconds:42\r\n\r\n# Keyspace\r\ndb0:keys=12,expires=0,avg_ttl=0\r\n",
        );
        assert_eq!(info_stat(&info, "uptime_in_seconds"), Some(42.0));
        assert_eq!(info_stat(&info, "db0.keys"), Some(12.0));
        assert_eq!(info_stat(&info, "db0.expires"), Some(0.0));
        assert_eq!(info_stat(&info, "redis_version"), None);
    }

    #[test]
    fn info_misses_are_none() {
        let info = InfoDict::new("# Keyspace\r\ndb0:keys=12,expires=0\r\nrole:master\r\n");
        assert_eq!(info_stat(&info, "db1.keys"), None);
        assert_eq!(info_stat(&info, "db0.avg_ttl"), None);
        assert_eq!(info_stat(&info, "role"), None);
        assert_eq!(info_stat(&info, "no_such_field"), None);
    }
}
