//! Write-to-feed propagation latency.
//!
//! A probe writes one uniquely keyed record into a source system while a
//! second task long-polls the downstream change feed for that key. The
//! latency sample is the gap between the write acknowledgment and the
//! feed response that carried the key.

pub mod document;
pub mod race;
pub mod runner;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{MonitorError, MonitorResult};
use crate::timing::as_millis;

pub use document::ProbeDocument;
pub use race::{measure_latency, observe_key, LatencyProbe};

// ─── Correlation types ───────────────────────────────────────────

/// Correlation token carried by the write and searched for in the feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProbeKey(String);

impl ProbeKey {
    /// `<prefix>_<uuid>`; unique per call.
    pub fn mint(prefix: &str) -> Self {
        Self(format!("{prefix}_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProbeKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Display for ProbeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque position in a change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceCursor(String);

impl SequenceCursor {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SequenceCursor {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Display for SequenceCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Feed records ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRecord {
    /// Document / record identifier.
    pub id: String,
    pub seq: Option<SequenceCursor>,
}

impl FeedRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            seq: None,
        }
    }
}

/// One long-poll response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedBatch {
    pub records: Vec<FeedRecord>,
    pub last_seq: Option<SequenceCursor>,
}

impl FeedBatch {
    pub fn contains(&self, key: &ProbeKey) -> bool {
        self.records.iter().any(|r| r.id == key.as_str())
    }
}

// ─── Collaborators ───────────────────────────────────────────────

/// Downstream change/event stream.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Current end of the stream.
    async fn current_cursor(&self) -> MonitorResult<SequenceCursor>;

    /// One long-poll round for changes after `since`, blocking at most
    /// `heartbeat` server-side. Non-success responses are errors.
    async fn poll(&self, since: &SequenceCursor, heartbeat: Duration) -> MonitorResult<FeedBatch>;
}

/// Hands out a change feed per probe. A feed may hold a connection that a
/// long-poll blocks, so concurrent probes must not share one.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn open(&self) -> MonitorResult<Arc<dyn ChangeFeed>>;
}

/// Every probe gets the same feed. Only for feeds that serve concurrent
/// polls without blocking each other, such as in-memory ones.
#[derive(Clone)]
pub struct SharedFeed(Arc<dyn ChangeFeed>);

impl SharedFeed {
    pub fn new(feed: Arc<dyn ChangeFeed>) -> Self {
        Self(feed)
    }
}

#[async_trait]
impl FeedSource for SharedFeed {
    async fn open(&self) -> MonitorResult<Arc<dyn ChangeFeed>> {
        Ok(self.0.clone())
    }
}

/// Source system the probe writes into.
#[async_trait]
pub trait RecordWriter: Send + Sync {
    /// Returns once the write is acknowledged.
    async fn write(&self, key: &ProbeKey, doc: &ProbeDocument) -> MonitorResult<()>;
}

// ─── Results ─────────────────────────────────────────────────────

/// One latency sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceResult {
    pub key: ProbeKey,
    pub write_completed_at: Instant,
    pub observation_confirmed_at: Instant,
    pub latency: Duration,
}

impl RaceResult {
    /// Fails with `ClockAnomaly` when the observation precedes the write.
    pub fn new(
        key: ProbeKey,
        write_completed_at: Instant,
        observation_confirmed_at: Instant,
    ) -> MonitorResult<Self> {
        if observation_confirmed_at < write_completed_at {
            return Err(MonitorError::ClockAnomaly {
                skew: write_completed_at - observation_confirmed_at,
                key,
            });
        }
        Ok(Self {
            latency: observation_confirmed_at - write_completed_at,
            key,
            write_completed_at,
            observation_confirmed_at,
        })
    }

    pub fn latency_ms(&self) -> u64 {
        as_millis(self.latency)
    }
}

// ─── Settings ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeSettings {
    pub key_prefix: String,
    /// Hard client-side bound on one probe.
    pub timeout: Duration,
    /// Server-side block per long-poll round, capped by what is left of `timeout`.
    pub heartbeat: Duration,
    /// Pause before re-polling after a round without the key.
    pub repoll_delay: Duration,
    /// Pause between consecutive probes in the runner.
    pub sample_interval: Duration,
    pub payload_size: usize,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            key_prefix: "probe".into(),
            timeout: Duration::from_secs(3600),
            heartbeat: Duration::from_secs(3600),
            repoll_delay: Duration::from_millis(1),
            sample_interval: Duration::from_millis(250),
            payload_size: 1024,
        }
    }
}
