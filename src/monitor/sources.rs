//! Collaborators the presets sample from, and the adapters that turn each
//! of them into a [`MetricSampler`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use super::{MetricSampler, SamplerMap};
use crate::error::MonitorResult;

// ─── Collaborator traits ─────────────────────────────────────────

/// Snapshot of named numeric statistics, e.g. a REST stats endpoint.
#[async_trait]
pub trait StatsSource: Send + Sync {
    /// `Ok(None)` when the statistic is not reported.
    async fn stat(&self, metric: &str) -> MonitorResult<Option<f64>>;
}

/// State of a server-side long-running task (rebalance, xdcr, indexing).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskStatus {
    pub running: bool,
    /// Percent complete, when the task reports it.
    pub progress: Option<f64>,
}

#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn task_status(&self, task_type: &str) -> MonitorResult<TaskStatus>;
}

#[async_trait]
pub trait IndexSource: Send + Sync {
    /// Reported state of every replica/partition of `index`.
    async fn index_states(&self, index: &str) -> MonitorResult<Vec<String>>;
    /// Flat `bucket:index:stat` → value map.
    async fn index_stats(&self) -> MonitorResult<BTreeMap<String, f64>>;
}

/// Warmup statistics of one service instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WarmupStats {
    pub state: Option<String>,
    /// Reported warmup duration in microseconds.
    pub warmup_time_us: Option<f64>,
}

#[async_trait]
pub trait WarmupSource: Send + Sync {
    async fn warmup_stats(&self) -> MonitorResult<WarmupStats>;
}

/// Whether a service instance considers itself up, e.g. an analytics node.
#[async_trait]
pub trait ServiceStatusSource: Send + Sync {
    async fn is_active(&self, node: &str) -> MonitorResult<bool>;
}

#[async_trait]
pub trait NodeHealthSource: Send + Sync {
    /// Node name → status string (`"healthy"` when fine).
    async fn node_statuses(&self) -> MonitorResult<BTreeMap<String, String>>;
}

// ─── Adapters ────────────────────────────────────────────────────

/// One statistic of a [`StatsSource`].
pub struct StatSampler {
    source: Arc<dyn StatsSource>,
    metric: String,
}

impl StatSampler {
    pub fn new(source: Arc<dyn StatsSource>, metric: impl Into<String>) -> Self {
        Self {
            source,
            metric: metric.into(),
        }
    }
}

#[async_trait]
impl MetricSampler for StatSampler {
    async fn sample(&self) -> MonitorResult<Option<f64>> {
        self.source.stat(&self.metric).await
    }
}

/// One sampler per metric name, all reading the same source.
pub fn stat_samplers(source: &Arc<dyn StatsSource>, metrics: &[&str]) -> SamplerMap {
    metrics
        .iter()
        .map(|m| {
            let sampler: Box<dyn MetricSampler> = Box::new(StatSampler::new(source.clone(), *m));
            ((*m).to_owned(), sampler)
        })
        .collect()
}

/// Task progress in percent; a task that is no longer running counts as 100.
pub struct TaskProgressSampler {
    source: Arc<dyn TaskSource>,
    task_type: String,
}

impl TaskProgressSampler {
    pub fn new(source: Arc<dyn TaskSource>, task_type: impl Into<String>) -> Self {
        Self {
            source,
            task_type: task_type.into(),
        }
    }
}

#[async_trait]
impl MetricSampler for TaskProgressSampler {
    async fn sample(&self) -> MonitorResult<Option<f64>> {
        let status = self.source.task_status(&self.task_type).await?;
        if !status.running {
            return Ok(Some(100.0));
        }
        Ok(Some(status.progress.unwrap_or(0.0)))
    }
}

/// 1 while the task is running, else 0.
pub struct TaskRunningSampler {
    source: Arc<dyn TaskSource>,
    task_type: String,
}

impl TaskRunningSampler {
    pub fn new(source: Arc<dyn TaskSource>, task_type: impl Into<String>) -> Self {
        Self {
            source,
            task_type: task_type.into(),
        }
    }
}

#[async_trait]
impl MetricSampler for TaskRunningSampler {
    async fn sample(&self) -> MonitorResult<Option<f64>> {
        let status = self.source.task_status(&self.task_type).await?;
        Ok(Some(if status.running { 1.0 } else { 0.0 }))
    }
}

/// 1 once every reported state of the index equals the ready state
/// (`online` for query indexes, `Ready` for a secondary index build).
pub struct IndexStateSampler {
    source: Arc<dyn IndexSource>,
    index: String,
    ready: String,
}

impl IndexStateSampler {
    pub fn new(
        source: Arc<dyn IndexSource>,
        index: impl Into<String>,
        ready: impl Into<String>,
    ) -> Self {
        Self {
            source,
            index: index.into(),
            ready: ready.into(),
        }
    }
}

#[async_trait]
impl MetricSampler for IndexStateSampler {
    async fn sample(&self) -> MonitorResult<Option<f64>> {
        let states = self.source.index_states(&self.index).await?;
        let ready = !states.is_empty() && states.iter().all(|s| *s == self.ready);
        if !ready {
            info!("index {} state: {:?}", self.index, states);
        }
        Ok(Some(if ready { 1.0 } else { 0.0 }))
    }
}

/// Documents still queued or pending for one index.
pub struct IndexBacklogSampler {
    source: Arc<dyn IndexSource>,
    bucket: String,
    index: String,
}

impl IndexBacklogSampler {
    pub fn new(
        source: Arc<dyn IndexSource>,
        bucket: impl Into<String>,
        index: impl Into<String>,
    ) -> Self {
        Self {
            source,
            bucket: bucket.into(),
            index: index.into(),
        }
    }
}

#[async_trait]
impl MetricSampler for IndexBacklogSampler {
    async fn sample(&self) -> MonitorResult<Option<f64>> {
        let stats = self.source.index_stats().await?;
        let prefix = format!("{}:{}", self.bucket, self.index);
        let pending = stats.get(&format!("{prefix}:num_docs_pending"));
        let queued = stats.get(&format!("{prefix}:num_docs_queued"));
        Ok(match (pending, queued) {
            (Some(p), Some(q)) => Some(p + q),
            _ => None,
        })
    }
}

/// 1 once warmup reports `done`; remembers the reported warm time.
pub struct WarmupSampler {
    source: Arc<dyn WarmupSource>,
    warm_time_us: Mutex<Option<f64>>,
}

impl WarmupSampler {
    pub fn new(source: Arc<dyn WarmupSource>) -> Self {
        Self {
            source,
            warm_time_us: Mutex::new(None),
        }
    }

    pub fn warm_time_us(&self) -> Option<f64> {
        *self.warm_time_us.lock()
    }
}

#[async_trait]
impl MetricSampler for WarmupSampler {
    async fn sample(&self) -> MonitorResult<Option<f64>> {
        let stats = self.source.warmup_stats().await?;
        match stats.state.as_deref() {
            Some("done") => {
                *self.warm_time_us.lock() = Some(stats.warmup_time_us.unwrap_or(0.0));
                Ok(Some(1.0))
            }
            Some(state) => {
                info!("warmup status: {state}");
                Ok(Some(0.0))
            }
            None => {
                info!("no warmup stats are available, continue polling");
                Ok(None)
            }
        }
    }
}

/// 1 while the service on `node` reports itself active.
pub struct ServiceActiveSampler {
    source: Arc<dyn ServiceStatusSource>,
    node: String,
}

impl ServiceActiveSampler {
    pub fn new(source: Arc<dyn ServiceStatusSource>, node: impl Into<String>) -> Self {
        Self {
            source,
            node: node.into(),
        }
    }
}

#[async_trait]
impl MetricSampler for ServiceActiveSampler {
    async fn sample(&self) -> MonitorResult<Option<f64>> {
        let active = self.source.is_active(&self.node).await?;
        Ok(Some(if active { 1.0 } else { 0.0 }))
    }
}

/// Number of nodes either status source reports as not healthy.
pub struct UnhealthyNodesSampler {
    primary: Arc<dyn NodeHealthSource>,
    secondary: Arc<dyn NodeHealthSource>,
    last: Mutex<BTreeSet<String>>,
}

impl UnhealthyNodesSampler {
    pub fn new(primary: Arc<dyn NodeHealthSource>, secondary: Arc<dyn NodeHealthSource>) -> Self {
        Self {
            primary,
            secondary,
            last: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn last_unhealthy(&self) -> Vec<String> {
        self.last.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl MetricSampler for UnhealthyNodesSampler {
    async fn sample(&self) -> MonitorResult<Option<f64>> {
        let a = self.primary.node_statuses().await?;
        let b = self.secondary.node_statuses().await?;
        let unhealthy: BTreeSet<String> = a
            .into_iter()
            .chain(b)
            .filter(|(_, status)| status != "healthy")
            .map(|(node, _)| node)
            .collect();
        let count = unhealthy.len() as f64;
        *self.last.lock() = unhealthy;
        Ok(Some(count))
    }
}

/// Absolute difference between a source count and its synced copy.
pub struct CountGapSampler {
    source: Box<dyn MetricSampler>,
    synced: Box<dyn MetricSampler>,
    label: String,
}

impl CountGapSampler {
    pub fn new(
        label: impl Into<String>,
        source: Box<dyn MetricSampler>,
        synced: Box<dyn MetricSampler>,
    ) -> Self {
        Self {
            source,
            synced,
            label: label.into(),
        }
    }
}

#[async_trait]
impl MetricSampler for CountGapSampler {
    async fn sample(&self) -> MonitorResult<Option<f64>> {
        let source = self.source.sample().await?;
        let synced = self.synced.sample().await?;
        match (source, synced) {
            (Some(s), Some(d)) => {
                info!("for {}, source has {s} docs, synced copy has {d} docs", self.label);
                Ok(Some((s - d).abs()))
            }
            _ => Ok(None),
        }
    }
}
