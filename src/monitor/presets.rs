//! Named specializations of [`wait_for_convergence`]: each supplies the
//! samplers, the target and the policy for one kind of wait.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::sources::{
    stat_samplers, CountGapSampler, IndexBacklogSampler, IndexSource, IndexStateSampler,
    NodeHealthSource, ServiceActiveSampler, ServiceStatusSource, StatSampler, StatsSource,
    TaskProgressSampler, TaskRunningSampler, TaskSource, UnhealthyNodesSampler, WarmupSampler,
    WarmupSource,
};
use super::{wait_for_convergence, Convergence, MetricSampler, PollPolicy, SamplerMap, Target};
use crate::error::{MonitorError, MonitorResult};
use crate::timing::Schedule;

// ─── Constants ───────────────────────────────────────────────────

pub const MAX_RETRY: u32 = 60;
pub const POLLING_INTERVAL: Duration = Duration::from_secs(2);
pub const POLLING_INTERVAL_INDEXING: Duration = Duration::from_secs(1);
pub const REBALANCE_TIMEOUT: Duration = Duration::from_secs(3600 * 6);
pub const TIMEOUT: Duration = Duration::from_secs(3600 * 12);

pub const DISK_QUEUES: &[&str] = &[
    "ep_queue_size",
    "ep_flusher_todo",
    "ep_diskqueue_items",
    "vb_active_queue_size",
    "vb_replica_queue_size",
];

pub const DCP_QUEUES: &[&str] = &[
    "ep_dcp_replica_items_remaining",
    "ep_dcp_other_items_remaining",
];

pub const XDCR_QUEUES: &[&str] = &["replication_changes_left"];

/// Backlog families that drain to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Disk,
    Dcp,
    Xdcr,
}

impl QueueKind {
    pub fn metrics(self) -> &'static [&'static str] {
        match self {
            Self::Disk => DISK_QUEUES,
            Self::Dcp => DCP_QUEUES,
            Self::Xdcr => XDCR_QUEUES,
        }
    }
}

// ─── Policies ────────────────────────────────────────────────────

/// Queue drains: fixed interval, long time budget, no stall check since
/// backlogs may plateau before dropping.
pub fn drain_policy() -> PollPolicy {
    PollPolicy::fixed(POLLING_INTERVAL, TIMEOUT).absent_is_terminal()
}

/// Count equality: bounded by ticks rather than time.
pub fn count_policy() -> PollPolicy {
    PollPolicy::fixed(POLLING_INTERVAL, TIMEOUT).with_max_retries(MAX_RETRY)
}

/// Long-running tasks: stall detection on the progress value.
pub fn task_policy(hang_timeout: Duration) -> PollPolicy {
    PollPolicy::fixed(POLLING_INTERVAL, TIMEOUT).with_hang_timeout(hang_timeout)
}

/// Slow cross-service sync: tiered backoff.
pub fn sync_policy() -> PollPolicy {
    PollPolicy::tiered(Schedule::slow_sync(), TIMEOUT)
}

fn single(name: &str, sampler: Box<dyn MetricSampler>) -> SamplerMap {
    let mut map = SamplerMap::new();
    map.insert(name.to_owned(), sampler);
    map
}

// ─── Backlog drain ───────────────────────────────────────────────

pub async fn drain_queues(
    stats: Arc<dyn StatsSource>,
    kind: QueueKind,
    policy: &PollPolicy,
) -> MonitorResult<Convergence> {
    info!("Monitoring {kind:?} queues");
    wait_for_convergence(stat_samplers(&stats, kind.metrics()), Target::Zero, policy).await
}

/// Waits for the replication task to show up before draining its queue.
pub async fn drain_xdcr_queues(
    stats: Arc<dyn StatsSource>,
    tasks: Arc<dyn TaskSource>,
    policy: &PollPolicy,
) -> MonitorResult<Convergence> {
    let started = single("xdcr_running", Box::new(TaskRunningSampler::new(tasks, "xdcr")));
    wait_for_convergence(started, Target::Equals(1.0), policy).await?;
    drain_queues(stats, QueueKind::Xdcr, policy).await
}

// ─── Item counts ─────────────────────────────────────────────────

pub async fn wait_for_item_count(
    stats: Arc<dyn StatsSource>,
    metric: &str,
    expected: u64,
    policy: &PollPolicy,
) -> MonitorResult<Convergence> {
    info!("Checking that {metric} reaches {expected}");
    let sampler = Box::new(StatSampler::new(stats, metric));
    wait_for_convergence(single(metric, sampler), Target::Equals(expected as f64), policy).await
}

// ─── Indexes ─────────────────────────────────────────────────────

pub async fn wait_for_index_online(
    source: Arc<dyn IndexSource>,
    index: &str,
    policy: &PollPolicy,
) -> MonitorResult<Convergence> {
    info!("Monitoring state of index {index}");
    let sampler = Box::new(IndexStateSampler::new(source, index, "online"));
    let done = wait_for_convergence(single(index, sampler), Target::Equals(1.0), policy).await?;
    info!("Index \"{index}\" is online");
    Ok(done)
}

/// Outcome of an incremental index build.
#[derive(Debug, Clone)]
pub struct IndexBuild {
    pub convergence: Convergence,
    /// `num_docs_indexed` per index once the backlog drained.
    pub indexed: BTreeMap<String, f64>,
}

pub async fn wait_for_incremental_index_build(
    source: Arc<dyn IndexSource>,
    bucket: &str,
    indexes: &[&str],
    expected_docs: u64,
    policy: &PollPolicy,
) -> MonitorResult<IndexBuild> {
    info!("Expecting {expected_docs} num_docs_indexed for indexes {indexes:?}");
    let samplers: SamplerMap = indexes
        .iter()
        .map(|index| {
            let sampler: Box<dyn MetricSampler> =
                Box::new(IndexBacklogSampler::new(source.clone(), bucket, *index));
            (format!("{bucket}:{index}:backlog"), sampler)
        })
        .collect();
    let convergence = wait_for_convergence(samplers, Target::Zero, policy).await?;

    let stats = source.index_stats().await?;
    let indexed: BTreeMap<String, f64> = indexes
        .iter()
        .filter_map(|index| {
            stats
                .get(&format!("{bucket}:{index}:num_docs_indexed"))
                .map(|v| ((*index).to_owned(), *v))
        })
        .collect();
    for (index, count) in &indexed {
        if *count != expected_docs as f64 {
            warn!("{index} indexed {count} docs, expected {expected_docs}");
        }
    }
    info!("Number of items indexed {indexed:?}");
    Ok(IndexBuild {
        convergence,
        indexed,
    })
}

pub fn index_policy() -> PollPolicy {
    PollPolicy::fixed(POLLING_INTERVAL_INDEXING, TIMEOUT)
}

/// Waits for the initial build of every index in `indexes` and returns the
/// build time.
pub async fn wait_for_secindex_init_build(
    source: Arc<dyn IndexSource>,
    indexes: &[&str],
    policy: &PollPolicy,
) -> MonitorResult<Duration> {
    info!("Waiting for the following indexes to be ready: {indexes:?}");
    let samplers: SamplerMap = indexes
        .iter()
        .map(|index| {
            let sampler: Box<dyn MetricSampler> =
                Box::new(IndexStateSampler::new(source.clone(), *index, "Ready"));
            ((*index).to_owned(), sampler)
        })
        .collect();
    let done = wait_for_convergence(samplers, Target::Equals(1.0), policy).await?;
    info!("secondary index build time: {:?}", done.elapsed);
    Ok(done.elapsed)
}

pub const NUM_CONNECTIONS: &str = "num_connections";

/// Waits until the index node holds at least `expected` client connections.
pub async fn wait_for_num_connections(
    stats: Arc<dyn StatsSource>,
    expected: u64,
    policy: &PollPolicy,
) -> MonitorResult<Convergence> {
    let sampler = Box::new(StatSampler::new(stats, NUM_CONNECTIONS));
    wait_for_convergence(
        single(NUM_CONNECTIONS, sampler),
        Target::AtLeast(expected as f64),
        policy,
    )
    .await
}

// ─── Full-text indexes ───────────────────────────────────────────

/// Waits until the full-text index has indexed `items` documents.
pub async fn monitor_fts_indexing_queue(
    stats: Arc<dyn StatsSource>,
    index: &str,
    items: u64,
    policy: &PollPolicy,
) -> MonitorResult<Convergence> {
    info!("Waiting for indexing to finish");
    let metric = format!("{index}:doc_count");
    let sampler = Box::new(StatSampler::new(stats, metric.as_str()));
    wait_for_convergence(single(&metric, sampler), Target::AtLeast(items as f64), policy).await
}

/// Waits until the full-text index has no records left to persist.
pub async fn monitor_fts_index_persistence(
    stats: Arc<dyn StatsSource>,
    bucket: &str,
    index: &str,
    policy: &PollPolicy,
) -> MonitorResult<Convergence> {
    info!("Waiting for index to be persisted");
    let metric = format!("{bucket}:{index}:num_recs_to_persist");
    let sampler = Box::new(StatSampler::new(stats, metric.as_str()));
    wait_for_convergence(single(&metric, sampler), Target::Zero, policy).await
}

// ─── Warmup ──────────────────────────────────────────────────────

/// Returns the warm time the service itself reports.
pub async fn wait_for_warmup(
    source: Arc<dyn WarmupSource>,
    policy: &PollPolicy,
) -> MonitorResult<Duration> {
    info!("Monitoring warmup status");
    let sampler = Arc::new(WarmupSampler::new(source));
    wait_for_convergence(
        single("ep_warmup_state", Box::new(sampler.clone())),
        Target::Equals(1.0),
        policy,
    )
    .await?;
    let us = sampler.warm_time_us().unwrap_or(0.0).max(0.0);
    Ok(Duration::from_micros(us as u64))
}

// ─── Node health ─────────────────────────────────────────────────

pub async fn wait_for_healthy_nodes(
    primary: Arc<dyn NodeHealthSource>,
    secondary: Arc<dyn NodeHealthSource>,
    policy: &PollPolicy,
) -> MonitorResult<Convergence> {
    info!("Monitoring node health");
    let sampler = Arc::new(UnhealthyNodesSampler::new(primary, secondary));
    let res = wait_for_convergence(
        single("unhealthy_nodes", Box::new(sampler.clone())),
        Target::Zero,
        policy,
    )
    .await;
    match res {
        Err(MonitorError::Exhausted { budget, .. }) => Err(MonitorError::Unhealthy {
            nodes: sampler.last_unhealthy(),
            budget,
        }),
        other => other,
    }
}

pub async fn monitor_analytics_node_active(
    status: Arc<dyn ServiceStatusSource>,
    node: &str,
    policy: &PollPolicy,
) -> MonitorResult<Convergence> {
    info!("Monitoring analytics node health");
    let sampler = Box::new(ServiceActiveSampler::new(status, node));
    wait_for_convergence(
        single(&format!("analytics_active:{node}"), sampler),
        Target::Equals(1.0),
        policy,
    )
    .await
}

// ─── Long-running tasks ──────────────────────────────────────────

pub async fn monitor_task(
    tasks: Arc<dyn TaskSource>,
    task_type: &str,
    policy: &PollPolicy,
) -> MonitorResult<Convergence> {
    info!("Monitoring task: {task_type}");
    let sampler = Box::new(TaskProgressSampler::new(tasks, task_type));
    let done = wait_for_convergence(
        single(&format!("{task_type}_progress"), sampler),
        Target::AtLeast(100.0),
        policy,
    )
    .await?;
    info!("Task {task_type} successfully completed");
    Ok(done)
}

pub async fn monitor_rebalance(tasks: Arc<dyn TaskSource>) -> MonitorResult<Convergence> {
    monitor_task(tasks, "rebalance", &task_policy(REBALANCE_TIMEOUT)).await
}

// ─── Analytics sync ──────────────────────────────────────────────

/// Waits until the downstream copy holds as many items as the source.
pub async fn wait_for_analytics_sync(
    source: Box<dyn MetricSampler>,
    synced: Box<dyn MetricSampler>,
    policy: &PollPolicy,
) -> MonitorResult<Convergence> {
    info!("Waiting for data to be synced to analytics");
    let gap = Box::new(CountGapSampler::new("analytics", source, synced));
    wait_for_convergence(single("sync_gap", gap), Target::Zero, policy).await
}

/// Waits until both the source and its downstream copy are empty.
pub async fn wait_for_analytics_cleanup(
    source: Box<dyn MetricSampler>,
    synced: Box<dyn MetricSampler>,
    policy: &PollPolicy,
) -> MonitorResult<Convergence> {
    info!("Waiting for data to be cleaned up on analytics");
    let mut samplers = SamplerMap::new();
    samplers.insert("source_items".into(), source);
    samplers.insert("synced_items".into(), synced);
    wait_for_convergence(samplers, Target::Zero, policy).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policies_carry_their_tuning() {
        let drain = drain_policy();
        assert!(drain.absent_is_terminal);
        assert_eq!(drain.hang_timeout, None);

        assert_eq!(count_policy().max_retries, Some(MAX_RETRY));
        assert_eq!(
            task_policy(REBALANCE_TIMEOUT).hang_timeout,
            Some(REBALANCE_TIMEOUT)
        );
        assert_eq!(
            sync_policy().schedule.interval_for(12),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn queue_kinds() {
        assert_eq!(QueueKind::Disk.metrics().len(), 5);
        assert_eq!(QueueKind::Xdcr.metrics(), &["replication_changes_left"]);
    }
}
