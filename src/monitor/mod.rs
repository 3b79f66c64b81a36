//! Bounded convergence polling.
//!
//! A poll samples a set of named metrics on a schedule until every one of
//! them reaches a [`Target`], a progress value stalls, or the time / retry
//! budget in [`PollPolicy`] runs out. The specializations in [`presets`]
//! bundle a sampler, a target and a policy for each kind of backlog a
//! benchmark phase waits on.

pub mod poller;
pub mod presets;
pub mod sources;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{MonitorResult, PendingMetric};
use crate::timing::Schedule;

pub use poller::{wait_for_convergence, ConvergencePoller, PollState};

// ─── Samplers ────────────────────────────────────────────────────

/// Reads one numeric statistic from a target system. `Ok(None)` means the
/// target did not report the statistic at all.
#[async_trait]
pub trait MetricSampler: Send + Sync {
    async fn sample(&self) -> MonitorResult<Option<f64>>;
}

/// Adapts an async closure into a [`MetricSampler`].
pub struct FnSampler<F>(F);

pub fn sampler_fn<F, Fut>(f: F) -> FnSampler<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = MonitorResult<Option<f64>>> + Send,
{
    FnSampler(f)
}

#[async_trait]
impl<F, Fut> MetricSampler for FnSampler<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = MonitorResult<Option<f64>>> + Send,
{
    async fn sample(&self) -> MonitorResult<Option<f64>> {
        (self.0)().await
    }
}

#[async_trait]
impl<T: MetricSampler + ?Sized> MetricSampler for Arc<T> {
    async fn sample(&self) -> MonitorResult<Option<f64>> {
        (**self).sample().await
    }
}

/// Metric name → sampler.
pub type SamplerMap = BTreeMap<String, Box<dyn MetricSampler>>;

// ─── Data model ──────────────────────────────────────────────────

/// One sampled value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
    pub metric_name: String,
    pub value: f64,
    pub sampled_at: DateTime<Utc>,
}

impl MetricPoint {
    pub fn now(metric_name: impl Into<String>, value: f64) -> Self {
        Self {
            metric_name: metric_name.into(),
            value,
            sampled_at: Utc::now(),
        }
    }
}

/// Terminal condition shared by every metric of one poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    /// Backlog drained.
    Zero,
    /// Exact match, e.g. item counts.
    Equals(f64),
    /// Progress reached or passed a threshold.
    AtLeast(f64),
}

impl Target {
    pub fn is_terminal(&self, value: f64) -> bool {
        match *self {
            Self::Zero => value == 0.0,
            Self::Equals(expected) => value == expected,
            Self::AtLeast(threshold) => value >= threshold,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Zero => f.write_str("0"),
            Self::Equals(v) => write!(f, "{v}"),
            Self::AtLeast(v) => write!(f, ">= {v}"),
        }
    }
}

/// Limits for one poll call.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    /// Pause before each tick.
    pub schedule: Schedule,
    /// Wall-clock budget from poll start.
    pub max_wait: Duration,
    /// Tick budget, used for count-equality checks.
    pub max_retries: Option<u32>,
    /// Progress values unchanged for longer than this stall the poll.
    pub hang_timeout: Option<Duration>,
    /// Extra attempts for a failing sample within one tick.
    pub sample_retries: u32,
    /// Treat a statistic the target no longer reports as converged.
    pub absent_is_terminal: bool,
}

impl PollPolicy {
    pub fn fixed(interval: Duration, max_wait: Duration) -> Self {
        Self {
            schedule: Schedule::Fixed(interval),
            max_wait,
            max_retries: None,
            hang_timeout: None,
            sample_retries: 0,
            absent_is_terminal: false,
        }
    }

    pub fn tiered(schedule: Schedule, max_wait: Duration) -> Self {
        Self {
            schedule,
            ..Self::fixed(Duration::ZERO, max_wait)
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    #[must_use]
    pub fn with_hang_timeout(mut self, hang: Duration) -> Self {
        self.hang_timeout = Some(hang);
        self
    }

    #[must_use]
    pub fn with_sample_retries(mut self, retries: u32) -> Self {
        self.sample_retries = retries;
        self
    }

    #[must_use]
    pub fn absent_is_terminal(mut self) -> Self {
        self.absent_is_terminal = true;
        self
    }
}

/// Metrics that have not reached the target yet.
pub struct QueueSet {
    pending: SamplerMap,
    last: BTreeMap<String, Option<f64>>,
}

impl QueueSet {
    pub fn new(samplers: SamplerMap) -> Self {
        let last = samplers.keys().map(|k| (k.clone(), None)).collect();
        Self {
            pending: samplers,
            last,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }

    pub fn sampler(&self, name: &str) -> Option<&dyn MetricSampler> {
        self.pending.get(name).map(AsRef::as_ref)
    }

    pub fn observe(&mut self, name: &str, value: Option<f64>) {
        if let Some(slot) = self.last.get_mut(name) {
            *slot = value;
        }
    }

    /// Drops a converged metric; it is never sampled again.
    pub fn remove(&mut self, name: &str) {
        self.pending.remove(name);
    }

    pub fn pending_report(&self) -> Vec<PendingMetric> {
        self.pending
            .keys()
            .map(|name| PendingMetric {
                name: name.clone(),
                last_value: self.last.get(name).copied().flatten(),
            })
            .collect()
    }
}

/// Successful poll.
#[derive(Debug, Clone, Serialize)]
pub struct Convergence {
    pub elapsed: Duration,
    pub ticks: u32,
    /// Final value of each metric at the moment it converged.
    pub last: Vec<MetricPoint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets() {
        assert!(Target::Zero.is_terminal(0.0));
        assert!(!Target::Zero.is_terminal(1.0));
        assert!(Target::Equals(1000.0).is_terminal(1000.0));
        assert!(!Target::Equals(1000.0).is_terminal(998.0));
        assert!(Target::AtLeast(100.0).is_terminal(100.0));
        assert!(!Target::AtLeast(100.0).is_terminal(99.5));
        assert_eq!(Target::AtLeast(100.0).to_string(), ">= 100");
    }

    #[tokio::test]
    async fn queue_set_tracks_last_values() {
        let mut samplers = SamplerMap::new();
        samplers.insert(
            "a".into(),
            Box::new(sampler_fn(|| async { Ok(Some(1.0)) })) as Box<dyn MetricSampler>,
        );
        samplers.insert(
            "b".into(),
            Box::new(sampler_fn(|| async { Ok(None) })) as Box<dyn MetricSampler>,
        );
        let mut q = QueueSet::new(samplers);
        assert_eq!(q.len(), 2);

        let v = q.sampler("a").unwrap().sample().await.unwrap();
        q.observe("a", v);
        q.remove("b");

        let report = q.pending_report();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].name, "a");
        assert_eq!(report[0].last_value, Some(1.0));
    }
}
