//! Reporting sink for probe samples and convergence phases.

pub mod collector;
pub mod percentiles;
pub mod stream;

use std::future::Future;
use std::time::Duration;

use serde::Serialize;

use crate::error::{FailureKind, MonitorError, MonitorResult};
use crate::monitor::Convergence;
use crate::probe::{ProbeKey, RaceResult};
use crate::timing::as_millis;

pub use collector::{MetricsCollector, MetricsSnapshot};

/// Receives every completed probe and poll. Implementations must not block.
pub trait Reporter: Send + Sync {
    fn report(&self, report: Report);
}

/// One outcome handed to a [`Reporter`].
#[derive(Debug, Clone)]
pub enum Report {
    /// A successful latency sample.
    Latency { key: ProbeKey, latency: Duration },
    /// A probe that ended without a sample.
    ProbeFailed { kind: FailureKind, message: String },
    /// A convergence wait finished, either way.
    Phase(PhaseOutcome),
}

impl Report {
    pub fn from_probe(res: &MonitorResult<RaceResult>) -> Self {
        match res {
            Ok(r) => Self::Latency {
                key: r.key.clone(),
                latency: r.latency,
            },
            Err(e) => Self::ProbeFailed {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }
}

/// Summary of one named convergence wait.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseOutcome {
    pub phase: String,
    pub elapsed_ms: Option<u64>,
    pub ticks: Option<u32>,
    pub failure: Option<FailureKind>,
    pub detail: String,
}

impl PhaseOutcome {
    pub fn new(phase: impl Into<String>, res: &Result<Convergence, MonitorError>) -> Self {
        let phase = phase.into();
        match res {
            Ok(c) => Self {
                detail: format!("converged after {} ticks", c.ticks),
                elapsed_ms: Some(as_millis(c.elapsed)),
                ticks: Some(c.ticks),
                failure: None,
                phase,
            },
            Err(e) => Self {
                elapsed_ms: None,
                ticks: None,
                failure: Some(e.kind()),
                detail: e.to_string(),
                phase,
            },
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Awaits one named convergence wait and reports how it ended.
pub async fn run_phase<F>(
    reporter: &dyn Reporter,
    phase: &str,
    wait: F,
) -> MonitorResult<Convergence>
where
    F: Future<Output = MonitorResult<Convergence>>,
{
    let res = wait.await;
    reporter.report(Report::Phase(PhaseOutcome::new(phase, &res)));
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Budget, PendingMetric};
    use crate::monitor::{sampler_fn, wait_for_convergence, PollPolicy, SamplerMap, Target};

    #[test]
    fn failed_phase_keeps_diagnostics() {
        let res: MonitorResult<Convergence> = Err(MonitorError::Exhausted {
            budget: Budget::Retries(60),
            pending: vec![PendingMetric {
                name: "curr_items".into(),
                last_value: Some(998.0),
            }],
            expected: "1000".into(),
        });
        let outcome = PhaseOutcome::new("item_count", &res);
        assert!(!outcome.succeeded());
        assert_eq!(outcome.failure, Some(FailureKind::Exhausted));
        assert!(outcome.detail.contains("curr_items=998"));
    }

    #[test]
    fn converged_phase() {
        let res = Ok(Convergence {
            elapsed: Duration::from_secs(8),
            ticks: 4,
            last: Vec::new(),
        });
        let outcome = PhaseOutcome::new("disk_queues", &res);
        assert!(outcome.succeeded());
        assert_eq!(outcome.elapsed_ms, Some(8000));
        assert_eq!(outcome.ticks, Some(4));
    }

    #[tokio::test(start_paused = true)]
    async fn finished_waits_land_in_the_phase_log() {
        let metrics = MetricsCollector::new();
        let policy = PollPolicy::fixed(Duration::from_secs(2), Duration::from_secs(10));

        let mut samplers = SamplerMap::new();
        samplers.insert(
            "ep_queue_size".into(),
            Box::new(sampler_fn(|| async { Ok(Some(0.0)) })),
        );
        run_phase(
            &metrics,
            "disk_queues",
            wait_for_convergence(samplers, Target::Zero, &policy),
        )
        .await
        .unwrap();

        let mut samplers = SamplerMap::new();
        samplers.insert(
            "curr_items".into(),
            Box::new(sampler_fn(|| async { Ok(Some(998.0)) })),
        );
        let err = run_phase(
            &metrics,
            "item_count",
            wait_for_convergence(samplers, Target::Equals(1000.0), &policy),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Exhausted);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_probes, 0);
        assert_eq!(snap.phases.len(), 2);
        assert_eq!(snap.phases[0].phase, "disk_queues");
        assert_eq!(snap.phases[0].ticks, Some(1));
        assert!(snap.phases[0].succeeded());
        assert_eq!(snap.phases[1].phase, "item_count");
        assert_eq!(snap.phases[1].failure, Some(FailureKind::Exhausted));
    }
}
