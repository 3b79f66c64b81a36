use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use super::LatencyProbe;
use crate::metrics::{Report, Reporter};
use crate::timing::Deadline;

// ─── Run plan ────────────────────────────────────────────────────

/// Bounds for one sampling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPlan {
    pub duration: Duration,
    /// Stop after this many probes, successful or not.
    pub max_probes: Option<u64>,
    /// Pause between consecutive probes.
    pub interval: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub probes: u64,
    pub failures: u64,
}

// ─── Public entry point ──────────────────────────────────────────

/// Takes latency samples one after another until the plan runs out or
/// `running` is cleared. Probes never overlap, so their keys cannot
/// cross-match. A probe still in flight when the run deadline passes is
/// cancelled and not reported.
pub async fn run(
    running: Arc<AtomicBool>,
    reporter: Arc<dyn Reporter>,
    probe: LatencyProbe,
    plan: RunPlan,
) -> RunSummary {
    let deadline = Deadline::after(plan.duration);
    let mut summary = RunSummary::default();
    info!(
        duration_secs = plan.duration.as_secs(),
        interval_ms = plan.interval.as_millis() as u64,
        "probe run started"
    );

    while running.load(Ordering::Relaxed) && !deadline.expired() {
        if plan.max_probes.is_some_and(|max| summary.probes >= max) {
            break;
        }

        let Ok(res) = tokio::time::timeout_at(deadline.at(), probe.measure(summary.probes)).await
        else {
            debug!("run deadline reached with a probe in flight");
            break;
        };
        summary.probes += 1;
        if res.is_err() {
            summary.failures += 1;
        }
        reporter.report(Report::from_probe(&res));

        if !deadline.sleep(plan.interval).await {
            break;
        }
    }

    // Mark the run as finished
    running.store(false, Ordering::SeqCst);
    info!(
        probes = summary.probes,
        failures = summary.failures,
        "probe run finished"
    );
    summary
}
