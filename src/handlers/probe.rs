use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::AppError;
use crate::metrics::{Report, Reporter};
use crate::probe::runner::{self, RunPlan, RunSummary};
use crate::AppState;

/// How long `stop` waits for an in-flight probe before aborting the run.
const STOP_GRACE: Duration = Duration::from_secs(5);

// ─── Request / response types ────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    #[serde(default = "default_duration")]
    pub duration_secs: u64,

    /// Pause between probes; the configured sample interval when absent.
    #[serde(default)]
    pub interval_ms: Option<u64>,

    #[serde(default)]
    pub max_probes: Option<u64>,
}

fn default_duration() -> u64 {
    30
}

#[derive(Debug, Serialize)]
pub struct ProbeStatus {
    pub running: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
}

// ─── POST /api/probe/start ───────────────────────────────────────

pub async fn start_probe(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartRequest>,
) -> Result<Json<ProbeStatus>, AppError> {
    let max_secs = state.config.probe.max_run_secs;
    if req.duration_secs == 0 || req.duration_secs > max_secs {
        return Err(AppError::BadRequest(format!(
            "duration_secs must be between 1 and {max_secs}"
        )));
    }
    if req.max_probes == Some(0) {
        return Err(AppError::BadRequest("max_probes must be at least 1".into()));
    }

    // Hold the handle lock across the check so two starts cannot race.
    let mut guard = state.probe_handle.lock().await;
    if state.probe_running.load(Ordering::SeqCst) {
        return Err(AppError::AlreadyRunning);
    }

    let plan = RunPlan {
        duration: Duration::from_secs(req.duration_secs),
        max_probes: req.max_probes,
        interval: req
            .interval_ms
            .map_or(state.probe.settings().sample_interval, Duration::from_millis),
    };
    let msg = format!(
        "Started: probing for {}s every {}ms",
        req.duration_secs,
        plan.interval.as_millis()
    );

    state.metrics.reset();
    state.probe_running.store(true, Ordering::SeqCst);

    let running = state.probe_running.clone();
    let reporter: Arc<dyn Reporter> = state.metrics.clone();
    let probe = state.probe.clone();
    *guard = Some(tokio::spawn(runner::run(running, reporter, probe, plan)));

    Ok(Json(ProbeStatus {
        running: true,
        message: msg,
        summary: None,
    }))
}

// ─── POST /api/probe/stop ────────────────────────────────────────

pub async fn stop_probe(State(state): State<Arc<AppState>>) -> Json<ProbeStatus> {
    state.probe_running.store(false, Ordering::SeqCst);

    let mut guard = state.probe_handle.lock().await;
    let Some(mut handle) = guard.take() else {
        return Json(ProbeStatus {
            running: false,
            message: "No probe run in progress".into(),
            summary: None,
        });
    };

    let summary = match tokio::time::timeout(STOP_GRACE, &mut handle).await {
        Ok(Ok(summary)) => Some(summary),
        Ok(Err(e)) => {
            warn!("probe run ended abnormally: {e}");
            None
        }
        Err(_) => {
            warn!("probe still in flight after {STOP_GRACE:?}, aborting run");
            handle.abort();
            None
        }
    };

    Json(ProbeStatus {
        running: false,
        message: "Probe run stopped".into(),
        summary,
    })
}

// ─── GET /api/probe/status ───────────────────────────────────────

pub async fn probe_status(State(state): State<Arc<AppState>>) -> Json<ProbeStatus> {
    let running = state.probe_running.load(Ordering::SeqCst);
    let snap = state.metrics.snapshot();
    Json(ProbeStatus {
        running,
        message: if running {
            format!("Probing: {} samples so far", snap.total_probes)
        } else {
            "Idle".into()
        },
        summary: Some(RunSummary {
            probes: snap.total_probes,
            failures: snap.total_failures,
        }),
    })
}

// ─── POST /api/probe/sample ──────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct SampleResponse {
    pub key: String,
    pub latency_ms: u64,
}

/// Takes one sample outside any run and returns it. Holds the run handle
/// for the whole sample, so a start waits for it to finish.
pub async fn sample_once(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SampleResponse>, AppError> {
    let _guard = state.probe_handle.lock().await;
    if state.probe_running.load(Ordering::SeqCst) {
        return Err(AppError::AlreadyRunning);
    }
    let res = state.probe.measure(0).await;
    state.metrics.report(Report::from_probe(&res));
    let sample = res?;
    Ok(Json(SampleResponse {
        key: sample.key.to_string(),
        latency_ms: sample.latency_ms(),
    }))
}
