//! Convergence polling and write-to-feed latency probing for benchmark
//! harnesses, with a small HTTP surface for driving probe runs.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod monitor;
pub mod probe;
pub mod redis_client;
pub mod server;
pub mod timing;

pub use error::{FailureKind, MonitorError, MonitorResult};
pub use monitor::{wait_for_convergence, PollPolicy, Target};
pub use probe::{measure_latency, LatencyProbe, ProbeKey, RaceResult};

/// Shared application state available to every handler via `State<Arc<AppState>>`.
pub struct AppState {
    pub config: config::Config,

    /// Probe wired to its writer and change feed; cloned into each run.
    pub probe: LatencyProbe,

    /// Reporting sink: the runner reports into it, the metrics routes read it.
    pub metrics: Arc<metrics::MetricsCollector>,

    /// Checked by the runner between probes.
    pub probe_running: Arc<AtomicBool>,

    /// Handle to the spawned run so `stop` can await it.
    pub probe_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<probe::runner::RunSummary>>>,
}

impl AppState {
    pub fn new(config: config::Config, probe: LatencyProbe) -> Self {
        Self {
            config,
            probe,
            metrics: Arc::new(metrics::MetricsCollector::new()),
            probe_running: Arc::new(AtomicBool::new(false)),
            probe_handle: tokio::sync::Mutex::new(None),
        }
    }
}
