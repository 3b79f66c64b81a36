use std::collections::{HashMap, VecDeque};

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use super::percentiles::PercentileSet;
use super::{PhaseOutcome, Report, Reporter};
use crate::error::FailureKind;
use crate::timing::as_millis;

// ─── Configuration ───────────────────────────────────────────────

/// Individual probes kept for the live feed.
const MAX_RECENT_SAMPLES: usize = 200;

/// Convergence phases kept in the log.
const MAX_PHASES: usize = 100;

const TIMELINE_WINDOW_MS: u64 = 500;

/// 1 ms → 1 h, 3 significant figures
const HIST_LOW: u64 = 1;
const HIST_HIGH: u64 = 3_600_000;
const HIST_SIGFIG: u8 = 3;

// ─── Public types ────────────────────────────────────────────────

/// Thread-safe sink for probe and convergence outcomes.
/// The runner reports into it; the HTTP layer reads snapshots.
pub struct MetricsCollector {
    inner: Mutex<Inner>,
}

/// A single entry in the live probe feed.
#[derive(Debug, Clone, Serialize)]
pub struct SampleRecord {
    pub timestamp_ms: u64,
    pub key: Option<String>,
    pub latency_ms: Option<u64>,
    pub failure: Option<FailureKind>,
}

/// One aggregated point on the timeline (per 500 ms window).
#[derive(Debug, Clone, Serialize)]
pub struct TimelinePoint {
    pub timestamp_ms: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DistBucket {
    pub range_start_ms: u64,
    pub range_end_ms: u64,
    pub count: u64,
}

/// Everything the HTTP layer ships on each tick.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub latency: PercentileSet,

    pub total_probes: u64,
    pub total_failures: u64,
    pub failures_by_kind: HashMap<FailureKind, u64>,
    pub probes_per_sec: f64,
    pub elapsed_secs: f64,

    pub recent_samples: Vec<SampleRecord>,
    pub timeline: Vec<TimelinePoint>,
    pub distribution: Vec<DistBucket>,
    pub phases: Vec<PhaseOutcome>,
}

// ─── Internal state ──────────────────────────────────────────────

struct Inner {
    latency_hist: Histogram<u64>,

    total_probes: u64,
    total_failures: u64,
    failures_by_kind: HashMap<FailureKind, u64>,

    recent_samples: VecDeque<SampleRecord>,

    timeline: Vec<TimelinePoint>,
    current_window: Option<WindowAccumulator>,

    phases: VecDeque<PhaseOutcome>,

    start_time: Option<Instant>,
}

struct WindowAccumulator {
    window_start_ms: u64,
    latency_sum: u64,
    latency_max: u64,
    count: u64,
}

impl WindowAccumulator {
    fn open(window_start_ms: u64, latency_ms: u64) -> Self {
        Self {
            window_start_ms,
            latency_sum: latency_ms,
            latency_max: latency_ms,
            count: 1,
        }
    }

    fn add(&mut self, latency_ms: u64) {
        self.latency_sum += latency_ms;
        self.latency_max = self.latency_max.max(latency_ms);
        self.count += 1;
    }

    fn point(&self) -> TimelinePoint {
        TimelinePoint {
            timestamp_ms: self.window_start_ms,
            avg_latency_ms: self.latency_sum as f64 / self.count as f64,
            max_latency_ms: self.latency_max,
            count: self.count,
        }
    }
}

// ─── MetricsCollector impl ───────────────────────────────────────

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Wipe all data; called when a new probe run starts.
    pub fn reset(&self) {
        *self.inner.lock() = Inner::new();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().snapshot()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for MetricsCollector {
    fn report(&self, report: Report) {
        match &report {
            Report::Latency { key, latency } => {
                info!(%key, latency_ms = as_millis(*latency), "probe sample");
            }
            Report::ProbeFailed { kind, message } => warn!(%kind, "probe failed: {message}"),
            Report::Phase(p) if p.succeeded() => info!(phase = %p.phase, "{}", p.detail),
            Report::Phase(p) => warn!(phase = %p.phase, "{}", p.detail),
        }
        self.inner.lock().record(report);
    }
}

// ─── Inner impl ──────────────────────────────────────────────────

fn latency_histogram() -> Histogram<u64> {
    // Bounds are constants within the supported range.
    Histogram::new_with_bounds(HIST_LOW, HIST_HIGH, HIST_SIGFIG).expect("histogram bounds")
}

impl Inner {
    fn new() -> Self {
        Self {
            latency_hist: latency_histogram(),
            total_probes: 0,
            total_failures: 0,
            failures_by_kind: HashMap::new(),
            recent_samples: VecDeque::with_capacity(MAX_RECENT_SAMPLES + 1),
            timeline: Vec::with_capacity(1024),
            current_window: None,
            phases: VecDeque::new(),
            start_time: None,
        }
    }

    fn record(&mut self, report: Report) {
        let start = *self.start_time.get_or_insert_with(Instant::now);
        let elapsed_ms = as_millis(start.elapsed());

        let entry = match report {
            Report::Phase(outcome) => {
                self.phases.push_back(outcome);
                if self.phases.len() > MAX_PHASES {
                    self.phases.pop_front();
                }
                return;
            }
            Report::Latency { key, latency } => {
                self.total_probes += 1;
                // Clamp to the histogram range; sub-millisecond samples count as 1 ms.
                let ms = as_millis(latency).clamp(HIST_LOW, HIST_HIGH);
                let _ = self.latency_hist.record(ms);
                self.push_to_timeline(elapsed_ms, ms);
                SampleRecord {
                    timestamp_ms: elapsed_ms,
                    key: Some(key.to_string()),
                    latency_ms: Some(as_millis(latency)),
                    failure: None,
                }
            }
            Report::ProbeFailed { kind, .. } => {
                self.total_probes += 1;
                self.total_failures += 1;
                *self.failures_by_kind.entry(kind).or_default() += 1;
                SampleRecord {
                    timestamp_ms: elapsed_ms,
                    key: None,
                    latency_ms: None,
                    failure: Some(kind),
                }
            }
        };

        self.recent_samples.push_back(entry);
        if self.recent_samples.len() > MAX_RECENT_SAMPLES {
            self.recent_samples.pop_front();
        }
    }

    /// Bucket the sample into the current window, or roll over.
    fn push_to_timeline(&mut self, elapsed_ms: u64, latency_ms: u64) {
        let window_start = (elapsed_ms / TIMELINE_WINDOW_MS) * TIMELINE_WINDOW_MS;

        if let Some(w) = self
            .current_window
            .as_mut()
            .filter(|w| w.window_start_ms == window_start)
        {
            w.add(latency_ms);
            return;
        }
        let fresh = WindowAccumulator::open(window_start, latency_ms);
        if let Some(old) = self.current_window.replace(fresh) {
            self.timeline.push(old.point());
        }
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let elapsed_secs = self
            .start_time
            .map_or(0.0, |t| t.elapsed().as_secs_f64());

        let probes_per_sec = if elapsed_secs > 0.0 {
            self.total_probes as f64 / elapsed_secs
        } else {
            0.0
        };

        // Include the current (partial) window
        let mut timeline = self.timeline.clone();
        if let Some(w) = &self.current_window {
            timeline.push(w.point());
        }

        MetricsSnapshot {
            latency: PercentileSet::from_histogram(&self.latency_hist),
            total_probes: self.total_probes,
            total_failures: self.total_failures,
            failures_by_kind: self.failures_by_kind.clone(),
            probes_per_sec,
            elapsed_secs,
            recent_samples: self.recent_samples.iter().cloned().collect(),
            timeline,
            distribution: Self::compute_distribution(&self.latency_hist),
            phases: self.phases.iter().cloned().collect(),
        }
    }

    // ── Distribution buckets ─────────────────────────────────────

    /// Bucket boundaries (ms), from same-host feeds up to slow imports.
    const DIST_BOUNDARIES: &'static [u64] = &[
        1, 2, 5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 60_000,
    ];

    fn compute_distribution(hist: &Histogram<u64>) -> Vec<DistBucket> {
        if hist.is_empty() {
            return Vec::new();
        }

        let bounds = Self::DIST_BOUNDARIES;
        let mut counts = vec![0u64; bounds.len() + 1];

        for iv in hist.iter_recorded() {
            // First boundary >= value; past the end is overflow.
            let idx = bounds
                .binary_search(&iv.value_iterated_to())
                .unwrap_or_else(|i| i);
            counts[idx] += iv.count_at_value();
        }

        let mut result = Vec::new();
        let mut prev = 0u64;
        for (&boundary, &count) in bounds.iter().zip(&counts) {
            if count > 0 {
                result.push(DistBucket {
                    range_start_ms: prev,
                    range_end_ms: boundary,
                    count,
                });
            }
            prev = boundary;
        }
        let overflow = counts[bounds.len()];
        if overflow > 0 {
            result.push(DistBucket {
                range_start_ms: prev,
                range_end_ms: hist.max(),
                count: overflow,
            });
        }
        result
    }
}
