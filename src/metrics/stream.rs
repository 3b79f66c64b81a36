use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::warn;

use super::collector::MetricsSnapshot;
use crate::AppState;

/// Push period of the SSE stream.
const STREAM_PERIOD: Duration = Duration::from_millis(500);

// ─── GET /api/metrics ────────────────────────────────────────────

pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

// ─── GET /api/metrics/stream ─────────────────────────────────────
/// Server-Sent Events: one `metrics` event carrying a full snapshot every
/// 500 ms, including latency percentiles and the convergence phase log.

pub async fn metrics_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let interval = tokio::time::interval(STREAM_PERIOD);

    let stream = IntervalStream::new(interval).map(move |_| {
        let snapshot = state.metrics.snapshot();
        let event = Event::default().event("metrics");
        Ok(match serde_json::to_string(&snapshot) {
            Ok(json) => event.data(json),
            Err(e) => {
                warn!("cannot serialize metrics snapshot: {e}");
                event.data("{}")
            }
        })
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
