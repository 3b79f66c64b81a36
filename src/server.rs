use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::handlers;
use crate::metrics::stream;
use crate::middleware::timing;
use crate::AppState;

/// Builds the `Router`: probe control, metrics views, middleware.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // ── Probe control ───────────────────────────────────────
        .route("/api/probe/start", post(handlers::probe::start_probe))
        .route("/api/probe/stop", post(handlers::probe::stop_probe))
        .route("/api/probe/status", get(handlers::probe::probe_status))
        .route("/api/probe/sample", post(handlers::probe::sample_once))
        // ── Metrics ─────────────────────────────────────────────
        .route("/api/metrics", get(stream::get_metrics))
        .route("/api/metrics/stream", get(stream::metrics_stream))
        .with_state(state)
        // ── Global middleware (applied bottom-up) ───────────────
        .layer(axum_mw::from_fn(timing::timing_middleware))
        .layer(CorsLayer::permissive())
}
