use axum::{extract::Request, middleware::Next, response::Response};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Adds `X-Response-Time-Us` and `Server-Timing` headers and logs each
/// control-route request. The SSE route is long-lived and not logged.
pub async fn timing_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let start = Instant::now();
    let mut response = next.run(req).await;
    let elapsed = start.elapsed();
    let us = elapsed.as_micros();

    if let Ok(val) = us.to_string().parse() {
        response.headers_mut().insert("X-Response-Time-Us", val);
    }
    let server_timing = format!("total;dur={:.3}", elapsed.as_secs_f64() * 1000.0);
    if let Ok(val) = server_timing.parse() {
        response.headers_mut().insert("Server-Timing", val);
    }

    let status = response.status().as_u16();
    if path.ends_with("/stream") {
        debug!(%method, %path, status, "stream opened");
    } else if status >= 400 {
        warn!(%method, %path, status, elapsed_us = us as u64, "request failed");
    } else {
        info!(%method, %path, status, elapsed_us = us as u64, "request");
    }

    response
}
