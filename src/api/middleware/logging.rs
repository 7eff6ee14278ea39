//! Request logging middleware.

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{debug, info};

/// Logs every request with status and latency. Health probes log at debug
/// level since orchestrators poll them constantly.
pub async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let duration_ms = start.elapsed().as_millis();
    if path == "/health" {
        debug!(%method, path, status, duration_ms, "Request completed");
    } else {
        info!(%method, path, status, duration_ms, "Request completed");
    }

    response
}
