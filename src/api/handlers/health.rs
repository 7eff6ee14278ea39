//! Health check endpoint.

use axum::{extract::State, http::StatusCode, Json};
use std::time::SystemTime;
use tracing::{instrument, warn};

use crate::api::models::{HealthResponse, HealthStatus};
use crate::app_state::AppState;

/// Returns indexer health: 200 when healthy, 503 otherwise.
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let uptime = SystemTime::now()
        .duration_since(state.start_time)
        .unwrap_or_default()
        .as_secs();

    let report = state.monitor.report();
    let mut reasons = report.reasons;

    let database_status = match state.repository.health_check().await {
        Ok(()) => HealthStatus::Healthy,
        Err(e) => {
            warn!(error = %e, "Database health check failed");
            reasons.push("database unreachable".to_string());
            HealthStatus::Unhealthy
        }
    };

    let (code, status) = if reasons.is_empty() {
        (StatusCode::OK, HealthStatus::Healthy)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, HealthStatus::Unhealthy)
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            database_status,
            reasons,
            stats: report.stats,
        }),
    )
}
