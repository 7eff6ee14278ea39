//! Axum server setup and routing.

use axum::{middleware, routing::get, Router};
use std::net::SocketAddr;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::api::{handlers, middleware as api_middleware};
use crate::app_state::AppState;

/// Router with `GET /health` and `GET /stream`.
pub fn build_router(state: AppState) -> Router {
    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(api_middleware::logging::log_requests));

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/stream", get(handlers::stream::websocket_handler))
        .layer(middleware_stack)
        .with_state(state)
}

/// Serve the API on `port` until `shutdown` flips to `true`.
///
/// # Errors
///
/// Returns an I/O error if the port cannot be bound or the server fails.
pub async fn run_server(
    state: AppState,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;

    info!("API server stopped");
    Ok(())
}
