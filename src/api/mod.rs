//! HTTP API server module
//!
//! REST endpoints for tasks, history, scheduler, approvals and cron validation, plus
//! WebSocket streams of execution events.

pub mod handlers;
mod routes;
pub mod ws;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::services::Services;

/// Full application router with CORS and request tracing
pub fn router(services: Arc<Services>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes::create_router(services)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Serve the API until `shutdown` resolves
pub async fn serve(
    services: Arc<Services>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = services.config.bind_addr();
    if services.config.api_host == "0.0.0.0" {
        warn!(%addr, "server binding to all interfaces, API is reachable from the network");
    }

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP API listening");

    axum::serve(listener, router(services))
        .with_graceful_shutdown(shutdown)
        .await
}
