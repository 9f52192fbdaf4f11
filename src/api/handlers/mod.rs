//! HTTP request handlers

pub mod approvals;
pub mod cron;
pub mod executions;
pub mod logs;
pub mod scheduler;
pub mod tasks;

use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    timestamp: DateTime<Utc>,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    })
}
