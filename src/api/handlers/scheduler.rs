//! Scheduler HTTP handlers

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use crate::error::AppResult;
use crate::scheduler::{DueTask, RunDueReport, SchedulerStatus, UpcomingRun};
use crate::services::Services;

const DEFAULT_UPCOMING_HOURS: u32 = 24;

pub async fn status(State(services): State<Arc<Services>>) -> Json<SchedulerStatus> {
    Json(services.scheduler.status().await)
}

#[derive(Deserialize)]
pub struct UpcomingQuery {
    hours: Option<u32>,
}

pub async fn upcoming(
    State(services): State<Arc<Services>>,
    Query(query): Query<UpcomingQuery>,
) -> AppResult<Json<Vec<UpcomingRun>>> {
    let hours = query.hours.unwrap_or(DEFAULT_UPCOMING_HOURS);
    Ok(Json(services.scheduler.upcoming(hours).await?))
}

#[derive(Deserialize)]
pub struct DueQuery {
    window_seconds: Option<u64>,
    #[serde(default)]
    dry_run: bool,
}

pub async fn due(
    State(services): State<Arc<Services>>,
    Query(query): Query<DueQuery>,
) -> AppResult<Json<Vec<DueTask>>> {
    Ok(Json(services.scheduler.due(query.window_seconds).await?))
}

/// Dispatch every due task immediately
pub async fn run_due(
    State(services): State<Arc<Services>>,
    Query(query): Query<DueQuery>,
) -> AppResult<Json<RunDueReport>> {
    let report = services
        .scheduler
        .run_due(query.window_seconds, query.dry_run)
        .await?;
    Ok(Json(report))
}
