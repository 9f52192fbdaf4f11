//! Execution history HTTP handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::AppResult;
use crate::logs::{ExecutionResult, LogFilter, LogStats};
use crate::services::Services;

const DEFAULT_TASK_LOG_LIMIT: usize = 20;

pub async fn list_logs(
    State(services): State<Arc<Services>>,
    Query(filter): Query<LogFilter>,
) -> AppResult<Json<Vec<ExecutionResult>>> {
    Ok(Json(services.logs.query(&filter).await?))
}

pub async fn log_stats(State(services): State<Arc<Services>>) -> AppResult<Json<LogStats>> {
    Ok(Json(services.logs.stats().await?))
}

#[derive(Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

pub async fn task_logs(
    State(services): State<Arc<Services>>,
    Path(task_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> AppResult<Json<Vec<ExecutionResult>>> {
    let limit = query.limit.unwrap_or(DEFAULT_TASK_LOG_LIMIT);
    Ok(Json(services.logs.task_logs(&task_id, limit).await?))
}

pub async fn latest_task_log(
    State(services): State<Arc<Services>>,
    Path(task_id): Path<String>,
) -> AppResult<Json<Option<ExecutionResult>>> {
    Ok(Json(services.logs.latest(&task_id).await?))
}

pub async fn clear_task_logs(
    State(services): State<Arc<Services>>,
    Path(task_id): Path<String>,
) -> AppResult<Json<Value>> {
    let cleared = services.logs.clear_task(&task_id).await?;
    Ok(Json(json!({
        "success": true,
        "cleared": cleared,
        "task_id": task_id,
    })))
}
