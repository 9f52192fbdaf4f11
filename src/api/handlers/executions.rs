//! Live execution HTTP handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::executions::{Execution, StopResponse};
use crate::services::Services;

pub async fn list_executions(State(services): State<Arc<Services>>) -> Json<Vec<Execution>> {
    Json(services.engine.registry().list().await)
}

pub async fn get_execution(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> AppResult<Json<Execution>> {
    services
        .engine
        .registry()
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::not_found("Execution", id))
}

/// Latest execution for a task, running or recently finished
pub async fn task_execution(
    State(services): State<Arc<Services>>,
    Path(task_id): Path<String>,
) -> Json<Option<Execution>> {
    Json(services.engine.registry().get_by_task(&task_id).await)
}

pub async fn stop_execution(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> AppResult<Json<StopResponse>> {
    Ok(Json(services.engine.stop(&id).await?))
}

/// Drop a finished execution from the live view
pub async fn dismiss_execution(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let dismissed = services.engine.registry().dismiss(&id).await?;
    Ok(Json(json!({ "success": dismissed, "execution_id": id })))
}
