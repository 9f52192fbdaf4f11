//! Task HTTP handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::AppResult;
use crate::executions::{RunSummary, StopResponse};
use crate::services::Services;
use crate::tasks::{TaskCreate, TaskStats, TaskUpdate, TaskView};

#[derive(Deserialize, Default)]
pub struct ListQuery {
    #[serde(default)]
    summary_only: bool,
}

/// List all tasks, newest definitions last
pub async fn list_tasks(
    State(services): State<Arc<Services>>,
    Query(query): Query<ListQuery>,
) -> Json<Value> {
    let now = Utc::now();
    let tasks = services.tasks.list().await;
    if query.summary_only {
        let summaries: Vec<_> = tasks.iter().map(|t| t.to_summary(now)).collect();
        Json(json!(summaries))
    } else {
        let views: Vec<_> = tasks.iter().map(|t| t.to_view(now)).collect();
        Json(json!(views))
    }
}

pub async fn create_task(
    State(services): State<Arc<Services>>,
    Json(req): Json<TaskCreate>,
) -> AppResult<(StatusCode, Json<TaskView>)> {
    let task = services.tasks.create(req).await?;
    Ok((StatusCode::CREATED, Json(task.to_view(Utc::now()))))
}

pub async fn get_task(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> AppResult<Json<TaskView>> {
    let task = services.tasks.get(&id).await?;
    Ok(Json(task.to_view(Utc::now())))
}

pub async fn update_task(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
    Json(update): Json<TaskUpdate>,
) -> AppResult<Json<TaskView>> {
    let task = services.tasks.update(&id, update).await?;
    Ok(Json(task.to_view(Utc::now())))
}

pub async fn delete_task(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let task = services.tasks.delete(&id).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Task '{}' deleted", task.name),
        "id": task.id,
    })))
}

pub async fn enable_task(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> AppResult<Json<TaskView>> {
    let task = services.tasks.enable(&id).await?;
    Ok(Json(task.to_view(Utc::now())))
}

pub async fn disable_task(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> AppResult<Json<TaskView>> {
    let task = services.tasks.disable(&id).await?;
    Ok(Json(task.to_view(Utc::now())))
}

#[derive(Deserialize, Default)]
pub struct RunQuery {
    #[serde(default)]
    dry_run: bool,
}

/// Run a task now and wait for it to finish or park for approval
pub async fn run_task(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
    Query(query): Query<RunQuery>,
) -> AppResult<Json<RunSummary>> {
    let task = services.tasks.get(&id).await?;
    let summary = services.engine.run_task(&task, query.dry_run).await?;
    Ok(Json(summary))
}

pub async fn stop_task(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> AppResult<Json<StopResponse>> {
    services.tasks.get(&id).await?;
    Ok(Json(services.engine.stop_task(&id).await?))
}

pub async fn task_stats(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> AppResult<Json<TaskStats>> {
    services.tasks.get(&id).await?;
    Ok(Json(services.logs.task_stats(&id).await?))
}
