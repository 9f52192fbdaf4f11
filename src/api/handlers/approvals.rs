//! Plan approval HTTP handlers
//!
//! Mutating calls always answer with `{success, message, approval}`. A rejected action
//! carries the approval as it currently stands.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use crate::approvals::{Approval, ApprovalActionResult, ApprovalStats, ApprovalStatus, ApprovalSummary};
use crate::error::{AppError, AppResult, ErrorCode};
use crate::services::Services;

#[derive(Deserialize)]
pub struct ListQuery {
    status: Option<ApprovalStatus>,
}

pub async fn list_approvals(
    State(services): State<Arc<Services>>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<ApprovalSummary>> {
    Json(services.approvals.list(query.status).await)
}

pub async fn approval_stats(State(services): State<Arc<Services>>) -> Json<ApprovalStats> {
    Json(services.approvals.stats().await)
}

pub async fn get_approval(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
) -> AppResult<Json<Approval>> {
    Ok(Json(services.approvals.get(&id).await?))
}

pub async fn approve(State(services): State<Arc<Services>>, Path(id): Path<String>) -> Response {
    let result = services.approvals.approve(&id).await;
    respond(&services, &id, result, "Plan approved, execution resumed").await
}

#[derive(Deserialize)]
pub struct DiscussRequest {
    #[serde(default)]
    feedback: String,
}

pub async fn discuss(
    State(services): State<Arc<Services>>,
    Path(id): Path<String>,
    Json(req): Json<DiscussRequest>,
) -> Response {
    let result = services.approvals.discuss(&id, &req.feedback).await;
    respond(&services, &id, result, "Feedback sent, waiting for revised plan").await
}

pub async fn cancel(State(services): State<Arc<Services>>, Path(id): Path<String>) -> Response {
    let result = services.approvals.cancel(&id).await;
    respond(&services, &id, result, "Plan cancelled").await
}

async fn respond(
    services: &Services,
    id: &str,
    result: AppResult<Approval>,
    message: &str,
) -> Response {
    match result {
        Ok(approval) => Json(ApprovalActionResult {
            success: true,
            message: message.to_string(),
            approval: Some(approval),
        })
        .into_response(),
        Err(e) if rejected(&e) => {
            let status = e.code.status();
            let body = ApprovalActionResult {
                success: false,
                message: e.message,
                approval: services.approvals.get(id).await.ok(),
            };
            (status, Json(body)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// Errors that leave the approval untouched and are reported in the action body
fn rejected(error: &AppError) -> bool {
    matches!(
        error.code,
        ErrorCode::InvalidState | ErrorCode::IterationLimit | ErrorCode::ValidationError
    )
}
