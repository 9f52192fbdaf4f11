use axum::Json;
use serde::Deserialize;

use crate::scheduler::cron::{self, CronValidation};

#[derive(Deserialize)]
pub struct ValidateRequest {
    expression: String,
}

/// Validate a cron expression and preview its next fire times
pub async fn validate(Json(req): Json<ValidateRequest>) -> Json<CronValidation> {
    Json(cron::validate(&req.expression))
}
