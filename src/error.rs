use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Structured error type shared by every service and surfaced 1:1 over HTTP
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{code:?}: {message}{}", detail_suffix(.details))]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

fn detail_suffix(details: &Option<String>) -> String {
    details
        .as_deref()
        .map(|d| format!(" - {}", d))
        .unwrap_or_default()
}

/// Stable machine-readable error tags
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Request errors
    ValidationError,
    ScheduleError,
    NotFound,

    // Execution errors
    AlreadyRunning,
    LaunchError,
    Timeout,
    StoppedByUser,

    // Approval errors
    IterationLimit,
    InvalidState,
    ApprovalExpired,

    // Infrastructure
    StorageError,
    Internal,
}

impl ErrorCode {
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationError | ErrorCode::ScheduleError => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::AlreadyRunning | ErrorCode::InvalidState | ErrorCode::StoppedByUser => {
                StatusCode::CONFLICT
            }
            ErrorCode::IterationLimit | ErrorCode::ApprovalExpired => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ErrorCode::LaunchError
            | ErrorCode::Timeout
            | ErrorCode::StorageError
            | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Convenience constructors
impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, msg)
    }

    pub fn schedule(expression: &str, reason: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::ScheduleError,
            message: format!("Invalid cron expression '{}'", expression),
            details: Some(reason.into()),
        }
    }

    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::NotFound,
            message: format!("{} not found", kind),
            details: Some(id.into()),
        }
    }

    /// `details` holds the id of the execution that is already in flight
    pub fn already_running(task_id: &str, execution_id: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::AlreadyRunning,
            message: format!("Task '{}' is already running", task_id),
            details: Some(execution_id.into()),
        }
    }

    pub fn launch(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::LaunchError, msg)
    }

    pub fn iteration_limit(max_iterations: u32) -> Self {
        Self::new(
            ErrorCode::IterationLimit,
            format!("Maximum discuss iterations ({}) reached", max_iterations),
        )
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, msg)
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::StorageError, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, msg)
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

// Conversions from common error types
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::storage(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::storage(format!("JSON serialization error: {}", err))
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::storage(format!("YAML serialization error: {}", err))
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a AppError,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.code.status(), Json(ErrorBody { error: &self })).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_details() {
        let err = AppError::already_running("nightly", "exec-1");
        assert_eq!(
            err.to_string(),
            "AlreadyRunning: Task 'nightly' is already running - exec-1"
        );
    }

    #[test]
    fn test_codes_serialize_screaming_snake() {
        let json = serde_json::to_value(AppError::iteration_limit(3)).unwrap();
        assert_eq!(json["code"], "ITERATION_LIMIT");
        assert!(json.get("details").is_none());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorCode::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::AlreadyRunning.status(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::ScheduleError.status(), StatusCode::BAD_REQUEST);
    }
}
