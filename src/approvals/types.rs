use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Executing,
    Completed,
    Cancelled,
    Expired,
    Failed,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Executing => "executing",
            ApprovalStatus::Completed => "completed",
            ApprovalStatus::Cancelled => "cancelled",
            ApprovalStatus::Expired => "expired",
            ApprovalStatus::Failed => "failed",
        }
    }
}

/// Where an approval request was posted, kept so the message can be edited later
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MessageRef {
    pub provider: String,
    pub chat_id: String,
    pub message_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FeedbackEntry {
    pub feedback: String,
    pub timestamp: DateTime<Utc>,
    /// Revised plan produced in answer to this feedback
    #[serde(default)]
    pub plan_response: Option<String>,
}

/// Plan-mode pause record (stored in approvals/{id}.json)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Approval {
    pub id: String,
    pub task_id: String,
    pub task_name: String,
    pub session_id: String,
    /// Execution suspended behind this approval
    pub execution_id: String,
    pub plan_text: String,
    pub working_dir: PathBuf,
    pub status: ApprovalStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub channel_messages: Vec<MessageRef>,
    #[serde(default)]
    pub feedback_history: Vec<FeedbackEntry>,
    #[serde(default)]
    pub final_output: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl Approval {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == ApprovalStatus::Pending && self.expires_at < now
    }

    /// Deadline for a decision made from `now`
    pub fn expiry_after(&self, now: DateTime<Utc>) -> AppResult<DateTime<Utc>> {
        i64::try_from(self.timeout_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|timeout| now.checked_add_signed(timeout))
            .ok_or_else(|| {
                AppError::validation(format!(
                    "approval timeout of {} seconds is out of range",
                    self.timeout_seconds
                ))
            })
    }

    pub fn reset_expiry(&mut self, now: DateTime<Utc>) -> AppResult<()> {
        self.expires_at = self.expiry_after(now)?;
        Ok(())
    }

    pub fn summary(&self, now: DateTime<Utc>) -> ApprovalSummary {
        ApprovalSummary {
            id: self.id.clone(),
            task_id: self.task_id.clone(),
            task_name: self.task_name.clone(),
            execution_id: self.execution_id.clone(),
            status: self.status,
            iteration: self.iteration,
            max_iterations: self.max_iterations,
            created_at: self.created_at,
            expires_at: self.expires_at,
            is_expired: self.is_expired_at(now),
        }
    }
}

/// Everything needed to open an approval
#[derive(Clone, Debug)]
pub struct NewApproval {
    pub task_id: String,
    pub task_name: String,
    pub session_id: String,
    pub execution_id: String,
    pub plan_text: String,
    pub working_dir: PathBuf,
    pub max_iterations: u32,
    pub timeout_seconds: u64,
    /// Notification channels to post the request to
    pub channels: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ApprovalSummary {
    pub id: String,
    pub task_id: String,
    pub task_name: String,
    pub execution_id: String,
    pub status: ApprovalStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_expired: bool,
}

#[derive(Clone, Debug, Serialize, Default, PartialEq)]
pub struct ApprovalStats {
    pub total: usize,
    pub pending: usize,
    pub approved: usize,
    pub executing: usize,
    pub cancelled: usize,
    pub expired: usize,
    pub failed: usize,
    pub completed: usize,
}

/// Body returned by every mutating approval call
#[derive(Clone, Debug, Serialize)]
pub struct ApprovalActionResult {
    pub success: bool,
    pub message: String,
    pub approval: Option<Approval>,
}
