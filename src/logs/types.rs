use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::executions::types::{Execution, ExecutionStatus, FailureKind};
use crate::tasks::RunStatus;

/// Immutable history record written when an execution reaches a terminal state
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub task_id: String,
    pub task_name: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub status: RunStatus,
    /// Raw agent output, one line per entry
    #[serde(default)]
    pub output: String,
    /// Human-readable output extracted from the stream
    #[serde(default)]
    pub clean_output: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<FailureKind>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
}

impl ExecutionResult {
    pub fn from_execution(execution: &Execution, clean_output: String) -> Self {
        Self {
            execution_id: execution.execution_id.clone(),
            task_id: execution.task_id.clone(),
            task_name: execution.task_name.clone(),
            session_id: execution.session_id.clone(),
            status: execution.run_status(),
            output: execution.output_text(),
            clean_output,
            error: execution.error.clone(),
            error_kind: execution.error_kind,
            exit_code: execution.exit_code,
            started_at: execution.started_at,
            finished_at: execution.finished_at.unwrap_or_else(Utc::now),
            duration_seconds: execution.duration_seconds(),
        }
    }
}

/// Query for the history listing
#[derive(Clone, Debug, Deserialize, Default)]
pub struct LogFilter {
    pub status: Option<RunStatus>,
    pub task_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl LogFilter {
    pub fn matches(&self, result: &ExecutionResult) -> bool {
        if let Some(status) = self.status {
            if result.status != status {
                return false;
            }
        }
        if let Some(task_id) = &self.task_id {
            if &result.task_id != task_id {
                return false;
            }
        }
        if let Some(start) = self.start_date {
            if result.started_at < start {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if result.started_at > end {
                return false;
            }
        }
        true
    }
}

#[derive(Clone, Debug, Serialize, Default, PartialEq)]
pub struct TaskLogStats {
    pub task_name: String,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub last_run: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Default, PartialEq)]
pub struct LogStats {
    pub total_executions: usize,
    pub successful: usize,
    pub failed: usize,
    pub timeouts: usize,
    pub stopped: usize,
    pub success_rate: f64,
    pub avg_duration_seconds: f64,
    pub last_execution: Option<DateTime<Utc>>,
    pub by_task: BTreeMap<String, TaskLogStats>,
}

/// Marker kept on disk while an execution is in flight
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InflightMarker {
    pub execution_id: String,
    pub task_id: String,
    pub task_name: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub approval_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl InflightMarker {
    pub fn from_execution(execution: &Execution) -> Self {
        Self {
            execution_id: execution.execution_id.clone(),
            task_id: execution.task_id.clone(),
            task_name: execution.task_name.clone(),
            session_id: execution.session_id.clone(),
            started_at: execution.started_at,
            status: execution.status,
            approval_id: execution.approval_id.clone(),
            updated_at: Utc::now(),
        }
    }
}
