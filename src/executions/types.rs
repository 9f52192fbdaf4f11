use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::stream::StreamBlock;
use crate::tasks::RunStatus;

/// Lines kept per execution; older lines are evicted first
pub const OUTPUT_BUFFER_CAP: usize = 1000;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Starting,
    Running,
    WaitingApproval,
    /// Terminal once `completed` is set
    Finishing,
}

/// Why an execution did not succeed
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    LaunchError,
    Timeout,
    NonZeroExit,
    ProcessError,
    StoppedByUser,
    ApprovalCancelled,
    ApprovalExpired,
    ProcessRestart,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::LaunchError => "launch_error",
            FailureKind::Timeout => "timeout",
            FailureKind::NonZeroExit => "non_zero_exit",
            FailureKind::ProcessError => "process_error",
            FailureKind::StoppedByUser => "stopped_by_user",
            FailureKind::ApprovalCancelled => "approval_cancelled",
            FailureKind::ApprovalExpired => "approval_expired",
            FailureKind::ProcessRestart => "process_restart",
        }
    }

    /// Ended by a person rather than by the agent or the system
    pub fn is_stop(&self) -> bool {
        matches!(self, FailureKind::StoppedByUser | FailureKind::ApprovalCancelled)
    }
}

/// Live record of one task invocation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub execution_id: String,
    pub task_id: String,
    pub task_name: String,
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub current_phase: String,
    pub output_lines: VecDeque<String>,
    pub completed: bool,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
    /// Set only while paused for approval
    pub approval_id: Option<String>,
}

impl Execution {
    pub fn new(task_id: &str, task_name: &str) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            task_name: task_name.to_string(),
            session_id: None,
            started_at: Utc::now(),
            status: ExecutionStatus::Starting,
            current_phase: "initializing".to_string(),
            output_lines: VecDeque::new(),
            completed: false,
            finished_at: None,
            exit_code: None,
            success: None,
            error: None,
            error_kind: None,
            approval_id: None,
        }
    }

    pub fn push_line(&mut self, line: String) {
        if self.output_lines.len() >= OUTPUT_BUFFER_CAP {
            self.output_lines.pop_front();
        }
        self.output_lines.push_back(line);
    }

    pub fn output_text(&self) -> String {
        self.output_lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn run_status(&self) -> RunStatus {
        if !self.completed {
            return match self.status {
                ExecutionStatus::WaitingApproval => RunStatus::WaitingApproval,
                _ => RunStatus::Running,
            };
        }
        match (self.success, self.error_kind) {
            (Some(true), _) => RunStatus::Success,
            (_, Some(FailureKind::Timeout)) => RunStatus::Timeout,
            (_, Some(kind)) if kind.is_stop() => RunStatus::Stopped,
            _ => RunStatus::Failure,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }
}

/// Terminal result handed to the registry exactly once
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub kind: Option<FailureKind>,
    pub phase: String,
}

impl Outcome {
    pub fn success(exit_code: i32) -> Self {
        Self {
            success: true,
            exit_code: Some(exit_code),
            error: None,
            kind: None,
            phase: "completed".to_string(),
        }
    }

    pub fn failure(kind: FailureKind, error: impl Into<String>, exit_code: Option<i32>) -> Self {
        let phase = if kind.is_stop() { "stopped" } else { "failed" };
        Self {
            success: false,
            exit_code,
            error: Some(error.into()),
            kind: Some(kind),
            phase: phase.to_string(),
        }
    }
}

/// Result returned by a manual run
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub execution_id: Option<String>,
    pub task_id: String,
    pub task_name: String,
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub approval_id: Option<String>,
    pub session_id: Option<String>,
    pub output: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
}

impl RunSummary {
    pub fn from_execution(execution: &Execution) -> Self {
        Self {
            execution_id: Some(execution.execution_id.clone()),
            task_id: execution.task_id.clone(),
            task_name: execution.task_name.clone(),
            status: execution.run_status(),
            exit_code: execution.exit_code,
            error: execution.error.clone(),
            error_kind: execution.error_kind,
            approval_id: execution.approval_id.clone(),
            session_id: execution.session_id.clone(),
            output: execution.output_text(),
            started_at: execution.started_at,
            finished_at: execution.finished_at,
            duration_seconds: execution.duration_seconds(),
        }
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    #[serde(rename = "execution.started")]
    Started,
    #[serde(rename = "execution.output")]
    Output,
    #[serde(rename = "execution.progress")]
    Progress,
    #[serde(rename = "execution.completed")]
    Completed,
    #[serde(rename = "execution.failed")]
    Failed,
    #[serde(rename = "execution.waiting_approval")]
    WaitingApproval,
    #[serde(rename = "execution.stopped")]
    Stopped,
}

/// Message pushed to live observers; never persisted
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub execution_id: String,
    pub task_id: String,
    pub task_name: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl ExecutionEvent {
    fn new(event_type: EventType, execution: &Execution, data: Value) -> Self {
        Self {
            event_type,
            execution_id: execution.execution_id.clone(),
            task_id: execution.task_id.clone(),
            task_name: execution.task_name.clone(),
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn started(execution: &Execution) -> Self {
        Self::new(
            EventType::Started,
            execution,
            json!({ "session_id": execution.session_id }),
        )
    }

    pub fn output(execution: &Execution, line: &str, parsed: &[StreamBlock]) -> Self {
        Self::new(
            EventType::Output,
            execution,
            json!({ "line": line, "parsed": parsed }),
        )
    }

    pub fn progress(execution: &Execution, phase: &str) -> Self {
        Self::new(EventType::Progress, execution, json!({ "phase": phase }))
    }

    pub fn completed(execution: &Execution) -> Self {
        Self::new(
            EventType::Completed,
            execution,
            json!({ "exit_code": execution.exit_code }),
        )
    }

    pub fn failed(execution: &Execution) -> Self {
        Self::new(
            EventType::Failed,
            execution,
            json!({
                "error": execution.error,
                "error_kind": execution.error_kind,
                "exit_code": execution.exit_code,
            }),
        )
    }

    pub fn waiting_approval(execution: &Execution, approval_id: &str) -> Self {
        Self::new(
            EventType::WaitingApproval,
            execution,
            json!({ "approval_id": approval_id }),
        )
    }

    pub fn stopped(execution: &Execution, reason: &str) -> Self {
        Self::new(EventType::Stopped, execution, json!({ "reason": reason }))
    }

    /// The terminal event matching a completed execution
    pub fn terminal(execution: &Execution) -> Self {
        match (execution.success, execution.error_kind) {
            (Some(true), _) => Self::completed(execution),
            (_, Some(kind)) if kind.is_stop() => {
                Self::stopped(execution, execution.error.as_deref().unwrap_or(kind.as_str()))
            }
            _ => Self::failed(execution),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_evicts_oldest() {
        let mut exec = Execution::new("t1", "digest");
        for i in 0..=OUTPUT_BUFFER_CAP {
            exec.push_line(format!("line {}", i));
        }
        assert_eq!(exec.output_lines.len(), OUTPUT_BUFFER_CAP);
        assert_eq!(exec.output_lines.front().unwrap(), "line 1");
        assert_eq!(
            exec.output_lines.back().unwrap(),
            &format!("line {}", OUTPUT_BUFFER_CAP)
        );
    }

    #[test]
    fn test_event_wire_shape() {
        let exec = Execution::new("t1", "digest");
        let json = serde_json::to_value(ExecutionEvent::stopped(&exec, "stopped by user")).unwrap();
        assert_eq!(json["type"], "execution.stopped");
        assert_eq!(json["task_id"], "t1");
        assert_eq!(json["task_name"], "digest");
        assert_eq!(json["data"]["reason"], "stopped by user");
        assert!(json["execution_id"].is_string());
    }

    #[test]
    fn test_run_status_mapping() {
        let mut exec = Execution::new("t1", "digest");
        assert_eq!(exec.run_status(), RunStatus::Running);
        exec.completed = true;
        exec.success = Some(false);
        exec.error_kind = Some(FailureKind::Timeout);
        assert_eq!(exec.run_status(), RunStatus::Timeout);
        exec.error_kind = Some(FailureKind::ApprovalCancelled);
        assert_eq!(exec.run_status(), RunStatus::Stopped);
        exec.error_kind = Some(FailureKind::ApprovalExpired);
        assert_eq!(exec.run_status(), RunStatus::Failure);
    }
}
