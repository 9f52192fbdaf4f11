use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::executions::RunSummary;

/// Longest look-ahead accepted by the upcoming-runs query
pub const MAX_UPCOMING_HOURS: u32 = 168;
/// Widest due window accepted from configuration or a query
pub const MAX_DUE_WINDOW: u64 = 86_400;
/// Fire times listed per task in the upcoming-runs query
pub const UPCOMING_PER_TASK: usize = 10;

#[derive(Clone, Debug, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub check_interval: u64,
    pub due_window: u64,
    pub max_concurrent: usize,
    pub total_tasks: usize,
    pub enabled_tasks: usize,
    pub due_tasks: usize,
    pub running_tasks: usize,
    pub last_check: Option<DateTime<Utc>>,
    pub next_check: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct UpcomingRun {
    pub task_id: String,
    pub task_name: String,
    pub schedule: String,
    pub run_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DueTask {
    pub task_id: String,
    pub task_name: String,
    pub schedule: String,
    pub last_run: Option<DateTime<Utc>>,
    pub running: bool,
}

/// What happened to one due task during a tick
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Started,
    DryRun,
    AlreadyRunning,
    ConcurrencyLimit,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct Dispatch {
    pub task_id: String,
    pub task_name: String,
    pub outcome: DispatchOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Dispatch {
    pub fn skipped(task_id: &str, task_name: &str, outcome: DispatchOutcome) -> Self {
        Self {
            task_id: task_id.to_string(),
            task_name: task_name.to_string(),
            outcome,
            execution_id: None,
            command: None,
            error: None,
        }
    }

    pub fn dry_run(summary: RunSummary) -> Self {
        Self {
            task_id: summary.task_id,
            task_name: summary.task_name,
            outcome: DispatchOutcome::DryRun,
            execution_id: None,
            command: Some(summary.output),
            error: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunDueReport {
    pub checked_at: DateTime<Utc>,
    pub due: usize,
    pub started: usize,
    pub dispatches: Vec<Dispatch>,
}
