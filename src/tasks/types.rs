use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::scheduler::cron::{self, CronExpression};

pub const MIN_TIMEOUT: u64 = 30;
pub const MAX_TIMEOUT: u64 = 3600;
pub const MAX_TURNS_LIMIT: u32 = 100;
pub const MAX_PLAN_ITERATIONS: u32 = 20;
pub const MIN_PLAN_TIMEOUT: u64 = 60;
pub const MAX_PLAN_TIMEOUT: u64 = 7 * 24 * 3600;

/// Model tier passed to the agent CLI as `--model`
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Haiku,
    #[default]
    Sonnet,
    Opus,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Haiku => "haiku",
            ModelTier::Sonnet => "sonnet",
            ModelTier::Opus => "opus",
        }
    }
}

/// Outcome of the most recent run, also used for history records
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
    Timeout,
    Stopped,
    Skipped,
    Running,
    WaitingApproval,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
            RunStatus::Timeout => "timeout",
            RunStatus::Stopped => "stopped",
            RunStatus::Skipped => "skipped",
            RunStatus::Running => "running",
            RunStatus::WaitingApproval => "waiting_approval",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunStatus::Success),
            "failure" => Ok(RunStatus::Failure),
            "timeout" => Ok(RunStatus::Timeout),
            "stopped" => Ok(RunStatus::Stopped),
            "skipped" => Ok(RunStatus::Skipped),
            "running" => Ok(RunStatus::Running),
            "waiting_approval" => Ok(RunStatus::WaitingApproval),
            other => Err(AppError::validation(format!("Unknown status '{}'", other))),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    TaskStart,
    TaskComplete,
    TaskSuccess,
    TaskFailure,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct NotificationConfig {
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_notification_events")]
    pub events: Vec<NotificationEvent>,
    #[serde(default)]
    pub include_output: bool,
}

fn default_notification_events() -> Vec<NotificationEvent> {
    vec![NotificationEvent::TaskFailure]
}

impl NotificationConfig {
    pub fn wants(&self, event: NotificationEvent) -> bool {
        !self.channels.is_empty() && self.events.contains(&event)
    }
}

/// Scheduled task definition (stored in tasks.yaml)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub schedule: String,
    pub working_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    /// Substituted for `$ARGUMENTS` in the skill prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill_arguments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub model: ModelTier,
    #[serde(default)]
    pub autonomous: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,

    // Plan mode
    #[serde(default)]
    pub plan_mode: bool,
    #[serde(default = "default_plan_timeout")]
    pub plan_timeout: u64,
    #[serde(default = "default_plan_max_iterations")]
    pub plan_max_iterations: u32,

    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<NotificationConfig>,

    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status: Option<RunStatus>,
}

fn default_timeout() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_plan_timeout() -> u64 {
    3600
}
fn default_plan_max_iterations() -> u32 {
    5
}

impl Task {
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
    }

    pub fn from_create(req: TaskCreate) -> AppResult<Self> {
        let task = Task {
            id: Self::new_id(),
            name: req.name.trim().to_string(),
            schedule: req.schedule.trim().to_string(),
            working_dir: req.working_dir,
            skill: non_empty(req.skill),
            skill_arguments: non_empty(req.skill_arguments),
            prompt: non_empty(req.prompt),
            allowed_tools: req.allowed_tools,
            model: req.model,
            autonomous: req.autonomous,
            max_turns: req.max_turns,
            timeout: req.timeout.unwrap_or_else(default_timeout),
            enabled: req.enabled.unwrap_or(true),
            plan_mode: req.plan_mode,
            plan_timeout: req.plan_timeout.unwrap_or_else(default_plan_timeout),
            plan_max_iterations: req
                .plan_max_iterations
                .unwrap_or_else(default_plan_max_iterations),
            variables: req.variables,
            notifications: req.notifications,
            last_run: None,
            last_status: None,
        };
        task.validate()?;
        Ok(task)
    }

    /// Apply the fields present in `update`; absent fields are untouched.
    /// An empty string clears `skill`, `skill_arguments` or `prompt`.
    pub fn apply(&mut self, update: TaskUpdate) {
        if let Some(name) = update.name {
            self.name = name.trim().to_string();
        }
        if let Some(schedule) = update.schedule {
            self.schedule = schedule.trim().to_string();
        }
        if let Some(dir) = update.working_dir {
            self.working_dir = dir;
        }
        if let Some(skill) = update.skill {
            self.skill = non_empty(Some(skill));
        }
        if let Some(args) = update.skill_arguments {
            self.skill_arguments = non_empty(Some(args));
        }
        if let Some(prompt) = update.prompt {
            self.prompt = non_empty(Some(prompt));
        }
        if let Some(tools) = update.allowed_tools {
            self.allowed_tools = tools;
        }
        if let Some(model) = update.model {
            self.model = model;
        }
        if let Some(autonomous) = update.autonomous {
            self.autonomous = autonomous;
        }
        if let Some(max_turns) = update.max_turns {
            self.max_turns = Some(max_turns);
        }
        if let Some(timeout) = update.timeout {
            self.timeout = timeout;
        }
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(plan_mode) = update.plan_mode {
            self.plan_mode = plan_mode;
        }
        if let Some(plan_timeout) = update.plan_timeout {
            self.plan_timeout = plan_timeout;
        }
        if let Some(max) = update.plan_max_iterations {
            self.plan_max_iterations = max;
        }
        if let Some(variables) = update.variables {
            self.variables = variables;
        }
        if let Some(notifications) = update.notifications {
            self.notifications = Some(notifications);
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        let name_len = self.name.chars().count();
        if name_len == 0 || name_len > 100 {
            return Err(AppError::validation("name must be 1-100 characters"));
        }
        CronExpression::parse(&self.schedule)?;
        if self.working_dir.as_os_str().is_empty() || !self.working_dir.is_absolute() {
            return Err(AppError::validation("working_dir must be an absolute path"));
        }
        match (&self.skill, &self.prompt) {
            (Some(_), Some(_)) => {
                return Err(AppError::validation(
                    "skill and prompt are mutually exclusive",
                ))
            }
            (None, None) => return Err(AppError::validation("either skill or prompt is required")),
            _ => {}
        }
        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.timeout) {
            return Err(AppError::validation(format!(
                "timeout must be between {} and {} seconds",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }
        if let Some(turns) = self.max_turns {
            if turns == 0 || turns > MAX_TURNS_LIMIT {
                return Err(AppError::validation("max_turns must be between 1 and 100"));
            }
        }
        if !(MIN_PLAN_TIMEOUT..=MAX_PLAN_TIMEOUT).contains(&self.plan_timeout) {
            return Err(AppError::validation(format!(
                "plan_timeout must be between {} and {} seconds",
                MIN_PLAN_TIMEOUT, MAX_PLAN_TIMEOUT
            )));
        }
        if self.plan_mode {
            if self.plan_max_iterations == 0 || self.plan_max_iterations > MAX_PLAN_ITERATIONS {
                return Err(AppError::validation(format!(
                    "plan_max_iterations must be between 1 and {}",
                    MAX_PLAN_ITERATIONS
                )));
            }
        }
        Ok(())
    }

    pub fn next_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        cron::next_fire_time(&self.schedule, now)
    }

    pub fn to_view(&self, now: DateTime<Utc>) -> TaskView {
        TaskView {
            next_run: self.next_run(now),
            schedule_description: cron::describe(&self.schedule),
            task: self.clone(),
        }
    }

    pub fn to_summary(&self, now: DateTime<Utc>) -> TaskSummary {
        TaskSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            schedule: self.schedule.clone(),
            skill: self.skill.clone(),
            enabled: self.enabled,
            plan_mode: self.plan_mode,
            last_run: self.last_run,
            last_status: self.last_status,
            next_run: self.next_run(now),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

/// Task plus fields computed on read
#[derive(Clone, Debug, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub next_run: Option<DateTime<Utc>>,
    pub schedule_description: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskSummary {
    pub id: String,
    pub name: String,
    pub schedule: String,
    pub skill: Option<String>,
    pub enabled: bool,
    pub plan_mode: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TaskCreate {
    pub name: String,
    pub schedule: String,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub skill: Option<String>,
    #[serde(default)]
    pub skill_arguments: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub model: ModelTier,
    #[serde(default)]
    pub autonomous: bool,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub plan_mode: bool,
    #[serde(default)]
    pub plan_timeout: Option<u64>,
    #[serde(default)]
    pub plan_max_iterations: Option<u32>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub notifications: Option<NotificationConfig>,
}

/// Partial update; only present fields are written
#[derive(Clone, Debug, Deserialize, Default)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub schedule: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub skill: Option<String>,
    pub skill_arguments: Option<String>,
    pub prompt: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub model: Option<ModelTier>,
    pub autonomous: Option<bool>,
    pub max_turns: Option<u32>,
    pub timeout: Option<u64>,
    pub enabled: Option<bool>,
    pub plan_mode: Option<bool>,
    pub plan_timeout: Option<u64>,
    pub plan_max_iterations: Option<u32>,
    pub variables: Option<BTreeMap<String, String>>,
    pub notifications: Option<NotificationConfig>,
}

/// Aggregated run statistics for one task
#[derive(Clone, Debug, Serialize, Default, PartialEq)]
pub struct TaskStats {
    pub task_id: String,
    pub total_runs: usize,
    pub successful_runs: usize,
    pub failed_runs: usize,
    pub timeout_runs: usize,
    pub success_rate: f64,
    pub avg_duration_seconds: f64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
}

#[cfg(test)]
pub(crate) fn sample_create(name: &str, schedule: &str) -> TaskCreate {
    TaskCreate {
        name: name.to_string(),
        schedule: schedule.to_string(),
        working_dir: std::env::temp_dir(),
        skill: None,
        skill_arguments: None,
        prompt: Some("summarize recent commits".to_string()),
        allowed_tools: vec![],
        model: ModelTier::Sonnet,
        autonomous: false,
        max_turns: None,
        timeout: None,
        enabled: None,
        plan_mode: false,
        plan_timeout: None,
        plan_max_iterations: None,
        variables: BTreeMap::new(),
        notifications: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_create_applies_defaults() {
        let task = Task::from_create(sample_create("digest", "0 9 * * 1-5")).unwrap();
        assert_eq!(task.id.len(), 8);
        assert_eq!(task.timeout, 300);
        assert!(task.enabled);
        assert_eq!(task.plan_timeout, 3600);
        assert_eq!(task.plan_max_iterations, 5);
        assert_eq!(task.model, ModelTier::Sonnet);
    }

    #[test]
    fn test_skill_and_prompt_are_exclusive() {
        let mut req = sample_create("both", "* * * * *");
        req.skill = Some("review".to_string());
        let err = Task::from_create(req).unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);

        let mut req = sample_create("neither", "* * * * *");
        req.prompt = Some("   ".to_string());
        assert!(Task::from_create(req).is_err());
    }

    #[test]
    fn test_bad_schedule_is_schedule_error() {
        let err = Task::from_create(sample_create("bad", "every day")).unwrap_err();
        assert_eq!(err.code, ErrorCode::ScheduleError);
    }

    #[test]
    fn test_timeout_bounds() {
        let mut req = sample_create("short", "* * * * *");
        req.timeout = Some(10);
        assert!(Task::from_create(req).is_err());

        let mut req = sample_create("turns", "* * * * *");
        req.max_turns = Some(101);
        assert!(Task::from_create(req).is_err());
    }

    #[test]
    fn test_plan_timeout_bounds() {
        let mut req = sample_create("planner", "* * * * *");
        req.plan_mode = true;
        req.plan_timeout = Some(100_000_000_000_000_000);
        let err = Task::from_create(req).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ValidationError);
        assert!(err.message.contains("plan_timeout"));

        let mut req = sample_create("planner", "* * * * *");
        req.plan_mode = true;
        req.plan_timeout = Some(MAX_PLAN_TIMEOUT);
        assert!(Task::from_create(req).is_ok());
    }

    #[test]
    fn test_apply_leaves_absent_fields() {
        let mut task = Task::from_create(sample_create("digest", "0 9 * * *")).unwrap();
        task.apply(TaskUpdate {
            timeout: Some(600),
            ..TaskUpdate::default()
        });
        assert_eq!(task.timeout, 600);
        assert_eq!(task.schedule, "0 9 * * *");
        assert_eq!(task.prompt.as_deref(), Some("summarize recent commits"));
    }

    #[test]
    fn test_apply_switches_prompt_to_skill() {
        let mut task = Task::from_create(sample_create("digest", "0 9 * * *")).unwrap();
        task.apply(TaskUpdate {
            skill: Some("code-review".to_string()),
            prompt: Some(String::new()),
            ..TaskUpdate::default()
        });
        assert!(task.validate().is_ok());
        assert_eq!(task.skill.as_deref(), Some("code-review"));
        assert!(task.prompt.is_none());
    }

    #[test]
    fn test_yaml_roundtrip_keeps_defaults() {
        let yaml = "id: abc12345\nname: nightly\nschedule: '0 2 * * *'\nworking_dir: /tmp\nprompt: hi\n";
        let task: Task = serde_yaml::from_str(yaml).unwrap();
        assert!(task.enabled);
        assert_eq!(task.timeout, 300);
        assert!(!task.plan_mode);
    }

    #[test]
    fn test_notification_filter() {
        let config = NotificationConfig {
            channels: vec!["ops".to_string()],
            events: vec![NotificationEvent::TaskFailure],
            include_output: false,
        };
        assert!(config.wants(NotificationEvent::TaskFailure));
        assert!(!config.wants(NotificationEvent::TaskStart));
    }
}
