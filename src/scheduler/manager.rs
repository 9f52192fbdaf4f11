use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cron::CronExpression;
use super::types::*;
use crate::config::ServerConfig;
use crate::error::{AppError, AppResult, ErrorCode};
use crate::executions::ExecutionEngine;
use crate::tasks::{Task, TaskRegistry};

#[derive(Clone, Copy, Debug)]
pub struct SchedulerSettings {
    pub check_interval: u64,
    pub due_window: u64,
    pub max_concurrent: usize,
}

impl From<&ServerConfig> for SchedulerSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            check_interval: config.check_interval,
            due_window: config.due_window,
            max_concurrent: config.max_concurrent,
        }
    }
}

#[derive(Default)]
struct LoopState {
    running: bool,
    last_check: Option<DateTime<Utc>>,
    next_check: Option<DateTime<Utc>>,
}

/// Periodic due-check that dispatches executions
///
/// The loop never fails: every per-task problem is logged and the task is simply
/// reconsidered on the next tick.
pub struct SchedulerManager {
    tasks: Arc<TaskRegistry>,
    engine: Arc<ExecutionEngine>,
    settings: SchedulerSettings,
    state: RwLock<LoopState>,
}

impl SchedulerManager {
    pub fn new(
        tasks: Arc<TaskRegistry>,
        engine: Arc<ExecutionEngine>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            tasks,
            engine,
            settings,
            state: RwLock::new(LoopState::default()),
        }
    }

    // ========================
    // Loop
    // ========================

    /// Tick every `check_interval` seconds until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let period = Duration::from_secs(self.settings.check_interval);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        self.state.write().await.running = true;
        info!(
            check_interval = self.settings.check_interval,
            max_concurrent = self.settings.max_concurrent,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if report.due > 0 {
                        info!(due = report.due, started = report.started, "scheduler tick");
                    }
                }
            }
        }

        let mut state = self.state.write().await;
        state.running = false;
        state.next_check = None;
        info!("scheduler stopped");
    }

    /// One due-check with the configured window
    pub async fn tick(&self) -> RunDueReport {
        let now = Utc::now();
        let report = self.dispatch_due(self.settings.due_window, false, now).await;
        let mut state = self.state.write().await;
        state.last_check = Some(now);
        state.next_check =
            Some(now + chrono::Duration::seconds(self.settings.check_interval as i64));
        report
    }

    /// Start (or dry-run) every due task now
    pub async fn run_due(&self, window_seconds: Option<u64>, dry_run: bool) -> AppResult<RunDueReport> {
        let window = self.window(window_seconds)?;
        Ok(self.dispatch_due(window, dry_run, Utc::now()).await)
    }

    async fn dispatch_due(&self, window: u64, dry_run: bool, now: DateTime<Utc>) -> RunDueReport {
        let due = self.tasks.list_due_at(window, now).await;
        let mut report = RunDueReport {
            checked_at: now,
            due: due.len(),
            started: 0,
            dispatches: Vec::with_capacity(due.len()),
        };
        let active = self.engine.registry().list_active().await.len();
        let mut slots = self.settings.max_concurrent.saturating_sub(active);

        for task in due {
            let dispatch = if dry_run {
                match self.engine.run_task(&task, true).await {
                    Ok(summary) => Dispatch::dry_run(summary),
                    Err(e) => self.failed(&task, e),
                }
            } else if self.engine.registry().is_running(&task.id).await {
                debug!(task_id = %task.id, "skipping, already running");
                Dispatch::skipped(&task.id, &task.name, DispatchOutcome::AlreadyRunning)
            } else if slots == 0 {
                debug!(task_id = %task.id, "skipping, concurrency limit reached");
                Dispatch::skipped(&task.id, &task.name, DispatchOutcome::ConcurrencyLimit)
            } else {
                match self.engine.start(&task).await {
                    Ok(execution) => {
                        slots -= 1;
                        report.started += 1;
                        Dispatch {
                            execution_id: Some(execution.execution_id),
                            ..Dispatch::skipped(&task.id, &task.name, DispatchOutcome::Started)
                        }
                    }
                    // Lost a race with a manual run
                    Err(e) if e.code == ErrorCode::AlreadyRunning => {
                        Dispatch::skipped(&task.id, &task.name, DispatchOutcome::AlreadyRunning)
                    }
                    Err(e) => self.failed(&task, e),
                }
            };
            report.dispatches.push(dispatch);
        }
        report
    }

    fn failed(&self, task: &Task, error: AppError) -> Dispatch {
        warn!(task_id = %task.id, error = %error, "failed to dispatch due task");
        Dispatch {
            error: Some(error.to_string()),
            ..Dispatch::skipped(&task.id, &task.name, DispatchOutcome::Failed)
        }
    }

    fn window(&self, window_seconds: Option<u64>) -> AppResult<u64> {
        match window_seconds {
            None => Ok(self.settings.due_window),
            Some(w) if w == 0 || w > MAX_DUE_WINDOW => Err(AppError::validation(format!(
                "window_seconds must be between 1 and {}",
                MAX_DUE_WINDOW
            ))),
            Some(w) => Ok(w),
        }
    }

    // ========================
    // Queries
    // ========================

    pub async fn status(&self) -> SchedulerStatus {
        let tasks = self.tasks.list().await;
        let due_tasks = self.tasks.list_due(self.settings.due_window).await.len();
        let running_tasks = self.engine.registry().list_active().await.len();
        let state = self.state.read().await;
        SchedulerStatus {
            running: state.running,
            check_interval: self.settings.check_interval,
            due_window: self.settings.due_window,
            max_concurrent: self.settings.max_concurrent,
            total_tasks: tasks.len(),
            enabled_tasks: tasks.iter().filter(|t| t.enabled).count(),
            due_tasks,
            running_tasks,
            last_check: state.last_check,
            next_check: state.next_check,
        }
    }

    /// Fire times of enabled tasks within the next `hours`, soonest first
    pub async fn upcoming(&self, hours: u32) -> AppResult<Vec<UpcomingRun>> {
        self.upcoming_at(hours, Utc::now()).await
    }

    pub async fn upcoming_at(&self, hours: u32, now: DateTime<Utc>) -> AppResult<Vec<UpcomingRun>> {
        if hours == 0 || hours > MAX_UPCOMING_HOURS {
            return Err(AppError::validation(format!(
                "hours must be between 1 and {}",
                MAX_UPCOMING_HOURS
            )));
        }
        let horizon = now + chrono::Duration::hours(hours as i64);

        let mut runs = Vec::new();
        for task in self.tasks.list().await.into_iter().filter(|t| t.enabled) {
            let Ok(cron) = CronExpression::parse(&task.schedule) else {
                continue;
            };
            runs.extend(
                cron.upcoming(now, UPCOMING_PER_TASK)
                    .into_iter()
                    .take_while(|at| *at <= horizon)
                    .map(|run_at| UpcomingRun {
                        task_id: task.id.clone(),
                        task_name: task.name.clone(),
                        schedule: task.schedule.clone(),
                        run_at,
                    }),
            );
        }
        runs.sort_by(|a, b| a.run_at.cmp(&b.run_at).then_with(|| a.task_name.cmp(&b.task_name)));
        Ok(runs)
    }

    /// Tasks due within the window, flagged when already running
    pub async fn due(&self, window_seconds: Option<u64>) -> AppResult<Vec<DueTask>> {
        let window = self.window(window_seconds)?;
        let mut due = Vec::new();
        for task in self.tasks.list_due(window).await {
            due.push(DueTask {
                running: self.engine.registry().is_running(&task.id).await,
                task_id: task.id,
                task_name: task.name,
                schedule: task.schedule,
                last_run: task.last_run,
            });
        }
        Ok(due)
    }
}
