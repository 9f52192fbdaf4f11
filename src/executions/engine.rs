//! Execution engine
//!
//! Every run is driven by one tokio task that owns the agent handle and folds its output
//! through the stream reducer. State changes go through the [`ExecutionRegistry`] first and
//! are then published on the [`EventBus`], so the buffer always leads the event stream.
//!
//! Plan-mode runs stop the agent once it hands back a plan, park the execution in
//! `waiting_approval` and resume the same execution id when the approval manager calls
//! back through [`PlanResumer`].

use std::collections::HashSet;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bus::EventBus;
use super::registry::ExecutionRegistry;
use super::stream::{self, StreamEvent, StreamState};
use super::types::*;
use crate::approvals::{Approval, ApprovalManager, ApprovalStatus, NewApproval, PlanResumer};
use crate::cli_providers::{
    initial_strategy, AgentExit, AgentHandle, AgentLauncher, ClaudeCodeProvider, CliProvider,
    Strategy,
};
use crate::error::{AppError, AppResult};
use crate::logs::{ExecutionResult, InflightMarker, LogStore};
use crate::notifications::{self, Notifier};
use crate::tasks::{NotificationEvent, RunStatus, Task, TaskRegistry};

const STOPPED_BY_USER: &str = "stopped by user";

/// Stop request for one running agent process. The first reason recorded wins.
struct RunControl {
    token: CancellationToken,
    reason: OnceLock<(FailureKind, String)>,
}

impl RunControl {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: OnceLock::new(),
        }
    }

    fn stop(&self, kind: FailureKind, reason: &str) {
        let _ = self.reason.set((kind, reason.to_string()));
        self.token.cancel();
    }

    fn outcome(&self) -> Outcome {
        let (kind, reason) = self
            .reason
            .get()
            .cloned()
            .unwrap_or((FailureKind::StoppedByUser, STOPPED_BY_USER.to_string()));
        Outcome::failure(kind, reason, None)
    }
}

/// One agent process within an execution
struct Run {
    task: Task,
    /// Snapshot used to address events
    execution: Execution,
    strategy: Strategy,
    /// Approval this run continues, if any
    approval_id: Option<String>,
    control: Arc<RunControl>,
}

/// How the read loop ended
enum Ended {
    Exited(AgentExit),
    Stopped,
    TimedOut,
    PlanReady(String),
}

/// Response to a stop request
#[derive(Clone, Debug, Serialize)]
pub struct StopResponse {
    pub status: String,
    pub message: String,
    pub execution_id: String,
}

pub struct ExecutionEngine {
    this: Weak<ExecutionEngine>,
    registry: Arc<ExecutionRegistry>,
    bus: Arc<EventBus>,
    tasks: Arc<TaskRegistry>,
    logs: Arc<LogStore>,
    approvals: Arc<ApprovalManager>,
    notifier: Arc<dyn Notifier>,
    provider: ClaudeCodeProvider,
    launcher: Arc<dyn AgentLauncher>,
    controls: DashMap<String, Arc<RunControl>>,
}

/// Collaborators the engine is built from
pub struct EngineDeps {
    pub registry: Arc<ExecutionRegistry>,
    pub bus: Arc<EventBus>,
    pub tasks: Arc<TaskRegistry>,
    pub logs: Arc<LogStore>,
    pub approvals: Arc<ApprovalManager>,
    pub notifier: Arc<dyn Notifier>,
    pub provider: ClaudeCodeProvider,
    pub launcher: Arc<dyn AgentLauncher>,
}

impl ExecutionEngine {
    /// Build the engine and register it as the approval manager's resumer
    pub fn new(deps: EngineDeps) -> Arc<Self> {
        let engine = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            registry: deps.registry,
            bus: deps.bus,
            tasks: deps.tasks,
            logs: deps.logs,
            approvals: deps.approvals,
            notifier: deps.notifier,
            provider: deps.provider,
            launcher: deps.launcher,
            controls: DashMap::new(),
        });
        let resumer: Arc<dyn PlanResumer> = engine.clone();
        engine.approvals.set_resumer(Arc::downgrade(&resumer));
        engine
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    // =========================================================================
    // Start / run / stop
    // =========================================================================

    /// Register and launch a new execution of `task`.
    ///
    /// Fails with `ALREADY_RUNNING` (existing execution id in `details`) while another
    /// execution of the task is not completed.
    pub async fn start(&self, task: &Task) -> AppResult<Execution> {
        let execution = self.registry.try_begin(&task.id, &task.name).await?;
        let control = self.register_control(&execution.execution_id);
        info!(
            task_id = %task.id,
            execution_id = %execution.execution_id,
            "starting execution"
        );
        self.bus.publish(ExecutionEvent::started(&execution));
        self.write_marker(&execution.execution_id).await;
        notifications::dispatch(
            self.notifier.as_ref(),
            task,
            NotificationEvent::TaskStart,
            None,
        )
        .await;

        self.spawn_run(
            task.clone(),
            execution.clone(),
            initial_strategy(task),
            None,
            control,
        )?;
        Ok(execution)
    }

    /// Run `task` now and wait until it finishes or parks for approval.
    /// A dry run only reports the command line that would be executed.
    pub async fn run_task(&self, task: &Task, dry_run: bool) -> AppResult<RunSummary> {
        if dry_run {
            return Ok(self.dry_run(task));
        }

        let execution = self.start(task).await?;
        let id = execution.execution_id;
        if let Some(mut state) = self.registry.watch(&id).await {
            let _ = state
                .wait_for(|s| s.completed || s.status == ExecutionStatus::WaitingApproval)
                .await;
        }
        self.registry
            .get(&id)
            .await
            .map(|e| RunSummary::from_execution(&e))
            .ok_or_else(|| AppError::not_found("Execution", id))
    }

    fn dry_run(&self, task: &Task) -> RunSummary {
        let strategy = initial_strategy(task);
        let config = self.provider.spawn_config(task, &strategy);
        let now = Utc::now();
        info!(task_id = %task.id, strategy = strategy.name(), "dry run");
        RunSummary {
            execution_id: None,
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            status: RunStatus::Skipped,
            exit_code: None,
            error: None,
            error_kind: None,
            approval_id: None,
            session_id: None,
            output: self.provider.build_command(&config),
            started_at: now,
            finished_at: Some(now),
            duration_seconds: 0.0,
        }
    }

    /// Request termination of an execution. Completion is reported asynchronously
    /// through the `execution.stopped` event.
    pub async fn stop(&self, execution_id: &str) -> AppResult<StopResponse> {
        let execution = self
            .registry
            .get(execution_id)
            .await
            .ok_or_else(|| AppError::not_found("Execution", execution_id))?;
        if execution.completed {
            return Err(AppError::invalid_state(format!(
                "Execution {} already completed",
                execution_id
            )));
        }

        if execution.status == ExecutionStatus::WaitingApproval {
            if let Some(approval_id) = &execution.approval_id {
                self.approvals.cancel(approval_id).await?;
                return Ok(StopResponse {
                    status: "stopped".to_string(),
                    message: "Approval cancelled and execution stopped".to_string(),
                    execution_id: execution_id.to_string(),
                });
            }
        }

        let control = self.controls.get(execution_id).map(|c| c.value().clone());
        match control {
            Some(control) => control.stop(FailureKind::StoppedByUser, STOPPED_BY_USER),
            None => {
                self.finish(
                    &execution.task_id,
                    execution_id,
                    Outcome::failure(FailureKind::StoppedByUser, STOPPED_BY_USER, None),
                    String::new(),
                    None,
                )
                .await;
            }
        }
        info!(task_id = %execution.task_id, execution_id = %execution_id, "stop requested");
        Ok(StopResponse {
            status: "stopping".to_string(),
            message: format!("Stop requested for task '{}'", execution.task_name),
            execution_id: execution_id.to_string(),
        })
    }

    /// Stop whatever execution of the task is in flight
    pub async fn stop_task(&self, task_id: &str) -> AppResult<StopResponse> {
        let execution = self
            .registry
            .get_by_task(task_id)
            .await
            .filter(|e| !e.completed)
            .ok_or_else(|| AppError::not_found("Running execution", task_id))?;
        self.stop(&execution.execution_id).await
    }

    /// Stop every running process; used on shutdown
    pub fn stop_all(&self) {
        for control in self.controls.iter() {
            control.stop(FailureKind::StoppedByUser, "server shutting down");
        }
    }

    // =========================================================================
    // Driver
    // =========================================================================

    /// Make the execution stoppable. Must happen before the first await after the
    /// record becomes visible, so a stop can never miss the run.
    fn register_control(&self, execution_id: &str) -> Arc<RunControl> {
        let control = Arc::new(RunControl::new());
        self.controls.insert(execution_id.to_string(), control.clone());
        control
    }

    fn spawn_run(
        &self,
        task: Task,
        execution: Execution,
        strategy: Strategy,
        approval_id: Option<String>,
        control: Arc<RunControl>,
    ) -> AppResult<()> {
        let Some(engine) = self.this.upgrade() else {
            self.controls.remove(&execution.execution_id);
            return Err(AppError::internal("execution engine is shutting down"));
        };
        let run = Run {
            task,
            execution,
            strategy,
            approval_id,
            control,
        };
        tokio::spawn(async move { engine.drive(run).await });
        Ok(())
    }

    async fn drive(self: Arc<Self>, run: Run) {
        let execution_id = run.execution.execution_id.clone();
        let config = self.provider.spawn_config(&run.task, &run.strategy);
        debug!(
            execution_id = %execution_id,
            strategy = run.strategy.name(),
            "launching agent"
        );

        if run.control.token.is_cancelled() {
            debug!(execution_id = %execution_id, "stopped before launch");
            self.finish(
                &run.task.id,
                &execution_id,
                run.control.outcome(),
                String::new(),
                run.approval_id.as_deref(),
            )
            .await;
            return;
        }
        let live = self.registry.get(&execution_id).await;
        if live.map_or(true, |e| e.completed) {
            self.controls.remove(&execution_id);
            return;
        }

        let handle = match self.launcher.launch(&config) {
            Ok(handle) => handle,
            Err(e) => {
                error!(task_id = %run.task.id, execution_id = %execution_id, error = %e, "launch failed");
                let outcome = Outcome::failure(FailureKind::LaunchError, e.message, None);
                self.finish(&run.task.id, &execution_id, outcome, String::new(), run.approval_id.as_deref())
                    .await;
                return;
            }
        };

        let mut state = StreamState::default();
        let ended = self.read_until_end(&run, handle, &mut state).await;
        let (state, _) = stream::flush(state);

        let outcome = match ended {
            Ended::PlanReady(plan) => {
                self.park_for_approval(&run, &state, plan).await;
                return;
            }
            Ended::Stopped => run.control.outcome(),
            Ended::TimedOut => Outcome::failure(
                FailureKind::Timeout,
                format!("timed out after {} seconds", run.task.timeout),
                None,
            ),
            Ended::Exited(AgentExit::Exited(0)) if run.strategy.is_planning() => {
                // Finished planning without the ExitPlanMode marker: the result is the plan
                let plan = state
                    .plan
                    .clone()
                    .unwrap_or_else(|| state.clean_output());
                if !plan.trim().is_empty() {
                    self.park_for_approval(&run, &state, plan).await;
                    return;
                }
                Outcome::failure(FailureKind::ProcessError, "agent finished without a plan", Some(0))
            }
            Ended::Exited(AgentExit::Exited(0)) => Outcome::success(0),
            Ended::Exited(AgentExit::Exited(code)) => Outcome::failure(
                FailureKind::NonZeroExit,
                format!("process exited with code {}", code),
                Some(code),
            ),
            Ended::Exited(AgentExit::Killed) => {
                Outcome::failure(FailureKind::ProcessError, "process was killed", None)
            }
            Ended::Exited(AgentExit::Failed(e)) => Outcome::failure(FailureKind::ProcessError, e, None),
        };
        self.finish(
            &run.task.id,
            &execution_id,
            outcome,
            state.clean_output(),
            run.approval_id.as_deref(),
        )
        .await;
    }

    async fn read_until_end(&self, run: &Run, handle: AgentHandle, state: &mut StreamState) -> Ended {
        let AgentHandle {
            mut lines,
            exit,
            kill,
            ..
        } = handle;
        let deadline = tokio::time::sleep(Duration::from_secs(run.task.timeout));
        tokio::pin!(deadline);
        let mut exit = exit;

        let ended = loop {
            tokio::select! {
                _ = run.control.token.cancelled() => break Ended::Stopped,
                _ = &mut deadline => break Ended::TimedOut,
                line = lines.recv() => match line {
                    Some(line) => {
                        if let Some(plan) = self.handle_line(run, state, &line).await {
                            break Ended::PlanReady(plan);
                        }
                    }
                    None => {
                        // Output closed; wait for the exit status
                        tokio::select! {
                            _ = run.control.token.cancelled() => break Ended::Stopped,
                            _ = &mut deadline => break Ended::TimedOut,
                            status = &mut exit => break Ended::Exited(
                                status.unwrap_or_else(|_| AgentExit::Failed("exit status lost".to_string()))
                            ),
                        }
                    }
                },
            }
        };

        if !matches!(ended, Ended::Exited(_)) {
            kill.cancel();
            let _ = exit.await;
        }
        ended
    }

    /// Buffer, publish and parse one line. Returns the plan when a planning run hands one back.
    async fn handle_line(&self, run: &Run, state: &mut StreamState, line: &str) -> Option<String> {
        let id = &run.execution.execution_id;
        if self.registry.mark_running(id).await {
            self.bus.publish(ExecutionEvent::progress(&run.execution, "running"));
        }
        if let Err(e) = self.registry.append_line(id, line).await {
            debug!(execution_id = %id, error = %e, "dropping output line");
        }

        let (next, events) = stream::reduce(std::mem::take(state), line);
        *state = next;
        self.bus.publish(ExecutionEvent::output(
            &run.execution,
            line,
            &stream::blocks(&events),
        ));

        let mut plan = None;
        for event in events {
            match event {
                StreamEvent::Session(session_id) => {
                    let _ = self.registry.set_session(id, &session_id).await;
                }
                StreamEvent::Phase(phase) => {
                    if self.registry.set_phase(id, &phase).await.is_ok() {
                        self.bus.publish(ExecutionEvent::progress(&run.execution, &phase));
                    }
                }
                StreamEvent::PlanReady(text) if run.strategy.is_planning() => plan = Some(text),
                _ => {}
            }
        }
        plan
    }

    /// Hand a finished plan to the approval manager and suspend the execution
    async fn park_for_approval(&self, run: &Run, state: &StreamState, plan: String) {
        let id = &run.execution.execution_id;
        self.controls.remove(id);

        let session_id = match (&state.session_id, &run.strategy) {
            (Some(session), _) => session.clone(),
            (None, Strategy::ResumeWithFeedback { session_id, .. }) => session_id.clone(),
            (None, _) => {
                let outcome = Outcome::failure(
                    FailureKind::ProcessError,
                    "plan produced without a session to resume",
                    None,
                );
                self.finish(&run.task.id, id, outcome, plan, run.approval_id.as_deref())
                    .await;
                return;
            }
        };

        let approval = match &run.approval_id {
            Some(approval_id) => self.approvals.record_revision(approval_id, &plan).await,
            None => {
                let channels = run
                    .task
                    .notifications
                    .as_ref()
                    .map(|n| n.channels.clone())
                    .unwrap_or_default();
                self.approvals
                    .create(NewApproval {
                        task_id: run.task.id.clone(),
                        task_name: run.task.name.clone(),
                        session_id,
                        execution_id: id.clone(),
                        plan_text: plan.clone(),
                        working_dir: run.task.working_dir.clone(),
                        max_iterations: run.task.plan_max_iterations,
                        timeout_seconds: run.task.plan_timeout,
                        channels,
                    })
                    .await
            }
        };
        let approval = match approval {
            Ok(approval) => approval,
            Err(e) => {
                error!(execution_id = %id, error = %e, "failed to record plan for approval");
                let outcome = Outcome::failure(FailureKind::ProcessError, e.message, None);
                self.finish(&run.task.id, id, outcome, plan, run.approval_id.as_deref())
                    .await;
                return;
            }
        };

        match self.registry.set_waiting(id, &approval.id).await {
            Ok(execution) => {
                self.write_marker(id).await;
                info!(
                    task_id = %run.task.id,
                    execution_id = %id,
                    approval_id = %approval.id,
                    iteration = approval.iteration,
                    "waiting for approval"
                );
                self.bus
                    .publish(ExecutionEvent::waiting_approval(&execution, &approval.id));
            }
            Err(e) => {
                // Stopped while the plan was being recorded
                warn!(execution_id = %id, error = %e, "execution ended before approval");
                let _ = self.approvals.fail(&approval.id, &e.message).await;
            }
        }
    }

    /// Record the terminal outcome. Only the first caller for an execution gets past
    /// the registry; everyone else returns without side effects.
    async fn finish(
        &self,
        task_id: &str,
        execution_id: &str,
        outcome: Outcome,
        clean_output: String,
        approval_id: Option<&str>,
    ) {
        self.controls.remove(execution_id);
        let Some(execution) = self.registry.complete(execution_id, outcome).await else {
            return;
        };
        self.bus.publish(ExecutionEvent::terminal(&execution));

        let status = execution.run_status();
        match status {
            RunStatus::Success => {
                info!(task_id = %task_id, execution_id = %execution_id, duration = execution.duration_seconds(), "execution succeeded")
            }
            _ => warn!(
                task_id = %task_id,
                execution_id = %execution_id,
                status = status.as_str(),
                error = ?execution.error,
                "execution did not succeed"
            ),
        }

        let result = ExecutionResult::from_execution(&execution, clean_output);
        if let Err(e) = self.logs.append(&result).await {
            error!(execution_id = %execution_id, error = %e, "failed to write execution log");
        }
        let finished_at = execution.finished_at.unwrap_or_else(Utc::now);
        if let Err(e) = self.tasks.record_run(task_id, finished_at, status).await {
            error!(task_id = %task_id, error = %e, "failed to record last run");
        }
        if let Err(e) = self.logs.remove_inflight(execution_id).await {
            warn!(execution_id = %execution_id, error = %e, "failed to remove in-flight marker");
        }

        if let Some(approval_id) = approval_id {
            let settled = if status == RunStatus::Success {
                self.approvals.complete(approval_id, &result.clean_output).await
            } else {
                let error = execution.error.as_deref().unwrap_or("execution failed");
                self.approvals.fail(approval_id, error).await
            };
            if let Err(e) = settled {
                warn!(approval_id = %approval_id, error = %e, "failed to settle approval");
            }
        }

        if let Ok(task) = self.tasks.get(task_id).await {
            for event in notifications::terminal_events(status == RunStatus::Success) {
                notifications::dispatch(self.notifier.as_ref(), &task, event, Some(&result)).await;
            }
        }
    }

    async fn write_marker(&self, execution_id: &str) {
        let Some(execution) = self.registry.get(execution_id).await else {
            return;
        };
        if let Err(e) = self
            .logs
            .write_inflight(&InflightMarker::from_execution(&execution))
            .await
        {
            warn!(execution_id = %execution_id, error = %e, "failed to write in-flight marker");
        }
    }

    // =========================================================================
    // Restart reconciliation
    // =========================================================================

    /// Rebuild state left behind by a previous process. Executions parked on a still
    /// pending approval come back as `waiting_approval`; every other marker becomes a
    /// failed history record. Returns the ids of the restored executions.
    pub async fn reconcile_restart(&self) -> AppResult<HashSet<String>> {
        let mut restored = HashSet::new();
        for marker in self.logs.list_inflight().await? {
            if self.restorable(&marker).await {
                let mut execution = Execution::new(&marker.task_id, &marker.task_name);
                execution.execution_id = marker.execution_id.clone();
                execution.session_id = marker.session_id.clone();
                execution.started_at = marker.started_at;
                execution.status = ExecutionStatus::WaitingApproval;
                execution.current_phase = "waiting for approval".to_string();
                execution.approval_id = marker.approval_id.clone();
                match self.registry.restore(execution).await {
                    Ok(()) => {
                        info!(execution_id = %marker.execution_id, "restored execution waiting for approval");
                        restored.insert(marker.execution_id);
                        continue;
                    }
                    Err(e) => warn!(execution_id = %marker.execution_id, error = %e, "could not restore execution"),
                }
            }

            let mut execution = Execution::new(&marker.task_id, &marker.task_name);
            execution.execution_id = marker.execution_id.clone();
            execution.session_id = marker.session_id.clone();
            execution.started_at = marker.started_at;
            execution.status = ExecutionStatus::Finishing;
            execution.current_phase = "failed".to_string();
            execution.completed = true;
            execution.success = Some(false);
            execution.finished_at = Some(Utc::now());
            execution.error = Some(FailureKind::ProcessRestart.as_str().to_string());
            execution.error_kind = Some(FailureKind::ProcessRestart);

            self.logs
                .append(&ExecutionResult::from_execution(&execution, String::new()))
                .await?;
            if let Err(e) = self
                .tasks
                .record_run(&marker.task_id, Utc::now(), RunStatus::Failure)
                .await
            {
                warn!(task_id = %marker.task_id, error = %e, "failed to record last run");
            }
            self.logs.remove_inflight(&marker.execution_id).await?;
            warn!(
                task_id = %marker.task_id,
                execution_id = %marker.execution_id,
                "execution interrupted by restart"
            );
        }
        Ok(restored)
    }

    async fn restorable(&self, marker: &InflightMarker) -> bool {
        if marker.status != ExecutionStatus::WaitingApproval {
            return false;
        }
        let Some(approval_id) = &marker.approval_id else {
            return false;
        };
        matches!(
            self.approvals.get(approval_id).await,
            Ok(approval) if approval.status == ApprovalStatus::Pending
        )
    }

    /// Move a parked execution back to `running` under a new strategy
    async fn resume(&self, approval: &Approval, strategy: Strategy, phase: &str) -> AppResult<()> {
        let task = self.tasks.get(&approval.task_id).await?;
        let execution = self.registry.resume(&approval.execution_id, phase).await?;
        let control = self.register_control(&execution.execution_id);
        self.write_marker(&execution.execution_id).await;
        self.bus.publish(ExecutionEvent::progress(&execution, phase));
        info!(
            task_id = %task.id,
            execution_id = %execution.execution_id,
            approval_id = %approval.id,
            strategy = strategy.name(),
            "resuming execution"
        );
        self.spawn_run(task, execution, strategy, Some(approval.id.clone()), control)
    }
}

#[async_trait]
impl PlanResumer for ExecutionEngine {
    async fn resume_approved(&self, approval: &Approval) -> AppResult<()> {
        let strategy = Strategy::ResumeWithApproval {
            session_id: approval.session_id.clone(),
        };
        self.resume(approval, strategy, "executing approved plan").await
    }

    async fn resume_with_feedback(&self, approval: &Approval, feedback: &str) -> AppResult<()> {
        let strategy = Strategy::ResumeWithFeedback {
            session_id: approval.session_id.clone(),
            feedback: feedback.to_string(),
        };
        self.resume(approval, strategy, "revising plan").await
    }

    async fn cancel_paused(&self, approval: &Approval, kind: FailureKind) -> AppResult<()> {
        let reason = match kind {
            FailureKind::ApprovalCancelled => "approval cancelled",
            other => other.as_str(),
        };
        let Some(execution) = self.registry.get(&approval.execution_id).await else {
            debug!(execution_id = %approval.execution_id, "no live execution for approval");
            return Ok(());
        };
        if execution.completed {
            return Ok(());
        }

        // A revision run may be in flight; it settles itself once stopped
        let control = self
            .controls
            .get(&execution.execution_id)
            .map(|c| c.value().clone());
        if let Some(control) = control {
            control.stop(kind, reason);
            return Ok(());
        }
        self.finish(
            &execution.task_id,
            &execution.execution_id,
            Outcome::failure(kind, reason, None),
            approval.plan_text.clone(),
            None,
        )
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::approvals::{ApprovalStore, MessageRef};
    use crate::error::ErrorCode;
    use crate::executions::bus::Received;
    use crate::executions::testing::{plan_line, result_line, Script, ScriptedLauncher, INIT_LINE};
    use crate::notifications::testing::RecordingNotifier;
    use crate::tasks::types::sample_create;
    use crate::tasks::NotificationConfig;

    struct Harness {
        _dir: TempDir,
        engine: Arc<ExecutionEngine>,
        approvals: Arc<ApprovalManager>,
        tasks: Arc<TaskRegistry>,
        logs: Arc<LogStore>,
        launcher: Arc<ScriptedLauncher>,
    }

    async fn harness(scripts: Vec<Script>) -> Harness {
        harness_with(scripts, Arc::new(RecordingNotifier::default())).await
    }

    async fn harness_with(scripts: Vec<Script>, notifier: Arc<dyn Notifier>) -> Harness {
        let dir = TempDir::new().unwrap();
        let tasks = Arc::new(TaskRegistry::load(dir.path().join("tasks.yaml")).await.unwrap());
        let logs = Arc::new(LogStore::new(dir.path().join("logs"), dir.path().join("logs/inflight")));
        let approvals = Arc::new(
            ApprovalManager::load(ApprovalStore::new(dir.path().join("approvals")), notifier.clone())
                .await
                .unwrap(),
        );
        let launcher = Arc::new(ScriptedLauncher::new(scripts));
        let engine = ExecutionEngine::new(EngineDeps {
            registry: Arc::new(ExecutionRegistry::new()),
            bus: Arc::new(EventBus::new(256)),
            tasks: tasks.clone(),
            logs: logs.clone(),
            approvals: approvals.clone(),
            notifier,
            provider: ClaudeCodeProvider::new("claude"),
            launcher: launcher.clone(),
        });
        Harness {
            _dir: dir,
            engine,
            approvals,
            tasks,
            logs,
            launcher,
        }
    }

    async fn create_task(h: &Harness, plan_mode: bool) -> Task {
        let mut req = sample_create("nightly", "0 3 * * *");
        req.plan_mode = plan_mode;
        h.tasks.create(req).await.unwrap()
    }

    async fn wait_done(h: &Harness, execution_id: &str) -> Execution {
        let mut rx = h.engine.registry().watch(execution_id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.completed))
            .await
            .unwrap()
            .unwrap();
        h.engine.registry().get(execution_id).await.unwrap()
    }

    async fn wait_status(h: &Harness, execution_id: &str, status: ExecutionStatus) {
        let mut rx = h.engine.registry().watch(execution_id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.status == status))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_non_zero_exit_keeps_output() {
        let h = harness(vec![Script::exit(&["one", "two", "three"], 1)]).await;
        let task = create_task(&h, false).await;
        let mut events = h.engine.bus().subscribe();

        let started = h.engine.start(&task).await.unwrap();
        let done = wait_done(&h, &started.execution_id).await;

        assert_eq!(done.status, ExecutionStatus::Finishing);
        assert_eq!(done.success, Some(false));
        assert_eq!(done.exit_code, Some(1));
        assert_eq!(done.error_kind, Some(FailureKind::NonZeroExit));
        assert_eq!(done.output_lines, ["one", "two", "three"]);

        // Output events follow buffer order
        let mut lines = Vec::new();
        loop {
            match events.recv().await {
                Received::Event(e) if e.event_type == EventType::Output => {
                    lines.push(e.data["line"].as_str().unwrap().to_string())
                }
                Received::Event(e) if e.event_type == EventType::Failed => break,
                Received::Event(_) => {}
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(lines, ["one", "two", "three"]);

        let history = h.logs.task_logs(&task.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, RunStatus::Failure);
        let task = h.tasks.get(&task.id).await.unwrap();
        assert_eq!(task.last_status, Some(RunStatus::Failure));
        assert!(h.logs.list_inflight().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_successful_run_summary() {
        let h = harness(vec![Script::exit(&[INIT_LINE, &result_line("report written")], 0)]).await;
        let task = create_task(&h, false).await;

        let summary = h.engine.run_task(&task, false).await.unwrap();
        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(summary.exit_code, Some(0));
        assert_eq!(summary.session_id.as_deref(), Some("sess-1"));

        let latest = h.logs.latest(&task.id).await.unwrap().unwrap();
        assert_eq!(latest.clean_output, "report written");
    }

    #[tokio::test]
    async fn test_dry_run_registers_nothing() {
        let h = harness(vec![]).await;
        let task = create_task(&h, false).await;

        let summary = h.engine.run_task(&task, true).await.unwrap();
        assert_eq!(summary.status, RunStatus::Skipped);
        assert!(summary.execution_id.is_none());
        assert!(summary.output.starts_with("cd "));
        assert!(summary.output.contains("claude"));
        assert!(h.engine.registry().list().await.is_empty());
        assert!(h.launcher.launched().is_empty());
    }

    #[tokio::test]
    async fn test_already_running_returns_existing_id() {
        let h = harness(vec![Script::hang(&["working"])]).await;
        let task = create_task(&h, false).await;

        let first = h.engine.start(&task).await.unwrap();
        let err = h.engine.start(&task).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyRunning);
        assert_eq!(err.details.as_deref(), Some(first.execution_id.as_str()));

        h.engine.stop(&first.execution_id).await.unwrap();
        wait_done(&h, &first.execution_id).await;
    }

    #[tokio::test]
    async fn test_stop_emits_stopped_event() {
        let h = harness(vec![Script::hang(&["working"])]).await;
        let task = create_task(&h, false).await;
        let mut events = h.engine.bus().subscribe_task(&task.id);

        let started = h.engine.start(&task).await.unwrap();
        wait_status(&h, &started.execution_id, ExecutionStatus::Running).await;
        let response = h.engine.stop(&started.execution_id).await.unwrap();
        assert_eq!(response.execution_id, started.execution_id);

        let done = wait_done(&h, &started.execution_id).await;
        assert_eq!(done.success, Some(false));
        assert_eq!(done.error.as_deref(), Some(STOPPED_BY_USER));
        assert_eq!(done.run_status(), RunStatus::Stopped);

        loop {
            match events.recv().await {
                Received::Event(e) if e.event_type == EventType::Stopped => {
                    assert_eq!(e.data["reason"], STOPPED_BY_USER);
                    break;
                }
                Received::Event(_) => {}
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(
            h.engine.stop(&started.execution_id).await.unwrap_err().code,
            ErrorCode::InvalidState
        );
    }

    /// Holds `task_start` notifications long enough for a stop to land mid-start
    struct SlowStartNotifier;

    #[async_trait]
    impl Notifier for SlowStartNotifier {
        async fn task_event(&self, _: &Task, event: NotificationEvent, _: Option<&ExecutionResult>) {
            if event == NotificationEvent::TaskStart {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
        }

        async fn approval_requested(&self, _: &Approval, _: &[String]) -> Vec<MessageRef> {
            Vec::new()
        }

        async fn approval_updated(&self, _: &Approval) {}
    }

    #[tokio::test]
    async fn test_stop_during_start_never_launches() {
        let h = harness_with(vec![Script::hang(&["late line"])], Arc::new(SlowStartNotifier)).await;
        let mut req = sample_create("nightly", "0 3 * * *");
        req.notifications = Some(NotificationConfig {
            channels: vec!["ops".to_string()],
            events: vec![NotificationEvent::TaskStart],
            include_output: false,
        });
        let task = h.tasks.create(req).await.unwrap();

        let engine = h.engine.clone();
        let starting = {
            let task = task.clone();
            tokio::spawn(async move { engine.start(&task).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let pending = h.engine.registry().get_by_task(&task.id).await.unwrap();
        let response = h.engine.stop(&pending.execution_id).await.unwrap();
        assert_eq!(response.status, "stopping");

        let started = starting.await.unwrap().unwrap();
        let done = wait_done(&h, &started.execution_id).await;
        assert_eq!(done.error.as_deref(), Some(STOPPED_BY_USER));
        assert!(done.output_lines.is_empty());
        assert!(h.launcher.launched().is_empty());
        assert!(!h.engine.registry().is_running(&task.id).await);
    }

    #[tokio::test]
    async fn test_timeout_is_tagged() {
        let h = harness(vec![Script::hang(&[])]).await;
        let mut task = create_task(&h, false).await;
        task.timeout = 1;

        let started = h.engine.start(&task).await.unwrap();
        let done = wait_done(&h, &started.execution_id).await;
        assert_eq!(done.error_kind, Some(FailureKind::Timeout));
        assert_eq!(done.run_status(), RunStatus::Timeout);
    }

    #[tokio::test]
    async fn test_launch_error_is_recorded() {
        let h = harness(vec![Script::launch_error("binary not found")]).await;
        let task = create_task(&h, false).await;

        let started = h.engine.start(&task).await.unwrap();
        let done = wait_done(&h, &started.execution_id).await;
        assert_eq!(done.error_kind, Some(FailureKind::LaunchError));
        assert_eq!(done.error.as_deref(), Some("binary not found"));
    }

    #[tokio::test]
    async fn test_concurrent_start_has_one_winner() {
        let h = harness(vec![Script::hang(&[])]).await;
        let task = create_task(&h, false).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = h.engine.clone();
                let task = task.clone();
                tokio::spawn(async move { engine.start(&task).await })
            })
            .collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| e.code == ErrorCode::AlreadyRunning));

        h.engine.stop_task(&task.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_plan_approve_resumes_same_execution() {
        let h = harness(vec![
            Script::hang(&[INIT_LINE, &plan_line("1. bump version")]),
            Script::exit(&[&result_line("version bumped")], 0),
        ])
        .await;
        let task = create_task(&h, true).await;

        let summary = h.engine.run_task(&task, false).await.unwrap();
        assert_eq!(summary.status, RunStatus::WaitingApproval);
        let execution_id = summary.execution_id.unwrap();
        let approval_id = summary.approval_id.unwrap();

        let approval = h.approvals.get(&approval_id).await.unwrap();
        assert_eq!(approval.iteration, 0);
        assert_eq!(approval.plan_text, "1. bump version");
        assert_eq!(approval.execution_id, execution_id);

        let approved = h.approvals.approve(&approval_id).await.unwrap();
        assert_eq!(approved.status, ApprovalStatus::Executing);

        let done = wait_done(&h, &execution_id).await;
        assert_eq!(done.success, Some(true));

        let launched = h.launcher.launched();
        assert_eq!(launched.len(), 2);
        assert_eq!(launched[1].resume_session.as_deref(), Some("sess-1"));
        assert!(launched[1].skip_permissions);

        // The approval settles once the driver records completion
        for _ in 0..50 {
            if h.approvals.get(&approval_id).await.unwrap().status == ApprovalStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let settled = h.approvals.get(&approval_id).await.unwrap();
        assert_eq!(settled.status, ApprovalStatus::Completed);
        assert_eq!(settled.final_output, "version bumped");
    }

    #[tokio::test]
    async fn test_discuss_revises_plan() {
        let h = harness(vec![
            Script::hang(&[INIT_LINE, &plan_line("v1")]),
            Script::hang(&[&plan_line("v2")]),
        ])
        .await;
        let task = create_task(&h, true).await;

        let summary = h.engine.run_task(&task, false).await.unwrap();
        let execution_id = summary.execution_id.unwrap();
        let approval_id = summary.approval_id.unwrap();

        let discussed = h.approvals.discuss(&approval_id, "smaller please").await.unwrap();
        assert_eq!(discussed.iteration, 1);

        // Back to waiting once the revised plan lands
        for _ in 0..50 {
            let approval = h.approvals.get(&approval_id).await.unwrap();
            if approval.plan_text == "v2" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        wait_status(&h, &execution_id, ExecutionStatus::WaitingApproval).await;
        let approval = h.approvals.get(&approval_id).await.unwrap();
        assert_eq!(approval.plan_text, "v2");
        assert_eq!(approval.feedback_history[0].plan_response.as_deref(), Some("v2"));

        let launched = h.launcher.launched();
        assert_eq!(launched[1].prompt, "smaller please");
        assert_eq!(launched[1].resume_session.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn test_expired_approval_fails_execution() {
        let h = harness(vec![Script::hang(&[INIT_LINE, &plan_line("plan")])]).await;
        let task = create_task(&h, true).await;

        let summary = h.engine.run_task(&task, false).await.unwrap();
        let execution_id = summary.execution_id.unwrap();
        let approval = h.approvals.get(&summary.approval_id.unwrap()).await.unwrap();

        let expired = h
            .approvals
            .sweep_expired(approval.expires_at + chrono::Duration::seconds(1))
            .await;
        assert_eq!(expired, vec![approval.id.clone()]);

        let done = h.engine.registry().get(&execution_id).await.unwrap();
        assert!(done.completed);
        assert_eq!(done.error_kind, Some(FailureKind::ApprovalExpired));
        assert_eq!(done.error.as_deref(), Some("approval_expired"));
        assert_eq!(done.run_status(), RunStatus::Failure);
    }

    #[tokio::test]
    async fn test_stop_while_waiting_cancels_approval() {
        let h = harness(vec![Script::hang(&[INIT_LINE, &plan_line("plan")])]).await;
        let task = create_task(&h, true).await;

        let summary = h.engine.run_task(&task, false).await.unwrap();
        let execution_id = summary.execution_id.unwrap();
        h.engine.stop(&execution_id).await.unwrap();

        let approval = h.approvals.get(&summary.approval_id.unwrap()).await.unwrap();
        assert_eq!(approval.status, ApprovalStatus::Cancelled);
        let done = h.engine.registry().get(&execution_id).await.unwrap();
        assert_eq!(done.run_status(), RunStatus::Stopped);
    }

    #[tokio::test]
    async fn test_restart_reconciliation() {
        let h = harness(vec![Script::hang(&[INIT_LINE, &plan_line("plan")])]).await;
        let task = create_task(&h, true).await;
        let summary = h.engine.run_task(&task, false).await.unwrap();
        let parked_id = summary.execution_id.unwrap();

        // A marker left by a run that was mid-flight when the process died
        let mut orphan = Execution::new(&task.id, &task.name);
        orphan.status = ExecutionStatus::Running;
        h.logs
            .write_inflight(&InflightMarker::from_execution(&orphan))
            .await
            .unwrap();

        // Fresh engine over the same storage
        let engine = ExecutionEngine::new(EngineDeps {
            registry: Arc::new(ExecutionRegistry::new()),
            bus: Arc::new(EventBus::new(16)),
            tasks: h.tasks.clone(),
            logs: h.logs.clone(),
            approvals: h.approvals.clone(),
            notifier: Arc::new(RecordingNotifier::default()),
            provider: ClaudeCodeProvider::new("claude"),
            launcher: Arc::new(ScriptedLauncher::new(vec![])),
        });
        let restored = engine.reconcile_restart().await.unwrap();

        assert!(restored.contains(&parked_id));
        assert!(!restored.contains(&orphan.execution_id));
        let parked = engine.registry().get(&parked_id).await.unwrap();
        assert_eq!(parked.status, ExecutionStatus::WaitingApproval);

        let history = h.logs.task_logs(&task.id, 10).await.unwrap();
        assert!(history
            .iter()
            .any(|r| r.execution_id == orphan.execution_id
                && r.error_kind == Some(FailureKind::ProcessRestart)));
        let markers = h.logs.list_inflight().await.unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].execution_id, parked_id);
    }
}
