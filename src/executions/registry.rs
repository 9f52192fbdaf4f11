use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::{watch, RwLock};

use super::types::*;
use crate::error::{AppError, AppResult};

/// Coarse state published to anyone awaiting an execution
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionState {
    pub status: ExecutionStatus,
    pub completed: bool,
}

impl ExecutionState {
    fn of(execution: &Execution) -> Self {
        Self {
            status: execution.status,
            completed: execution.completed,
        }
    }
}

struct Entry {
    execution: Execution,
    state_tx: watch::Sender<ExecutionState>,
}

impl Entry {
    fn new(execution: Execution) -> Self {
        let (state_tx, _) = watch::channel(ExecutionState::of(&execution));
        Self {
            execution,
            state_tx,
        }
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(ExecutionState::of(&self.execution));
    }
}

#[derive(Default)]
struct Inner {
    executions: HashMap<String, Entry>,
    /// task id -> execution ids in start order
    by_task: HashMap<String, Vec<String>>,
}

impl Inner {
    fn remove(&mut self, execution_id: &str) -> Option<Entry> {
        let entry = self.executions.remove(execution_id)?;
        if let Some(ids) = self.by_task.get_mut(&entry.execution.task_id) {
            ids.retain(|id| id != execution_id);
            if ids.is_empty() {
                self.by_task.remove(&entry.execution.task_id);
            }
        }
        Some(entry)
    }

    fn active_for(&self, task_id: &str) -> Option<&Execution> {
        self.by_task
            .get(task_id)?
            .iter()
            .filter_map(|id| self.executions.get(id))
            .map(|e| &e.execution)
            .find(|e| !e.completed)
    }
}

/// In-memory table of live executions
///
/// The single source of truth for "is task X running". Every check-and-mutate happens
/// under one write lock, which is what keeps at most one non-completed execution per task.
#[derive(Default)]
pub struct ExecutionRegistry {
    inner: RwLock<Inner>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new `starting` execution for the task, or fail with the id of the one
    /// already in flight. Completed records for the task are cleared from the live view.
    pub async fn try_begin(&self, task_id: &str, task_name: &str) -> AppResult<Execution> {
        let mut inner = self.inner.write().await;
        if let Some(active) = inner.active_for(task_id) {
            return Err(AppError::already_running(task_id, active.execution_id.clone()));
        }

        let stale: Vec<String> = inner.by_task.get(task_id).cloned().unwrap_or_default();
        for id in stale {
            inner.remove(&id);
        }

        let execution = Execution::new(task_id, task_name);
        inner
            .by_task
            .entry(task_id.to_string())
            .or_default()
            .push(execution.execution_id.clone());
        inner
            .executions
            .insert(execution.execution_id.clone(), Entry::new(execution.clone()));
        Ok(execution)
    }

    /// Put back a record rebuilt from persisted state
    pub async fn restore(&self, execution: Execution) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(active) = inner.active_for(&execution.task_id) {
            return Err(AppError::already_running(
                &execution.task_id,
                active.execution_id.clone(),
            ));
        }
        inner
            .by_task
            .entry(execution.task_id.clone())
            .or_default()
            .push(execution.execution_id.clone());
        inner
            .executions
            .insert(execution.execution_id.clone(), Entry::new(execution));
        Ok(())
    }

    /// Apply `f` to a non-completed execution and return the updated snapshot
    async fn mutate<F>(&self, execution_id: &str, f: F) -> AppResult<Execution>
    where
        F: FnOnce(&mut Execution) -> AppResult<()>,
    {
        let mut inner = self.inner.write().await;
        let entry = inner
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| AppError::not_found("Execution", execution_id))?;
        if entry.execution.completed {
            return Err(AppError::invalid_state(format!(
                "Execution {} already completed",
                execution_id
            )));
        }
        let before = ExecutionState::of(&entry.execution);
        f(&mut entry.execution)?;
        if ExecutionState::of(&entry.execution) != before {
            entry.publish_state();
        }
        Ok(entry.execution.clone())
    }

    /// `starting -> running`; returns whether the transition happened
    pub async fn mark_running(&self, execution_id: &str) -> bool {
        let mut changed = false;
        let _ = self
            .mutate(execution_id, |e| {
                if e.status == ExecutionStatus::Starting {
                    e.status = ExecutionStatus::Running;
                    e.current_phase = "running".to_string();
                    changed = true;
                }
                Ok(())
            })
            .await;
        changed
    }

    pub async fn set_session(&self, execution_id: &str, session_id: &str) -> AppResult<Execution> {
        self.mutate(execution_id, |e| {
            e.session_id = Some(session_id.to_string());
            Ok(())
        })
        .await
    }

    /// Append to the bounded output buffer
    pub async fn append_line(&self, execution_id: &str, line: &str) -> AppResult<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| AppError::not_found("Execution", execution_id))?;
        if entry.execution.completed {
            return Err(AppError::invalid_state(format!(
                "Execution {} already completed",
                execution_id
            )));
        }
        entry.execution.push_line(line.to_string());
        Ok(())
    }

    pub async fn set_phase(&self, execution_id: &str, phase: &str) -> AppResult<Execution> {
        self.mutate(execution_id, |e| {
            e.current_phase = phase.to_string();
            Ok(())
        })
        .await
    }

    /// `running -> waiting_approval`
    pub async fn set_waiting(&self, execution_id: &str, approval_id: &str) -> AppResult<Execution> {
        self.mutate(execution_id, |e| {
            e.status = ExecutionStatus::WaitingApproval;
            e.approval_id = Some(approval_id.to_string());
            e.current_phase = "waiting for approval".to_string();
            Ok(())
        })
        .await
    }

    /// `waiting_approval -> running`; any other state is rejected
    pub async fn resume(&self, execution_id: &str, phase: &str) -> AppResult<Execution> {
        self.mutate(execution_id, |e| {
            if e.status != ExecutionStatus::WaitingApproval {
                return Err(AppError::invalid_state(format!(
                    "Execution {} is not waiting for approval",
                    e.execution_id
                )));
            }
            e.status = ExecutionStatus::Running;
            e.approval_id = None;
            e.current_phase = phase.to_string();
            Ok(())
        })
        .await
    }

    /// Record the terminal outcome. Only the first call for an execution takes effect;
    /// later calls return `None`.
    pub async fn complete(&self, execution_id: &str, outcome: Outcome) -> Option<Execution> {
        let mut inner = self.inner.write().await;
        let entry = inner.executions.get_mut(execution_id)?;
        if entry.execution.completed {
            return None;
        }
        let e = &mut entry.execution;
        e.status = ExecutionStatus::Finishing;
        e.completed = true;
        e.finished_at = Some(Utc::now());
        e.success = Some(outcome.success);
        e.exit_code = outcome.exit_code;
        e.error = outcome.error;
        e.error_kind = outcome.kind;
        e.current_phase = outcome.phase;
        e.approval_id = None;
        entry.publish_state();
        Some(entry.execution.clone())
    }

    pub async fn get(&self, execution_id: &str) -> Option<Execution> {
        self.inner
            .read()
            .await
            .executions
            .get(execution_id)
            .map(|e| e.execution.clone())
    }

    /// Prefer the non-completed record, else the most recently started
    pub async fn get_by_task(&self, task_id: &str) -> Option<Execution> {
        let inner = self.inner.read().await;
        let records: Vec<&Execution> = inner
            .by_task
            .get(task_id)?
            .iter()
            .filter_map(|id| inner.executions.get(id))
            .map(|e| &e.execution)
            .collect();
        records
            .iter()
            .find(|e| !e.completed)
            .or_else(|| records.iter().max_by_key(|e| e.started_at))
            .map(|e| (*e).clone())
    }

    pub async fn is_running(&self, task_id: &str) -> bool {
        self.inner.read().await.active_for(task_id).is_some()
    }

    /// Every record in the live view, most recent first
    pub async fn list(&self) -> Vec<Execution> {
        let inner = self.inner.read().await;
        let mut list: Vec<Execution> = inner
            .executions
            .values()
            .map(|e| e.execution.clone())
            .collect();
        list.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        list
    }

    pub async fn list_active(&self) -> Vec<Execution> {
        let mut list = self.list().await;
        list.retain(|e| !e.completed);
        list
    }

    /// Drop a completed record from the live view. Returns `false` when it was absent.
    pub async fn dismiss(&self, execution_id: &str) -> AppResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.executions.get(execution_id) {
            None => Ok(false),
            Some(entry) if !entry.execution.completed => Err(AppError::invalid_state(format!(
                "Execution {} is still in progress",
                execution_id
            ))),
            Some(_) => Ok(inner.remove(execution_id).is_some()),
        }
    }

    pub async fn watch(&self, execution_id: &str) -> Option<watch::Receiver<ExecutionState>> {
        self.inner
            .read()
            .await
            .executions
            .get(execution_id)
            .map(|e| e.state_tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_begin_yields_one_winner() {
        let registry = Arc::new(ExecutionRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.try_begin("t1", "digest").await
            }));
        }

        let mut winners = Vec::new();
        let mut losers = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(exec) => winners.push(exec),
                Err(err) => losers.push(err),
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(losers.len(), 15);
        for err in losers {
            assert_eq!(err.code, ErrorCode::AlreadyRunning);
            assert_eq!(err.details.as_deref(), Some(winners[0].execution_id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_completed_record_rejects_output() {
        let registry = ExecutionRegistry::new();
        let exec = registry.try_begin("t1", "digest").await.unwrap();
        registry.append_line(&exec.execution_id, "first").await.unwrap();
        registry
            .complete(&exec.execution_id, Outcome::success(0))
            .await
            .unwrap();

        let err = registry
            .append_line(&exec.execution_id, "late")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidState);
        let stored = registry.get(&exec.execution_id).await.unwrap();
        assert_eq!(stored.output_lines, ["first"]);
    }

    #[tokio::test]
    async fn test_complete_is_exactly_once() {
        let registry = ExecutionRegistry::new();
        let exec = registry.try_begin("t1", "digest").await.unwrap();
        let first = registry
            .complete(&exec.execution_id, Outcome::success(0))
            .await;
        let second = registry
            .complete(
                &exec.execution_id,
                Outcome::failure(FailureKind::StoppedByUser, "stopped by user", None),
            )
            .await;
        assert!(first.is_some());
        assert!(second.is_none());
        let stored = registry.get(&exec.execution_id).await.unwrap();
        assert_eq!(stored.success, Some(true));
        assert_eq!(stored.status, ExecutionStatus::Finishing);
    }

    #[tokio::test]
    async fn test_new_start_clears_completed_records() {
        let registry = ExecutionRegistry::new();
        let first = registry.try_begin("t1", "digest").await.unwrap();
        registry
            .complete(&first.execution_id, Outcome::success(0))
            .await
            .unwrap();
        let second = registry.try_begin("t1", "digest").await.unwrap();

        assert!(registry.get(&first.execution_id).await.is_none());
        assert_eq!(
            registry.get_by_task("t1").await.unwrap().execution_id,
            second.execution_id
        );
    }

    #[tokio::test]
    async fn test_get_by_task_prefers_active() {
        let registry = ExecutionRegistry::new();
        let mut done = Execution::new("t1", "digest");
        done.completed = true;
        done.started_at = Utc::now() + chrono::Duration::seconds(5);
        registry.restore(done).await.unwrap();
        let active = Execution::new("t1", "digest");
        registry.restore(active.clone()).await.unwrap();

        assert_eq!(
            registry.get_by_task("t1").await.unwrap().execution_id,
            active.execution_id
        );
    }

    #[tokio::test]
    async fn test_dismiss_is_idempotent() {
        let registry = ExecutionRegistry::new();
        let exec = registry.try_begin("t1", "digest").await.unwrap();
        assert_eq!(
            registry.dismiss(&exec.execution_id).await.unwrap_err().code,
            ErrorCode::InvalidState
        );

        registry
            .complete(&exec.execution_id, Outcome::success(0))
            .await
            .unwrap();
        assert!(registry.dismiss(&exec.execution_id).await.unwrap());
        assert!(!registry.dismiss(&exec.execution_id).await.unwrap());
        assert!(registry.get_by_task("t1").await.is_none());
    }

    #[tokio::test]
    async fn test_resume_requires_waiting() {
        let registry = ExecutionRegistry::new();
        let exec = registry.try_begin("t1", "digest").await.unwrap();
        let err = registry.resume(&exec.execution_id, "executing").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidState);

        registry.set_waiting(&exec.execution_id, "ap-1").await.unwrap();
        let resumed = registry.resume(&exec.execution_id, "executing").await.unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Running);
        assert!(resumed.approval_id.is_none());
    }

    #[tokio::test]
    async fn test_watch_sees_completion() {
        let registry = ExecutionRegistry::new();
        let exec = registry.try_begin("t1", "digest").await.unwrap();
        let mut rx = registry.watch(&exec.execution_id).await.unwrap();
        registry
            .complete(&exec.execution_id, Outcome::success(0))
            .await
            .unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow().completed);
    }
}
