use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::types::*;
use crate::error::{AppError, AppResult};
use crate::scheduler::cron::CronExpression;

#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<Task>,
}

/// Durable task store backed by a single YAML file
///
/// Every mutation happens under the write lock and rewrites the whole file before the
/// lock is released, so concurrent updates are serialized.
pub struct TaskRegistry {
    path: PathBuf,
    tasks: RwLock<Vec<Task>>,
}

impl TaskRegistry {
    /// Load tasks from `path`; a missing file is an empty registry
    pub async fn load(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let tasks = match tokio::fs::read_to_string(&path).await {
            Ok(contents) if contents.trim().is_empty() => Vec::new(),
            Ok(contents) => serde_yaml::from_str::<TaskFile>(&contents)?.tasks,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!(count = tasks.len(), path = %path.display(), "loaded tasks");
        Ok(Self {
            path,
            tasks: RwLock::new(tasks),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn list(&self) -> Vec<Task> {
        self.tasks.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> AppResult<Task> {
        self.tasks
            .read()
            .await
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| AppError::not_found("Task", id))
    }

    pub async fn find_by_name(&self, name: &str) -> Option<Task> {
        self.tasks.read().await.iter().find(|t| t.name == name).cloned()
    }

    pub async fn create(&self, req: TaskCreate) -> AppResult<Task> {
        let task = Task::from_create(req)?;
        let mut tasks = self.tasks.write().await;
        if tasks.iter().any(|t| t.name == task.name) {
            return Err(AppError::validation(format!(
                "Task with name '{}' already exists",
                task.name
            )));
        }
        tasks.push(task.clone());
        self.persist(&tasks).await?;
        info!(task_id = %task.id, name = %task.name, "created task");
        Ok(task)
    }

    pub async fn update(&self, id: &str, update: TaskUpdate) -> AppResult<Task> {
        let mut tasks = self.tasks.write().await;
        let index = tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| AppError::not_found("Task", id))?;

        let mut updated = tasks[index].clone();
        updated.apply(update);
        updated.validate()?;
        if tasks
            .iter()
            .any(|t| t.id != updated.id && t.name == updated.name)
        {
            return Err(AppError::validation(format!(
                "Task with name '{}' already exists",
                updated.name
            )));
        }

        tasks[index] = updated.clone();
        self.persist(&tasks).await?;
        debug!(task_id = %id, "updated task");
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> AppResult<Task> {
        let mut tasks = self.tasks.write().await;
        let index = tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| AppError::not_found("Task", id))?;
        let removed = tasks.remove(index);
        self.persist(&tasks).await?;
        info!(task_id = %id, "deleted task");
        Ok(removed)
    }

    pub async fn enable(&self, id: &str) -> AppResult<Task> {
        self.set_enabled(id, true).await
    }

    pub async fn disable(&self, id: &str) -> AppResult<Task> {
        self.set_enabled(id, false).await
    }

    /// No write happens when the flag already has the requested value
    async fn set_enabled(&self, id: &str, enabled: bool) -> AppResult<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| AppError::not_found("Task", id))?;
        if task.enabled == enabled {
            return Ok(task.clone());
        }
        task.enabled = enabled;
        let snapshot = task.clone();
        self.persist(&tasks).await?;
        Ok(snapshot)
    }

    /// Record the outcome of a finished run. Unknown ids are ignored since the task
    /// may have been deleted while it was running.
    pub async fn record_run(&self, id: &str, at: DateTime<Utc>, status: RunStatus) -> AppResult<()> {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
            debug!(task_id = %id, "run finished for a task that no longer exists");
            return Ok(());
        };
        task.last_run = Some(at);
        task.last_status = Some(status);
        self.persist(&tasks).await
    }

    pub async fn list_due(&self, window_seconds: u64) -> Vec<Task> {
        self.list_due_at(window_seconds, Utc::now()).await
    }

    /// Enabled tasks whose schedule has a fire time since `last_run` within the window
    pub async fn list_due_at(&self, window_seconds: u64, now: DateTime<Utc>) -> Vec<Task> {
        self.tasks
            .read()
            .await
            .iter()
            .filter(|t| t.enabled)
            .filter(|t| match CronExpression::parse(&t.schedule) {
                Ok(cron) => cron.is_due(t.last_run, now, window_seconds),
                Err(_) => false,
            })
            .cloned()
            .collect()
    }

    async fn persist(&self, tasks: &[Task]) -> AppResult<()> {
        let contents = serde_yaml::to_string(&TaskFile {
            tasks: tasks.to_vec(),
        })?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use chrono::{Duration, TimeZone};

    async fn registry() -> (tempfile::TempDir, TaskRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = TaskRegistry::load(dir.path().join("tasks.yaml")).await.unwrap();
        (dir, registry)
    }

    #[tokio::test]
    async fn test_crud_persists_across_reload() {
        let (dir, registry) = registry().await;
        let task = registry
            .create(sample_create("digest", "0 9 * * *"))
            .await
            .unwrap();

        registry
            .update(
                &task.id,
                TaskUpdate {
                    timeout: Some(900),
                    ..TaskUpdate::default()
                },
            )
            .await
            .unwrap();

        let reloaded = TaskRegistry::load(dir.path().join("tasks.yaml")).await.unwrap();
        let loaded = reloaded.get(&task.id).await.unwrap();
        assert_eq!(loaded.timeout, 900);
        assert_eq!(loaded.name, "digest");

        reloaded.delete(&task.id).await.unwrap();
        assert_eq!(
            reloaded.get(&task.id).await.unwrap_err().code,
            ErrorCode::NotFound
        );
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let (_dir, registry) = registry().await;
        for err in [
            registry.get("missing").await.unwrap_err(),
            registry.update("missing", TaskUpdate::default()).await.unwrap_err(),
            registry.delete("missing").await.unwrap_err(),
            registry.enable("missing").await.unwrap_err(),
        ] {
            assert_eq!(err.code, ErrorCode::NotFound);
        }
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let (_dir, registry) = registry().await;
        registry.create(sample_create("digest", "* * * * *")).await.unwrap();
        let err = registry
            .create(sample_create("digest", "* * * * *"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_invalid_update_leaves_task_untouched() {
        let (_dir, registry) = registry().await;
        let task = registry.create(sample_create("digest", "0 9 * * *")).await.unwrap();
        let err = registry
            .update(
                &task.id,
                TaskUpdate {
                    schedule: Some("nope".to_string()),
                    ..TaskUpdate::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ScheduleError);
        assert_eq!(registry.get(&task.id).await.unwrap().schedule, "0 9 * * *");
    }

    #[tokio::test]
    async fn test_disable_is_idempotent() {
        let (_dir, registry) = registry().await;
        let task = registry.create(sample_create("digest", "* * * * *")).await.unwrap();
        let first = registry.disable(&task.id).await.unwrap();
        let second = registry.disable(&task.id).await.unwrap();
        assert!(!first.enabled);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_list_due_scenario() {
        let (_dir, registry) = registry().await;
        let task = registry
            .create(sample_create("quarterly", "*/15 * * * *"))
            .await
            .unwrap();

        let now = Utc.with_ymd_and_hms(2026, 1, 5, 12, 15, 20).unwrap();
        registry
            .record_run(&task.id, now - Duration::minutes(14), RunStatus::Success)
            .await
            .unwrap();
        let due = registry.list_due_at(60, now).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, task.id);

        let now = Utc.with_ymd_and_hms(2026, 1, 5, 12, 10, 20).unwrap();
        registry
            .record_run(&task.id, now - Duration::minutes(10), RunStatus::Success)
            .await
            .unwrap();
        assert!(registry.list_due_at(60, now).await.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_tasks_never_due() {
        let (_dir, registry) = registry().await;
        let task = registry.create(sample_create("digest", "* * * * *")).await.unwrap();
        assert_eq!(registry.list_due(60).await.len(), 1);
        registry.disable(&task.id).await.unwrap();
        assert!(registry.list_due(60).await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_serialized() {
        let (_dir, registry) = registry().await;
        let registry = std::sync::Arc::new(registry);
        let task = registry.create(sample_create("digest", "* * * * *")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10u64 {
            let registry = registry.clone();
            let id = task.id.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .update(
                        &id,
                        TaskUpdate {
                            timeout: Some(100 + i),
                            ..TaskUpdate::default()
                        },
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let timeout = registry.get(&task.id).await.unwrap().timeout;
        assert!((100..110).contains(&timeout));
        let reloaded = TaskRegistry::load(registry.path().to_path_buf()).await.unwrap();
        assert_eq!(reloaded.get(&task.id).await.unwrap().timeout, timeout);
    }
}
