use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use super::types::*;
use crate::error::{AppError, AppResult};
use crate::tasks::{RunStatus, TaskStats};
use crate::utils::paths::is_safe_file_stem;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

/// History store: one JSON line per finished execution in `<dir>/<task_id>.jsonl`
pub struct LogStore {
    dir: PathBuf,
    inflight_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl LogStore {
    pub fn new(dir: impl Into<PathBuf>, inflight_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            inflight_dir: inflight_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn task_file(&self, task_id: &str) -> AppResult<PathBuf> {
        if !is_safe_file_stem(task_id) {
            return Err(AppError::validation(format!("Invalid task id '{}'", task_id)));
        }
        Ok(self.dir.join(format!("{}.jsonl", task_id)))
    }

    pub async fn append(&self, result: &ExecutionResult) -> AppResult<()> {
        let path = self.task_file(&result.task_id)?;
        let mut line = serde_json::to_string(result)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// All records for a task, oldest first. Corrupt lines are skipped.
    async fn read_task(&self, task_id: &str) -> AppResult<Vec<ExecutionResult>> {
        let path = self.task_file(task_id)?;
        read_jsonl(&path).await
    }

    async fn read_all(&self) -> AppResult<Vec<ExecutionResult>> {
        let mut results = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(results),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                results.extend(read_jsonl(&path).await?);
            }
        }
        Ok(results)
    }

    /// Newest first, filtered and paginated
    pub async fn query(&self, filter: &LogFilter) -> AppResult<Vec<ExecutionResult>> {
        let mut results = match &filter.task_id {
            Some(task_id) => self.read_task(task_id).await?,
            None => self.read_all().await?,
        };
        results.retain(|r| filter.matches(r));
        results.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let offset = filter.offset.unwrap_or(0);
        let limit = filter.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        Ok(results.into_iter().skip(offset).take(limit).collect())
    }

    pub async fn task_logs(&self, task_id: &str, limit: usize) -> AppResult<Vec<ExecutionResult>> {
        self.query(&LogFilter {
            task_id: Some(task_id.to_string()),
            limit: Some(limit),
            ..LogFilter::default()
        })
        .await
    }

    pub async fn latest(&self, task_id: &str) -> AppResult<Option<ExecutionResult>> {
        Ok(self.task_logs(task_id, 1).await?.into_iter().next())
    }

    /// Returns `false` when there was nothing to clear
    pub async fn clear_task(&self, task_id: &str) -> AppResult<bool> {
        let path = self.task_file(task_id)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn stats(&self) -> AppResult<LogStats> {
        let results = self.read_all().await?;
        let mut stats = LogStats {
            total_executions: results.len(),
            ..LogStats::default()
        };
        let mut total_duration = 0.0;

        for r in &results {
            match r.status {
                RunStatus::Success => stats.successful += 1,
                RunStatus::Timeout => {
                    stats.timeouts += 1;
                    stats.failed += 1;
                }
                RunStatus::Stopped => stats.stopped += 1,
                _ => stats.failed += 1,
            }
            total_duration += r.duration_seconds;
            if stats.last_execution.map_or(true, |last| r.started_at > last) {
                stats.last_execution = Some(r.started_at);
            }

            let per_task = stats.by_task.entry(r.task_id.clone()).or_default();
            per_task.task_name = r.task_name.clone();
            per_task.total += 1;
            if r.status == RunStatus::Success {
                per_task.successful += 1;
            } else {
                per_task.failed += 1;
            }
            if per_task.last_run.map_or(true, |last| r.started_at > last) {
                per_task.last_run = Some(r.started_at);
            }
        }

        if !results.is_empty() {
            stats.success_rate = stats.successful as f64 / results.len() as f64 * 100.0;
            stats.avg_duration_seconds = total_duration / results.len() as f64;
        }
        Ok(stats)
    }

    pub async fn task_stats(&self, task_id: &str) -> AppResult<TaskStats> {
        let results = self.read_task(task_id).await?;
        let mut stats = TaskStats {
            task_id: task_id.to_string(),
            total_runs: results.len(),
            ..TaskStats::default()
        };
        let mut total_duration = 0.0;
        for r in &results {
            match r.status {
                RunStatus::Success => stats.successful_runs += 1,
                RunStatus::Timeout => stats.timeout_runs += 1,
                _ => stats.failed_runs += 1,
            }
            total_duration += r.duration_seconds;
        }
        if let Some(last) = results.iter().max_by_key(|r| r.started_at) {
            stats.last_run = Some(last.started_at);
            stats.last_status = Some(last.status);
        }
        if !results.is_empty() {
            stats.success_rate = stats.successful_runs as f64 / results.len() as f64 * 100.0;
            stats.avg_duration_seconds = total_duration / results.len() as f64;
        }
        Ok(stats)
    }

    // ========================
    // In-flight markers
    // ========================

    fn marker_path(&self, execution_id: &str) -> AppResult<PathBuf> {
        if !is_safe_file_stem(execution_id) {
            return Err(AppError::validation(format!(
                "Invalid execution id '{}'",
                execution_id
            )));
        }
        Ok(self.inflight_dir.join(format!("{}.json", execution_id)))
    }

    pub async fn write_inflight(&self, marker: &InflightMarker) -> AppResult<()> {
        let path = self.marker_path(&marker.execution_id)?;
        tokio::fs::create_dir_all(&self.inflight_dir).await?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(marker)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn remove_inflight(&self, execution_id: &str) -> AppResult<()> {
        let path = self.marker_path(execution_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_inflight(&self) -> AppResult<Vec<InflightMarker>> {
        let mut markers = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.inflight_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(markers),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<InflightMarker>(&bytes) {
                Ok(marker) => markers.push(marker),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable in-flight marker"),
            }
        }
        Ok(markers)
    }
}

async fn read_jsonl(path: &Path) -> AppResult<Vec<ExecutionResult>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping corrupt log line");
                None
            }
        })
        .collect())
}
