//! Composition root
//!
//! Builds every service from a [`ServerConfig`], reconciles state left behind by a
//! previous process and owns the background loops (scheduler tick and approval sweep).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::approvals::{ApprovalManager, ApprovalStore};
use crate::cli_providers::{AgentLauncher, ClaudeCodeProvider, ProcessLauncher};
use crate::config::ServerConfig;
use crate::error::{AppError, AppResult};
use crate::executions::{EngineDeps, EventBus, ExecutionEngine, ExecutionRegistry, ExecutionStatus};
use crate::logs::LogStore;
use crate::notifications::{Notifier, TracingNotifier};
use crate::scheduler::{SchedulerManager, SchedulerSettings};
use crate::tasks::TaskRegistry;
use crate::utils::paths::DataPaths;

pub struct Services {
    pub config: ServerConfig,
    pub tasks: Arc<TaskRegistry>,
    pub logs: Arc<LogStore>,
    pub approvals: Arc<ApprovalManager>,
    pub engine: Arc<ExecutionEngine>,
    pub scheduler: Arc<SchedulerManager>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Services {
    /// Production wiring: real agent processes, log-only notifications
    pub async fn init(config: ServerConfig) -> AppResult<Arc<Self>> {
        let launcher = Arc::new(ProcessLauncher::new(
            ClaudeCodeProvider::new(config.agent_bin.clone()),
            Duration::from_secs(config.stop_grace),
        ));
        Self::with_collaborators(config, launcher, Arc::new(TracingNotifier)).await
    }

    pub async fn with_collaborators(
        config: ServerConfig,
        launcher: Arc<dyn AgentLauncher>,
        notifier: Arc<dyn Notifier>,
    ) -> AppResult<Arc<Self>> {
        let paths = DataPaths::new(&config.data_root);
        paths.ensure().map_err(AppError::storage)?;

        let tasks = Arc::new(TaskRegistry::load(paths.tasks_file()).await?);
        let logs = Arc::new(LogStore::new(paths.logs_dir(), paths.inflight_dir()));
        let approvals = Arc::new(
            ApprovalManager::load(ApprovalStore::new(paths.approvals_dir()), notifier.clone()).await?,
        );
        let engine = ExecutionEngine::new(EngineDeps {
            registry: Arc::new(ExecutionRegistry::new()),
            bus: Arc::new(EventBus::new(config.event_capacity)),
            tasks: tasks.clone(),
            logs: logs.clone(),
            approvals: approvals.clone(),
            notifier,
            provider: ClaudeCodeProvider::new(config.agent_bin.clone()),
            launcher,
        });
        let scheduler = Arc::new(SchedulerManager::new(
            tasks.clone(),
            engine.clone(),
            SchedulerSettings::from(&config),
        ));

        let services = Arc::new(Self {
            config,
            tasks,
            logs,
            approvals,
            engine,
            scheduler,
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        });
        services.reconcile().await?;
        info!(data_root = %paths.root().display(), "services initialized");
        Ok(services)
    }

    /// Resolve executions and approvals interrupted by the previous shutdown
    async fn reconcile(&self) -> AppResult<()> {
        let restored = self.engine.reconcile_restart().await?;
        let failed = self.approvals.reconcile_restart(&restored).await;
        if !restored.is_empty() || failed > 0 {
            info!(
                restored = restored.len(),
                failed_approvals = failed,
                "reconciled state from previous run"
            );
        }
        Ok(())
    }

    /// Start the scheduler loop and the approval expiry sweep
    pub async fn spawn_background(&self) {
        let mut background = self.background.lock().await;

        let scheduler = self.scheduler.clone();
        let token = self.shutdown.child_token();
        background.push(tokio::spawn(async move { scheduler.run(token).await }));

        let approvals = self.approvals.clone();
        let token = self.shutdown.child_token();
        let period = Duration::from_secs(self.config.sweep_interval);
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = approvals.sweep_expired(Utc::now()).await;
                        if !expired.is_empty() {
                            info!(count = expired.len(), "expired pending approvals");
                        }
                    }
                }
            }
        }));
    }

    /// Stop the loops and running agents. Executions parked for approval keep their
    /// in-flight markers so the next start can restore them.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for handle in self.background.lock().await.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        self.engine.stop_all();
        let deadline = Duration::from_secs(self.config.stop_grace + 2);
        let registry = self.engine.registry().clone();
        let drained = tokio::time::timeout(deadline, async move {
            loop {
                let busy = registry
                    .list_active()
                    .await
                    .iter()
                    .any(|e| e.status != ExecutionStatus::WaitingApproval);
                if !busy {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("executions still running at shutdown");
        }
        info!("services stopped");
    }
}


#[cfg(test)]
mod tests {
    use super::testing::services;
    use super::*;
    use crate::executions::testing::{plan_line, Script, INIT_LINE};
    use crate::tasks::types::sample_create;

    #[tokio::test]
    async fn test_shutdown_keeps_parked_execution() {
        let (_dir, services) =
            services(vec![Script::hang(&[INIT_LINE, &plan_line("plan")])]).await;
        services.spawn_background().await;

        let mut req = sample_create("planner", "0 0 1 1 *");
        req.plan_mode = true;
        let task = services.tasks.create(req).await.unwrap();
        let summary = services.engine.run_task(&task, false).await.unwrap();
        assert_eq!(summary.status, crate::tasks::RunStatus::WaitingApproval);

        services.shutdown().await;
        let markers = services.logs.list_inflight().await.unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].status, ExecutionStatus::WaitingApproval);
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_agents() {
        let (_dir, services) = services(vec![Script::hang(&["busy"])]).await;
        let task = services
            .tasks
            .create(sample_create("busy", "0 0 1 1 *"))
            .await
            .unwrap();
        let execution = services.engine.start(&task).await.unwrap();

        services.shutdown().await;
        let done = services.engine.registry().get(&execution.execution_id).await.unwrap();
        assert!(done.completed);
        assert!(services.logs.list_inflight().await.unwrap().is_empty());
    }
}
