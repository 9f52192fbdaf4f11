use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use super::store::ApprovalStore;
use super::types::*;
use crate::error::{AppError, AppResult};
use crate::executions::FailureKind;
use crate::notifications::Notifier;

/// Restarts a plan-mode execution parked behind an approval
#[async_trait]
pub trait PlanResumer: Send + Sync {
    /// Continue the paused session and apply the plan
    async fn resume_approved(&self, approval: &Approval) -> AppResult<()>;

    /// Continue the paused session with reviewer feedback; the execution stays in plan mode
    async fn resume_with_feedback(&self, approval: &Approval, feedback: &str) -> AppResult<()>;

    /// Terminate the paused execution
    async fn cancel_paused(&self, approval: &Approval, kind: FailureKind) -> AppResult<()>;
}

/// Approval state machine
///
/// Every transition runs under one lock, so approve/discuss/cancel and the expiry sweep
/// never interleave. Actions are only accepted from `pending`.
pub struct ApprovalManager {
    store: ApprovalStore,
    approvals: RwLock<HashMap<String, Approval>>,
    transition: Mutex<()>,
    notifier: Arc<dyn Notifier>,
    resumer: OnceLock<Weak<dyn PlanResumer>>,
}

impl ApprovalManager {
    pub async fn load(store: ApprovalStore, notifier: Arc<dyn Notifier>) -> AppResult<Self> {
        let approvals = store
            .load_all()
            .await?
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect::<HashMap<_, _>>();
        info!(count = approvals.len(), "loaded approvals");
        Ok(Self {
            store,
            approvals: RwLock::new(approvals),
            transition: Mutex::new(()),
            notifier,
            resumer: OnceLock::new(),
        })
    }

    /// Wire the engine in after both sides exist
    pub fn set_resumer(&self, resumer: Weak<dyn PlanResumer>) {
        if self.resumer.set(resumer).is_err() {
            warn!("approval resumer already set");
        }
    }

    fn resumer(&self) -> AppResult<Arc<dyn PlanResumer>> {
        self.resumer
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| AppError::internal("execution engine is not available"))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get(&self, id: &str) -> AppResult<Approval> {
        self.approvals
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::not_found("Approval", id))
    }

    /// Newest first, optionally filtered by status
    pub async fn list(&self, status: Option<ApprovalStatus>) -> Vec<ApprovalSummary> {
        let now = Utc::now();
        let mut summaries: Vec<ApprovalSummary> = self
            .approvals
            .read()
            .await
            .values()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .map(|a| a.summary(now))
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    pub async fn stats(&self) -> ApprovalStats {
        let approvals = self.approvals.read().await;
        let mut stats = ApprovalStats {
            total: approvals.len(),
            ..Default::default()
        };
        for approval in approvals.values() {
            match approval.status {
                ApprovalStatus::Pending => stats.pending += 1,
                ApprovalStatus::Approved => stats.approved += 1,
                ApprovalStatus::Executing => stats.executing += 1,
                ApprovalStatus::Completed => stats.completed += 1,
                ApprovalStatus::Cancelled => stats.cancelled += 1,
                ApprovalStatus::Expired => stats.expired += 1,
                ApprovalStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    async fn save(&self, approval: &Approval) -> AppResult<()> {
        self.store.save(approval).await?;
        self.approvals
            .write()
            .await
            .insert(approval.id.clone(), approval.clone());
        Ok(())
    }

    async fn require_pending(&self, id: &str) -> AppResult<Approval> {
        let approval = self.get(id).await?;
        if approval.status != ApprovalStatus::Pending {
            return Err(AppError::invalid_state(format!(
                "Approval is {}, not pending",
                approval.status.as_str()
            ))
            .with_details(approval.id));
        }
        Ok(approval)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Open a pending approval for a plan and announce it
    pub async fn create(&self, request: NewApproval) -> AppResult<Approval> {
        let _guard = self.transition.lock().await;
        let now = Utc::now();
        let mut approval = Approval {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: request.task_id,
            task_name: request.task_name,
            session_id: request.session_id,
            execution_id: request.execution_id,
            plan_text: request.plan_text,
            working_dir: request.working_dir,
            status: ApprovalStatus::Pending,
            iteration: 0,
            max_iterations: request.max_iterations,
            timeout_seconds: request.timeout_seconds,
            created_at: now,
            expires_at: now,
            channel_messages: Vec::new(),
            feedback_history: Vec::new(),
            final_output: String::new(),
            error: None,
        };
        approval.reset_expiry(now)?;
        approval.channel_messages = self
            .notifier
            .approval_requested(&approval, &request.channels)
            .await;
        self.save(&approval).await?;
        info!(
            approval_id = %approval.id,
            task_id = %approval.task_id,
            execution_id = %approval.execution_id,
            "approval created"
        );
        Ok(approval)
    }

    pub async fn approve(&self, id: &str) -> AppResult<Approval> {
        let _guard = self.transition.lock().await;
        let mut approval = self.require_pending(id).await?;
        self.resumer()?.resume_approved(&approval).await?;

        // Approved is transient: the engine already holds the resumed run
        approval.status = ApprovalStatus::Executing;
        self.save(&approval).await?;
        info!(approval_id = %id, task_id = %approval.task_id, "approval approved");
        self.notifier.approval_updated(&approval).await;
        Ok(approval)
    }

    pub async fn discuss(&self, id: &str, feedback: &str) -> AppResult<Approval> {
        let feedback = feedback.trim();
        if feedback.is_empty() {
            return Err(AppError::validation("feedback must not be empty"));
        }
        let _guard = self.transition.lock().await;
        let mut approval = self.require_pending(id).await?;
        if approval.iteration + 1 > approval.max_iterations {
            return Err(AppError::iteration_limit(approval.max_iterations).with_details(approval.id));
        }
        let now = Utc::now();
        let expires_at = approval.expiry_after(now)?;
        self.resumer()?
            .resume_with_feedback(&approval, feedback)
            .await?;

        approval.iteration += 1;
        approval.feedback_history.push(FeedbackEntry {
            feedback: feedback.to_string(),
            timestamp: now,
            plan_response: None,
        });
        approval.expires_at = expires_at;
        self.save(&approval).await?;
        info!(
            approval_id = %id,
            iteration = approval.iteration,
            max_iterations = approval.max_iterations,
            "approval discussed"
        );
        self.notifier.approval_updated(&approval).await;
        Ok(approval)
    }

    pub async fn cancel(&self, id: &str) -> AppResult<Approval> {
        let _guard = self.transition.lock().await;
        let mut approval = self.require_pending(id).await?;
        approval.status = ApprovalStatus::Cancelled;
        self.save(&approval).await?;
        info!(approval_id = %id, task_id = %approval.task_id, "approval cancelled");

        match self.resumer() {
            Ok(resumer) => {
                if let Err(e) = resumer
                    .cancel_paused(&approval, FailureKind::ApprovalCancelled)
                    .await
                {
                    warn!(approval_id = %id, error = %e, "failed to stop paused execution");
                }
            }
            Err(e) => warn!(approval_id = %id, error = %e, "failed to stop paused execution"),
        }
        self.notifier.approval_updated(&approval).await;
        Ok(approval)
    }

    /// Expire every pending approval whose deadline passed; returns the expired ids
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let _guard = self.transition.lock().await;
        let due: Vec<Approval> = self
            .approvals
            .read()
            .await
            .values()
            .filter(|a| a.is_expired_at(now))
            .cloned()
            .collect();

        let mut expired = Vec::with_capacity(due.len());
        for mut approval in due {
            approval.status = ApprovalStatus::Expired;
            approval.error = Some(FailureKind::ApprovalExpired.as_str().to_string());
            if let Err(e) = self.save(&approval).await {
                warn!(approval_id = %approval.id, error = %e, "failed to persist expired approval");
                continue;
            }
            info!(approval_id = %approval.id, task_id = %approval.task_id, "approval expired");
            match self.resumer() {
                Ok(resumer) => {
                    if let Err(e) = resumer
                        .cancel_paused(&approval, FailureKind::ApprovalExpired)
                        .await
                    {
                        warn!(approval_id = %approval.id, error = %e, "failed to fail expired execution");
                    }
                }
                Err(e) => warn!(approval_id = %approval.id, error = %e, "failed to fail expired execution"),
            }
            self.notifier.approval_updated(&approval).await;
            expired.push(approval.id);
        }
        expired
    }

    /// Attach the agent's revised plan to the latest feedback round
    pub async fn record_revision(&self, id: &str, plan: &str) -> AppResult<Approval> {
        let _guard = self.transition.lock().await;
        let mut approval = self.get(id).await?;
        approval.plan_text = plan.to_string();
        if let Some(entry) = approval.feedback_history.last_mut() {
            entry.plan_response = Some(plan.to_string());
        }
        self.save(&approval).await?;
        self.notifier.approval_updated(&approval).await;
        Ok(approval)
    }

    /// Finish an executing approval; ignored once the approval is terminal
    pub async fn complete(&self, id: &str, final_output: &str) -> AppResult<Option<Approval>> {
        let _guard = self.transition.lock().await;
        let mut approval = self.get(id).await?;
        if approval.status != ApprovalStatus::Executing {
            return Ok(None);
        }
        approval.status = ApprovalStatus::Completed;
        approval.final_output = final_output.to_string();
        self.save(&approval).await?;
        self.notifier.approval_updated(&approval).await;
        Ok(Some(approval))
    }

    /// Fail a pending or executing approval; ignored once the approval is terminal
    pub async fn fail(&self, id: &str, error: &str) -> AppResult<Option<Approval>> {
        let _guard = self.transition.lock().await;
        let mut approval = self.get(id).await?;
        if !matches!(
            approval.status,
            ApprovalStatus::Pending | ApprovalStatus::Approved | ApprovalStatus::Executing
        ) {
            return Ok(None);
        }
        approval.status = ApprovalStatus::Failed;
        approval.error = Some(error.to_string());
        self.save(&approval).await?;
        warn!(approval_id = %id, error = %error, "approval failed");
        self.notifier.approval_updated(&approval).await;
        Ok(Some(approval))
    }

    /// Boot-time cleanup: approvals whose execution did not survive the restart are failed
    pub async fn reconcile_restart(&self, live_executions: &HashSet<String>) -> usize {
        let stale: Vec<String> = self
            .approvals
            .read()
            .await
            .values()
            .filter(|a| match a.status {
                ApprovalStatus::Approved | ApprovalStatus::Executing => true,
                ApprovalStatus::Pending => !live_executions.contains(&a.execution_id),
                _ => false,
            })
            .map(|a| a.id.clone())
            .collect();

        let mut failed = 0;
        for id in stale {
            match self.fail(&id, FailureKind::ProcessRestart.as_str()).await {
                Ok(Some(_)) => failed += 1,
                Ok(None) => {}
                Err(e) => warn!(approval_id = %id, error = %e, "failed to reconcile approval"),
            }
        }
        failed
    }
}
