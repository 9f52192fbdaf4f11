//! HTTP API route definitions

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use super::handlers::{self, approvals, cron, executions, logs, scheduler, tasks};
use super::ws;
use crate::services::Services;

/// Create the main API router with all routes
pub fn create_router(services: Arc<Services>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        // Tasks
        .route("/api/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route(
            "/api/tasks/{id}",
            get(tasks::get_task)
                .put(tasks::update_task)
                .delete(tasks::delete_task),
        )
        .route("/api/tasks/{id}/enable", post(tasks::enable_task))
        .route("/api/tasks/{id}/disable", post(tasks::disable_task))
        .route("/api/tasks/{id}/run", post(tasks::run_task))
        .route("/api/tasks/{id}/stop", post(tasks::stop_task))
        .route("/api/tasks/{id}/stats", get(tasks::task_stats))
        // History (static routes before dynamic ones)
        .route("/api/logs", get(logs::list_logs))
        .route("/api/logs/stats", get(logs::log_stats))
        .route(
            "/api/logs/task/{id}",
            get(logs::task_logs).delete(logs::clear_task_logs),
        )
        .route("/api/logs/task/{id}/latest", get(logs::latest_task_log))
        // Scheduler
        .route("/api/scheduler/status", get(scheduler::status))
        .route("/api/scheduler/upcoming", get(scheduler::upcoming))
        .route("/api/scheduler/due", get(scheduler::due))
        .route("/api/scheduler/run-due", post(scheduler::run_due))
        // Plan approvals
        .route("/api/approvals", get(approvals::list_approvals))
        .route("/api/approvals/stats", get(approvals::approval_stats))
        .route("/api/approvals/{id}", get(approvals::get_approval))
        .route("/api/approvals/{id}/approve", post(approvals::approve))
        .route("/api/approvals/{id}/discuss", post(approvals::discuss))
        .route("/api/approvals/{id}/cancel", post(approvals::cancel))
        // Cron
        .route("/api/cron/validate", post(cron::validate))
        // Live executions
        .route("/api/executions", get(executions::list_executions))
        .route("/api/executions/ws", get(ws::execution_stream))
        .route("/api/executions/ws/{task_id}", get(ws::task_execution_stream))
        .route("/api/executions/task/{task_id}", get(executions::task_execution))
        .route(
            "/api/executions/{id}",
            get(executions::get_execution).delete(executions::dismiss_execution),
        )
        .route("/api/executions/{id}/stop", post(executions::stop_execution))
        .with_state(services)
}
