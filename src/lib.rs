// Module declarations
pub mod api;
pub mod approvals;
pub mod cli_providers;
pub mod config;
pub mod error;
pub mod executions;
pub mod logs;
pub mod notifications;
pub mod scheduler;
pub mod services;
pub mod tasks;
pub mod utils;
