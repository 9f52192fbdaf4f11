//! CLI provider abstraction for agent invocation
//!
//! A provider turns a task plus a [`Strategy`] into a [`CliSpawnConfig`] and then into
//! concrete command-line arguments. A launcher turns a spawn configuration into a live
//! process handle.
//!
//! # Supported Providers
//! - `claude` (default): Claude Code CLI

mod claude;
pub mod launcher;
mod types;

pub use claude::{
    initial_strategy, ClaudeCodeProvider, APPROVAL_SYSTEM_PROMPT, PLAN_MODE_SYSTEM_PROMPT,
    TASK_SYSTEM_PROMPT,
};
pub use launcher::{AgentExit, AgentHandle, AgentLauncher, ProcessLauncher};
pub use types::*;
