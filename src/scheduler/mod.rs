// === Core Modules ===
pub mod cron;
pub mod manager;
pub mod types;

// === Re-exports ===
pub use manager::{SchedulerManager, SchedulerSettings};
pub use types::*;
