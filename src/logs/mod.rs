//! Append-only execution history and in-flight markers

pub mod store;
pub mod types;

pub use store::LogStore;
pub use types::*;
