pub mod manager;
pub mod store;
pub mod types;

pub use manager::{ApprovalManager, PlanResumer};
pub use store::ApprovalStore;
pub use types::*;
