pub mod bus;
pub mod engine;
pub mod registry;
pub mod stream;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use bus::{EventBus, Received, Subscription};
pub use engine::{EngineDeps, ExecutionEngine, StopResponse};
pub use registry::{ExecutionRegistry, ExecutionState};
pub use types::*;
