pub mod registry;
pub mod skills;
pub mod types;

pub use registry::TaskRegistry;
pub use types::*;
