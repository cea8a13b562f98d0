pub mod coordinator;
pub mod mode;

pub use coordinator::{CycleResult, CycleState, ExecutionCoordinator, SkipReason};
pub use mode::{ExecutionMode, ModeAction};
