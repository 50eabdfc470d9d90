//! State machine execution: processors claim entities by state and a manager
//! loops over them on a worker thread.

mod manager;
mod processor;

pub use manager::{Iteration, ManagerStats, StateMachineHandle, StateMachineManager};
pub use processor::{EntityGuard, EntityHandler, EntityProcessor, Processor};
