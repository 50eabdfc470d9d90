//! Infrastructure layer: entity store backends, configuration and the
//! state machine runtime.

pub mod config;
pub mod state_machine;
pub mod store;

pub use config::{ConfigError, RuntimeConfig};
pub use state_machine::{
    EntityProcessor, ManagerStats, Processor, StateMachineHandle, StateMachineManager,
};
pub use store::{
    InMemoryEntityStore, InMemoryLeaseCoordinator, PostgresEntityStore, PostgresLeaseCoordinator,
    PostgresTables, RuntimeBridge,
};
