//! `dataspace-core`: coordination primitives for leased stateful entities.
//!
//! This crate holds the **backend-agnostic** contracts (entity shape, lease
//! protocol, store trait, query model, backoff and retry policy). Storage
//! backends and the worker loop live in `dataspace-infra`.

pub mod clock;
pub mod entity;
pub mod error;
pub mod id;
pub mod lease;
pub mod query;
pub mod retry;
pub mod store;
pub mod wait;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::{EntityState, StatefulEntity};
pub use error::{PersistenceError, PersistenceResult, StoreError, StoreResult};
pub use id::{OwnerId, generate_entity_id};
pub use lease::{Lease, LeaseCoordinator, LeaseKey, LeaseOutcome};
pub use query::{Criterion, FieldView, Operator, QuerySpec, SortOrder};
pub use retry::{RetryDecision, RetryManager};
pub use store::EntityStore;
pub use wait::{ExponentialWaitStrategy, FixedWaitStrategy, JitteredWaitStrategy, WaitStrategy};
