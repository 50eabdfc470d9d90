//! Entity store and lease coordinator backends.
//!
//! - `in_memory`: process-local store (tests/dev, single-process deployments)
//! - `postgres`: relational store shared by any number of connector instances

pub mod in_memory;
pub mod postgres;
mod postgres_query;

#[cfg(test)]
pub(crate) mod conformance;

pub use in_memory::{InMemoryEntityStore, InMemoryLeaseCoordinator};
pub use postgres::{PostgresEntityStore, PostgresLeaseCoordinator, PostgresTables, RuntimeBridge};

use dataspace_core::{PersistenceError, PersistenceResult, StatefulEntity};
use serde_json::Value;

/// Serialize an entity into its stored document form.
pub(crate) fn encode_document<T: StatefulEntity>(entity: &T) -> PersistenceResult<Value> {
    serde_json::to_value(entity).map_err(|e| PersistenceError::malformed(entity.id(), e))
}

pub(crate) fn decode_document<T: StatefulEntity>(id: &str, document: Value) -> PersistenceResult<T> {
    serde_json::from_value(document).map_err(|e| PersistenceError::malformed(id, e))
}
