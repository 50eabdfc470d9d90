//! Stateful entity shape shared by every long-running workflow object.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::id::generate_entity_id;

/// Coordination fields carried by every stateful entity.
///
/// The state code is opaque here: the core only compares and filters by it.
/// `state_count` counts consecutive entries into the same state, so a fresh
/// entity has `state_count == 1` (zero prior failures).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    pub id: String,
    pub state: i32,
    pub state_count: u32,
    /// Epoch millis of the last state transition.
    pub state_timestamp: i64,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub trace_context: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl EntityState {
    pub fn new(id: impl Into<String>, state: i32, now: i64) -> Self {
        Self {
            id: id.into(),
            state,
            state_count: 1,
            state_timestamp: now,
            created_at: now,
            updated_at: now,
            trace_context: BTreeMap::new(),
            error_detail: None,
        }
    }

    /// Same as [`EntityState::new`] with a generated UUIDv7 id.
    pub fn generate(state: i32, now: i64) -> Self {
        Self::new(generate_entity_id(), state, now)
    }

    /// Move to `state`.
    ///
    /// Re-entering the current state increments `state_count`; any other
    /// target resets it to 1.
    pub fn transition_to(&mut self, state: i32, now: i64) {
        self.state_count = if self.state == state {
            self.state_count.saturating_add(1)
        } else {
            1
        };
        self.state = state;
        self.state_timestamp = self.state_timestamp.max(now);
        self.updated_at = now;
    }

    /// Number of failed attempts recorded in the current state.
    pub fn failures(&self) -> u32 {
        self.state_count.saturating_sub(1)
    }

    pub fn with_trace_context(mut self, trace_context: BTreeMap<String, String>) -> Self {
        self.trace_context = trace_context;
        self
    }

    pub fn set_error_detail(&mut self, detail: impl Into<String>) {
        self.error_detail = Some(detail.into());
    }

    pub fn clear_error_detail(&mut self) {
        self.error_detail = None;
    }
}

/// A persisted workflow object driven by leased state-machine workers.
///
/// Implementors embed an [`EntityState`] and name the resource kind that
/// disambiguates their leases from other entity types sharing a lease table.
pub trait StatefulEntity:
    Clone + core::fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Discriminator stored as `resource_kind` on every lease for this type.
    const RESOURCE_KIND: &'static str;

    fn entity_state(&self) -> &EntityState;

    fn entity_state_mut(&mut self) -> &mut EntityState;

    fn id(&self) -> &str {
        &self.entity_state().id
    }

    fn state(&self) -> i32 {
        self.entity_state().state
    }

    fn state_count(&self) -> u32 {
        self.entity_state().state_count
    }

    fn state_timestamp(&self) -> i64 {
        self.entity_state().state_timestamp
    }

    fn transition_to(&mut self, state: i32, now: i64) {
        self.entity_state_mut().transition_to(state, now);
    }
}
