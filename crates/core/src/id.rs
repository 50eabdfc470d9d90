//! Identifiers used by the coordination layer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a lease owner (one connector/runtime instance).
///
/// Opaque to the lease protocol: two owners are the same iff their strings are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh runtime identity.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer explicit ids in tests for readable assertions.
    pub fn generate() -> Self {
        Self(format!("runtime-{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for OwnerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for OwnerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Generate a new entity id (UUIDv7 text).
pub fn generate_entity_id() -> String {
    Uuid::now_v7().to_string()
}
