//! Error model for the coordination layer.

use thiserror::Error;

/// Boxed cause carried by [`PersistenceError::Storage`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for operations that can only fail at the storage level.
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Result type for entity store operations that also report lease/lookup outcomes.
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage-level failure.
///
/// Every backend maps its own I/O errors into this type so callers can tell
/// "nothing to do" (an empty batch) apart from "the store is broken".
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The backing store failed (connection loss, statement failure, ...).
    #[error("storage failure in {operation}: {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    /// A stored document could not be decoded into an entity.
    #[error("malformed entity data for {id}: {reason}")]
    Malformed { id: String, reason: String },

    /// A query spec was rejected before reaching the store.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// An in-process lock was poisoned by a panicking writer.
    #[error("store lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl PersistenceError {
    pub fn storage(operation: &'static str, source: impl Into<BoxError>) -> Self {
        Self::Storage {
            operation,
            source: source.into(),
        }
    }

    pub fn malformed(id: impl Into<String>, reason: impl ToString) -> Self {
        Self::Malformed {
            id: id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_query(msg: impl Into<String>) -> Self {
        Self::InvalidQuery(msg.into())
    }
}

/// Entity store error.
///
/// `NotFound` and `AlreadyLeased` are expected outcomes of lease-aware point
/// operations; everything else is a [`PersistenceError`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity not found: {0}")]
    NotFound(String),

    #[error("entity {id} is leased by {leased_by}")]
    AlreadyLeased { id: String, leased_by: String },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl StoreError {
    pub fn already_leased(id: impl Into<String>, leased_by: impl Into<String>) -> Self {
        Self::AlreadyLeased {
            id: id.into(),
            leased_by: leased_by.into(),
        }
    }

    pub fn is_already_leased(&self) -> bool {
        matches!(self, StoreError::AlreadyLeased { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
