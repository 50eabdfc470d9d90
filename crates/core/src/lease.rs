//! Leases: time-bounded exclusive claims on a resource.
//!
//! A lease is its own record keyed by `(resource_id, resource_kind)`. It is
//! associated with an entity but never embedded in it, so expiry can be checked
//! and reclaimed without decoding the entity document.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PersistenceResult;

/// Composite lease key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseKey {
    pub resource_id: String,
    pub resource_kind: String,
}

impl LeaseKey {
    pub fn new(resource_id: impl Into<String>, resource_kind: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            resource_kind: resource_kind.into(),
        }
    }
}

/// Persisted lease record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub resource_id: String,
    pub resource_kind: String,
    pub leased_by: String,
    /// Epoch millis of the last (re)acquisition.
    pub leased_at: i64,
    /// Millis.
    pub lease_duration: i64,
}

impl Lease {
    pub fn new(
        key: LeaseKey,
        leased_by: impl Into<String>,
        leased_at: i64,
        lease_duration: i64,
    ) -> Self {
        Self {
            resource_id: key.resource_id,
            resource_kind: key.resource_kind,
            leased_by: leased_by.into(),
            leased_at,
            lease_duration,
        }
    }

    pub fn key(&self) -> LeaseKey {
        LeaseKey::new(self.resource_id.clone(), self.resource_kind.clone())
    }

    pub fn expires_at(&self) -> i64 {
        self.leased_at.saturating_add(self.lease_duration)
    }

    /// A lease is expired once `now > leased_at + lease_duration`.
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at()
    }

    pub fn is_held_by(&self, owner: &str) -> bool {
        self.leased_by == owner
    }

    /// Whether `owner` may take (or renew) this lease at `now`.
    pub fn is_claimable_by(&self, owner: &str, now: i64) -> bool {
        self.is_held_by(owner) || self.is_expired(now)
    }
}

/// Result of a lease acquisition attempt.
///
/// Losing a race is an expected outcome, so it is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired(Lease),
    Conflict { leased_by: String, expires_at: i64 },
}

impl LeaseOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LeaseOutcome::Acquired(_))
    }

    pub fn into_lease(self) -> Option<Lease> {
        match self {
            LeaseOutcome::Acquired(lease) => Some(lease),
            LeaseOutcome::Conflict { .. } => None,
        }
    }
}

/// Decide an acquisition against the currently stored lease (if any).
///
/// Shared by backends that evaluate the claim rule in-process; relational
/// backends evaluate the same rule inside their upsert statement.
pub fn evaluate_claim(
    existing: Option<&Lease>,
    key: LeaseKey,
    owner: &str,
    now: i64,
    duration: Duration,
) -> LeaseOutcome {
    match existing {
        Some(lease) if !lease.is_claimable_by(owner, now) => LeaseOutcome::Conflict {
            leased_by: lease.leased_by.clone(),
            expires_at: lease.expires_at(),
        },
        _ => LeaseOutcome::Acquired(Lease::new(key, owner, now, duration_millis(duration))),
    }
}

/// Convert a lease duration to stored millis, saturating at `i64::MAX`.
pub fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Atomic claim/renew/release protocol over a lease store.
///
/// Implementations must make `acquire` a single atomic check-then-write with
/// respect to every other caller of the same backing store.
pub trait LeaseCoordinator: Send + Sync {
    /// Claim or renew the lease on `(resource_id, resource_kind)` for `owner`.
    fn acquire(
        &self,
        resource_id: &str,
        resource_kind: &str,
        owner: &str,
        duration: Duration,
    ) -> PersistenceResult<LeaseOutcome>;

    /// Delete the lease if `owner` holds it. Returns whether a lease was removed.
    fn release(
        &self,
        resource_id: &str,
        resource_kind: &str,
        owner: &str,
    ) -> PersistenceResult<bool>;

    fn find(&self, resource_id: &str, resource_kind: &str) -> PersistenceResult<Option<Lease>>;
}

impl<L> LeaseCoordinator for Arc<L>
where
    L: LeaseCoordinator + ?Sized,
{
    fn acquire(
        &self,
        resource_id: &str,
        resource_kind: &str,
        owner: &str,
        duration: Duration,
    ) -> PersistenceResult<LeaseOutcome> {
        (**self).acquire(resource_id, resource_kind, owner, duration)
    }

    fn release(
        &self,
        resource_id: &str,
        resource_kind: &str,
        owner: &str,
    ) -> PersistenceResult<bool> {
        (**self).release(resource_id, resource_kind, owner)
    }

    fn find(&self, resource_id: &str, resource_kind: &str) -> PersistenceResult<Option<Lease>> {
        (**self).find(resource_id, resource_kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(owner: &str, leased_at: i64, duration: i64) -> Lease {
        Lease::new(LeaseKey::new("n-1", "contract-negotiation"), owner, leased_at, duration)
    }

    #[test]
    fn lease_expires_strictly_after_duration() {
        let l = lease("a", 100, 50);
        assert!(!l.is_expired(150));
        assert!(l.is_expired(151));
    }

    #[test]
    fn claim_without_lease_succeeds() {
        let key = LeaseKey::new("n-1", "contract-negotiation");
        let outcome = evaluate_claim(None, key, "a", 10, Duration::from_millis(500));
        let acquired = outcome.into_lease().expect("acquired");
        assert_eq!(acquired.leased_by, "a");
        assert_eq!(acquired.leased_at, 10);
        assert_eq!(acquired.lease_duration, 500);
    }

    #[test]
    fn same_owner_renews_unexpired_lease() {
        let existing = lease("a", 0, 1_000);
        let outcome = evaluate_claim(
            Some(&existing),
            existing.key(),
            "a",
            900,
            Duration::from_millis(1_000),
        );
        assert_eq!(outcome.into_lease().map(|l| l.leased_at), Some(900));
    }

    #[test]
    fn foreign_unexpired_lease_conflicts() {
        let existing = lease("a", 0, 1_000);
        let outcome = evaluate_claim(
            Some(&existing),
            existing.key(),
            "b",
            1_000,
            Duration::from_millis(1_000),
        );
        assert_eq!(
            outcome,
            LeaseOutcome::Conflict {
                leased_by: "a".to_string(),
                expires_at: 1_000
            }
        );
    }

    #[test]
    fn foreign_expired_lease_is_taken_over() {
        let existing = lease("a", 0, 1_000);
        let outcome = evaluate_claim(
            Some(&existing),
            existing.key(),
            "b",
            1_001,
            Duration::from_millis(1_000),
        );
        let taken = outcome.into_lease().expect("expired lease is reclaimable");
        assert_eq!(taken.leased_by, "b");
        assert_eq!(taken.leased_at, 1_001);
    }

    #[test]
    fn huge_durations_saturate() {
        assert_eq!(duration_millis(Duration::from_secs(u64::MAX)), i64::MAX);
        assert_eq!(lease("a", 10, i64::MAX).expires_at(), i64::MAX);
    }
}
