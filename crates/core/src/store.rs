//! Entity store contract.
//!
//! A store is bound to one lease owner: every leasing operation it performs
//! (`next_not_leased`, `find_by_id_and_lease`) claims on behalf of that owner,
//! and `save`/`delete` release the owner's lease.

use std::sync::Arc;

use crate::entity::StatefulEntity;
use crate::error::{PersistenceResult, StoreResult};
use crate::query::{Criterion, QuerySpec};

pub trait EntityStore<T>: Send + Sync
where
    T: StatefulEntity,
{
    /// Insert or replace by id, then release any lease this owner holds.
    ///
    /// Fails with `AlreadyLeased` while another owner holds an unexpired lease.
    fn save(&self, entity: &T) -> StoreResult<()>;

    fn find(&self, id: &str) -> PersistenceResult<Option<T>>;

    fn find_all(&self, query: &QuerySpec) -> PersistenceResult<Vec<T>>;

    /// Remove the entity together with its lease. Missing ids are a no-op.
    fn delete(&self, id: &str) -> StoreResult<()>;

    /// Claim up to `max` unleased (or expired) entities matching every criterion.
    ///
    /// Candidates are taken oldest `state_timestamp` first (ties by id); any
    /// candidate whose lease is lost to a concurrent caller is dropped.
    fn next_not_leased(&self, max: usize, criteria: &[Criterion]) -> PersistenceResult<Vec<T>>;

    fn next_for_state(&self, state: i32, max: usize) -> PersistenceResult<Vec<T>> {
        self.next_not_leased(max, &[Criterion::eq("state", state)])
    }

    /// Look up one entity and lease it for this owner.
    fn find_by_id_and_lease(&self, id: &str) -> StoreResult<T>;
}

impl<T, S> EntityStore<T> for Arc<S>
where
    T: StatefulEntity,
    S: EntityStore<T> + ?Sized,
{
    fn save(&self, entity: &T) -> StoreResult<()> {
        (**self).save(entity)
    }

    fn find(&self, id: &str) -> PersistenceResult<Option<T>> {
        (**self).find(id)
    }

    fn find_all(&self, query: &QuerySpec) -> PersistenceResult<Vec<T>> {
        (**self).find_all(query)
    }

    fn delete(&self, id: &str) -> StoreResult<()> {
        (**self).delete(id)
    }

    fn next_not_leased(&self, max: usize, criteria: &[Criterion]) -> PersistenceResult<Vec<T>> {
        (**self).next_not_leased(max, criteria)
    }

    fn next_for_state(&self, state: i32, max: usize) -> PersistenceResult<Vec<T>> {
        (**self).next_for_state(state, max)
    }

    fn find_by_id_and_lease(&self, id: &str) -> StoreResult<T> {
        (**self).find_by_id_and_lease(id)
    }
}
