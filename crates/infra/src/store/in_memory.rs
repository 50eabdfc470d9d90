//! In-memory entity store and lease coordinator.
//!
//! All handles created from one store (via `Clone` or [`InMemoryEntityStore::for_owner`])
//! share the same entities and leases, which models several connector
//! instances working against one database.
//!
//! Locking: the entity map is always locked before the lease map. Lease
//! acquisition only ever takes the lease lock, so the order cannot invert.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use dataspace_core::lease::evaluate_claim;
use dataspace_core::query::{FieldView, compare_by_field};
use dataspace_core::{
    Clock, Criterion, EntityStore, Lease, LeaseCoordinator, LeaseKey, LeaseOutcome, OwnerId,
    PersistenceError, PersistenceResult, QuerySpec, StatefulEntity, StoreError, StoreResult,
    SystemClock,
};

use super::encode_document;

/// Lease coordinator over a process-local map.
pub struct InMemoryLeaseCoordinator {
    leases: RwLock<HashMap<LeaseKey, Lease>>,
    clock: Arc<dyn Clock>,
}

impl core::fmt::Debug for InMemoryLeaseCoordinator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryLeaseCoordinator").finish_non_exhaustive()
    }
}

impl InMemoryLeaseCoordinator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::new(clock))
    }

    fn read(&self) -> PersistenceResult<RwLockReadGuard<'_, HashMap<LeaseKey, Lease>>> {
        self.leases
            .read()
            .map_err(|_| PersistenceError::LockPoisoned("leases"))
    }

    fn write(&self) -> PersistenceResult<RwLockWriteGuard<'_, HashMap<LeaseKey, Lease>>> {
        self.leases
            .write()
            .map_err(|_| PersistenceError::LockPoisoned("leases"))
    }

    fn now(&self) -> i64 {
        self.clock.now_millis()
    }
}

impl Default for InMemoryLeaseCoordinator {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl LeaseCoordinator for InMemoryLeaseCoordinator {
    fn acquire(
        &self,
        resource_id: &str,
        resource_kind: &str,
        owner: &str,
        duration: Duration,
    ) -> PersistenceResult<LeaseOutcome> {
        let key = LeaseKey::new(resource_id, resource_kind);
        let mut leases = self.write()?;
        let outcome = evaluate_claim(leases.get(&key), key.clone(), owner, self.now(), duration);
        if let LeaseOutcome::Acquired(lease) = &outcome {
            leases.insert(key, lease.clone());
        }
        Ok(outcome)
    }

    fn release(&self, resource_id: &str, resource_kind: &str, owner: &str) -> PersistenceResult<bool> {
        let key = LeaseKey::new(resource_id, resource_kind);
        let mut leases = self.write()?;
        match leases.get(&key) {
            Some(lease) if lease.is_held_by(owner) => {
                leases.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn find(&self, resource_id: &str, resource_kind: &str) -> PersistenceResult<Option<Lease>> {
        let key = LeaseKey::new(resource_id, resource_kind);
        Ok(self.read()?.get(&key).cloned())
    }
}

#[derive(Debug, Clone)]
struct StoredEntity<T> {
    entity: T,
    document: Value,
}

impl<T: StatefulEntity> StoredEntity<T> {
    fn view(&self) -> FieldView<'_> {
        FieldView::new(self.entity.entity_state(), &self.document)
    }
}

struct Shared<T> {
    entities: RwLock<HashMap<String, StoredEntity<T>>>,
    leases: Arc<InMemoryLeaseCoordinator>,
}

/// Process-local [`EntityStore`] bound to one lease owner.
pub struct InMemoryEntityStore<T> {
    shared: Arc<Shared<T>>,
    owner: OwnerId,
    lease_duration: Duration,
    clock: Arc<dyn Clock>,
}

impl<T> Clone for InMemoryEntityStore<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            owner: self.owner.clone(),
            lease_duration: self.lease_duration,
            clock: self.clock.clone(),
        }
    }
}

impl<T> core::fmt::Debug for InMemoryEntityStore<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryEntityStore")
            .field("owner", &self.owner)
            .field("lease_duration", &self.lease_duration)
            .finish_non_exhaustive()
    }
}

impl<T: StatefulEntity> InMemoryEntityStore<T> {
    pub fn new(owner: impl Into<OwnerId>, lease_duration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self::with_coordinator(owner, lease_duration, InMemoryLeaseCoordinator::arc(clock))
    }

    /// Build a store over an existing coordinator (e.g. shared between entity kinds).
    ///
    /// The store reads time from the coordinator's clock, so candidate
    /// selection and lease acquisition agree on expiry.
    pub fn with_coordinator(
        owner: impl Into<OwnerId>,
        lease_duration: Duration,
        leases: Arc<InMemoryLeaseCoordinator>,
    ) -> Self {
        let clock = leases.clock.clone();
        Self {
            shared: Arc::new(Shared {
                entities: RwLock::new(HashMap::new()),
                leases,
            }),
            owner: owner.into(),
            lease_duration,
            clock,
        }
    }

    /// A handle over the same data that leases as `owner`.
    pub fn for_owner(&self, owner: impl Into<OwnerId>) -> Self {
        Self {
            owner: owner.into(),
            ..self.clone()
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn lease_coordinator(&self) -> Arc<InMemoryLeaseCoordinator> {
        self.shared.leases.clone()
    }

    pub fn len(&self) -> PersistenceResult<usize> {
        Ok(self.read_entities()?.len())
    }

    pub fn is_empty(&self) -> PersistenceResult<bool> {
        Ok(self.len()? == 0)
    }

    fn read_entities(&self) -> PersistenceResult<RwLockReadGuard<'_, HashMap<String, StoredEntity<T>>>> {
        self.shared
            .entities
            .read()
            .map_err(|_| PersistenceError::LockPoisoned("entities"))
    }

    fn write_entities(
        &self,
    ) -> PersistenceResult<RwLockWriteGuard<'_, HashMap<String, StoredEntity<T>>>> {
        self.shared
            .entities
            .write()
            .map_err(|_| PersistenceError::LockPoisoned("entities"))
    }

    /// Fail if someone other than this owner holds an unexpired lease.
    fn ensure_not_leased_by_other(
        &self,
        leases: &HashMap<LeaseKey, Lease>,
        key: &LeaseKey,
        now: i64,
    ) -> StoreResult<()> {
        match leases.get(key) {
            Some(lease) if !lease.is_claimable_by(self.owner.as_str(), now) => Err(
                StoreError::already_leased(key.resource_id.clone(), lease.leased_by.clone()),
            ),
            _ => Ok(()),
        }
    }

    fn lease_key(id: &str) -> LeaseKey {
        LeaseKey::new(id, T::RESOURCE_KIND)
    }
}

impl<T: StatefulEntity> EntityStore<T> for InMemoryEntityStore<T> {
    fn save(&self, entity: &T) -> StoreResult<()> {
        let document = encode_document(entity)?;
        let key = Self::lease_key(entity.id());

        let mut entities = self.write_entities()?;
        let mut leases = self.shared.leases.write()?;
        self.ensure_not_leased_by_other(&leases, &key, self.clock.now_millis())?;

        entities.insert(
            entity.id().to_string(),
            StoredEntity {
                entity: entity.clone(),
                document,
            },
        );
        if leases.get(&key).is_some_and(|l| l.is_held_by(self.owner.as_str())) {
            leases.remove(&key);
        }
        Ok(())
    }

    fn find(&self, id: &str) -> PersistenceResult<Option<T>> {
        Ok(self.read_entities()?.get(id).map(|s| s.entity.clone()))
    }

    fn find_all(&self, query: &QuerySpec) -> PersistenceResult<Vec<T>> {
        query.validate()?;
        let entities = self.read_entities()?;

        let mut matches: Vec<&StoredEntity<T>> =
            entities.values().filter(|s| query.matches(&s.view())).collect();

        match &query.sort_field {
            Some(field) => matches.sort_by(|a, b| {
                compare_by_field(&a.view(), &b.view(), field, query.sort_order)
                    .then_with(|| a.entity.id().cmp(b.entity.id()))
            }),
            None => matches.sort_by(|a, b| a.entity.id().cmp(b.entity.id())),
        }

        Ok(matches
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .map(|s| s.entity.clone())
            .collect())
    }

    fn delete(&self, id: &str) -> StoreResult<()> {
        let key = Self::lease_key(id);

        let mut entities = self.write_entities()?;
        let mut leases = self.shared.leases.write()?;
        let now = self.clock.now_millis();
        if !entities.contains_key(id) {
            // Clear a leftover lease unless another owner still holds it.
            if leases
                .get(&key)
                .is_some_and(|l| l.is_claimable_by(self.owner.as_str(), now))
            {
                leases.remove(&key);
            }
            return Ok(());
        }
        self.ensure_not_leased_by_other(&leases, &key, now)?;

        entities.remove(id);
        leases.remove(&key);
        Ok(())
    }

    fn next_not_leased(&self, max: usize, criteria: &[Criterion]) -> PersistenceResult<Vec<T>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        criteria.iter().try_for_each(Criterion::validate)?;

        // Held across acquisition so a concurrent delete cannot leave a stray lease.
        let entities = self.read_entities()?;
        let candidates: Vec<T> = {
            let leases = self.shared.leases.read()?;
            let now = self.clock.now_millis();

            let mut candidates: Vec<&StoredEntity<T>> = entities
                .values()
                .filter(|s| {
                    let view = s.view();
                    criteria.iter().all(|c| c.matches(&view))
                })
                .filter(|s| {
                    leases
                        .get(&Self::lease_key(s.entity.id()))
                        .is_none_or(|lease| lease.is_expired(now))
                })
                .collect();

            candidates.sort_by(|a, b| {
                a.entity
                    .state_timestamp()
                    .cmp(&b.entity.state_timestamp())
                    .then_with(|| a.entity.id().cmp(b.entity.id()))
            });
            candidates.truncate(max);
            candidates.into_iter().map(|s| s.entity.clone()).collect()
        };

        let mut claimed = Vec::with_capacity(candidates.len());
        for entity in candidates {
            match self.shared.leases.acquire(
                entity.id(),
                T::RESOURCE_KIND,
                self.owner.as_str(),
                self.lease_duration,
            )? {
                LeaseOutcome::Acquired(_) => claimed.push(entity),
                LeaseOutcome::Conflict { leased_by, .. } => {
                    debug!(
                        entity_id = entity.id(),
                        owner = %self.owner,
                        leased_by = %leased_by,
                        "lost lease race, skipping entity"
                    );
                }
            }
        }

        debug!(
            resource_kind = T::RESOURCE_KIND,
            owner = %self.owner,
            claimed = claimed.len(),
            "claimed entity batch"
        );
        Ok(claimed)
    }

    fn find_by_id_and_lease(&self, id: &str) -> StoreResult<T> {
        let entities = self.read_entities()?;
        let stored = entities
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        match self.shared.leases.acquire(
            id,
            T::RESOURCE_KIND,
            self.owner.as_str(),
            self.lease_duration,
        )? {
            LeaseOutcome::Acquired(_) => Ok(stored.entity.clone()),
            LeaseOutcome::Conflict { leased_by, .. } => Err(StoreError::already_leased(id, leased_by)),
        }
    }
}
