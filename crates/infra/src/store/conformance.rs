//! Behaviour every `EntityStore` backend must share.
//!
//! Each case takes a fresh [`Fixture`] and drives the store through the public
//! trait only, so the same functions run against every backend.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dataspace_core::{
    Criterion, EntityState, EntityStore, ManualClock, Operator, PersistenceError, QuerySpec,
    SortOrder, StatefulEntity, StoreError,
};

pub(crate) const LEASE_DURATION: Duration = Duration::from_secs(60);
pub(crate) const START_MILLIS: i64 = 1_700_000_000_000;

const REQUESTED: i32 = 100;
const AGREED: i32 = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TestEntity {
    #[serde(flatten)]
    pub state: EntityState,
    pub counter_party: String,
    pub protocol: String,
    #[serde(default)]
    pub offers: Vec<String>,
}

impl TestEntity {
    pub fn new(id: impl Into<String>, state: i32, state_timestamp: i64) -> Self {
        let state = EntityState::new(id, state, state_timestamp);
        Self {
            counter_party: format!("provider-{}", state.id),
            protocol: "dataspace-protocol-http".to_string(),
            offers: Vec::new(),
            state,
        }
    }

    fn with_counter_party(mut self, counter_party: &str) -> Self {
        self.counter_party = counter_party.to_string();
        self
    }
}

impl StatefulEntity for TestEntity {
    const RESOURCE_KIND: &'static str = "test-negotiation";

    fn entity_state(&self) -> &EntityState {
        &self.state
    }

    fn entity_state_mut(&mut self) -> &mut EntityState {
        &mut self.state
    }
}

type StoreFactory = Box<dyn Fn(&str) -> Arc<dyn EntityStore<TestEntity>> + Send + Sync>;

/// Stores for several owners over one backing store, plus the clock they share.
pub(crate) struct Fixture {
    pub clock: Arc<ManualClock>,
    make: StoreFactory,
}

impl Fixture {
    pub fn new<F>(clock: Arc<ManualClock>, make: F) -> Self
    where
        F: Fn(&str) -> Arc<dyn EntityStore<TestEntity>> + Send + Sync + 'static,
    {
        Self {
            clock,
            make: Box::new(make),
        }
    }

    pub fn store(&self, owner: &str) -> Arc<dyn EntityStore<TestEntity>> {
        (self.make)(owner)
    }

    fn expire_leases(&self) {
        let millis = i64::try_from(LEASE_DURATION.as_millis()).unwrap_or(i64::MAX);
        self.clock.advance(millis + 1);
    }
}

pub(crate) type Case = fn(&Fixture);

pub(crate) const CASES: &[(&str, Case)] = &[
    ("save_then_find_round_trips", save_then_find_round_trips),
    ("save_replaces_existing", save_replaces_existing),
    ("find_missing_is_none", find_missing_is_none),
    ("next_for_state_is_oldest_first", next_for_state_is_oldest_first),
    ("next_for_state_filters_state_and_bounds_batch", next_for_state_filters_state_and_bounds_batch),
    ("claims_are_exclusive_until_expiry", claims_are_exclusive_until_expiry),
    ("owner_does_not_reclaim_own_lease", owner_does_not_reclaim_own_lease),
    ("save_releases_own_lease", save_releases_own_lease),
    ("requeued_entity_goes_behind_older_pending", requeued_entity_goes_behind_older_pending),
    ("save_rejects_foreign_lease", save_rejects_foreign_lease),
    ("delete_removes_entity_and_lease", delete_removes_entity_and_lease),
    ("delete_rejects_foreign_lease", delete_rejects_foreign_lease),
    ("find_by_id_and_lease_outcomes", find_by_id_and_lease_outcomes),
    ("find_all_filters_sorts_and_pages", find_all_filters_sorts_and_pages),
    ("find_all_document_operators", find_all_document_operators),
    ("next_not_leased_with_document_criteria", next_not_leased_with_document_criteria),
    ("invalid_queries_are_rejected", invalid_queries_are_rejected),
];

fn ids(entities: &[TestEntity]) -> Vec<&str> {
    entities.iter().map(|e| e.id()).collect()
}

fn save_then_find_round_trips(fx: &Fixture) {
    let store = fx.store("runtime-a");
    let mut entity = TestEntity::new("n-1", REQUESTED, START_MILLIS);
    entity.offers = vec!["asset-1".to_string(), "asset-2".to_string()];
    entity.state.trace_context.insert("traceparent".to_string(), "00-abc-01".to_string());
    entity.state.set_error_detail("previous attempt timed out");

    store.save(&entity).unwrap();
    assert_eq!(store.find("n-1").unwrap(), Some(entity));
}

fn save_replaces_existing(fx: &Fixture) {
    let store = fx.store("runtime-a");
    let mut entity = TestEntity::new("n-1", REQUESTED, START_MILLIS);
    store.save(&entity).unwrap();

    entity.transition_to(AGREED, START_MILLIS + 10);
    store.save(&entity).unwrap();
    store.save(&entity).unwrap();

    let all = store.find_all(&QuerySpec::new()).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].state(), AGREED);
    assert_eq!(all[0].state_timestamp(), START_MILLIS + 10);
}

fn find_missing_is_none(fx: &Fixture) {
    assert_eq!(fx.store("runtime-a").find("missing").unwrap(), None);
}

fn next_for_state_is_oldest_first(fx: &Fixture) {
    let store = fx.store("runtime-a");
    store.save(&TestEntity::new("a", REQUESTED, 50)).unwrap();
    store.save(&TestEntity::new("b", REQUESTED, 10)).unwrap();
    store.save(&TestEntity::new("c", REQUESTED, 30)).unwrap();

    let claimed = store.next_for_state(REQUESTED, 2).unwrap();
    assert_eq!(ids(&claimed), vec!["b", "c"]);
}

fn next_for_state_filters_state_and_bounds_batch(fx: &Fixture) {
    let store = fx.store("runtime-a");
    for i in 0..6 {
        store.save(&TestEntity::new(format!("req-{i}"), REQUESTED, i)).unwrap();
        store.save(&TestEntity::new(format!("agr-{i}"), AGREED, i)).unwrap();
    }

    let first = store.next_for_state(AGREED, 4).unwrap();
    assert_eq!(ids(&first), vec!["agr-0", "agr-1", "agr-2", "agr-3"]);
    assert!(first.iter().all(|e| e.state() == AGREED));

    let rest = store.next_for_state(AGREED, 4).unwrap();
    assert_eq!(ids(&rest), vec!["agr-4", "agr-5"]);
    assert!(store.next_for_state(AGREED, 4).unwrap().is_empty());
    assert!(store.next_for_state(REQUESTED, 0).unwrap().is_empty());
}

fn claims_are_exclusive_until_expiry(fx: &Fixture) {
    let a = fx.store("runtime-a");
    let b = fx.store("runtime-b");
    a.save(&TestEntity::new("n-1", REQUESTED, 0)).unwrap();

    assert_eq!(ids(&a.next_for_state(REQUESTED, 10).unwrap()), vec!["n-1"]);
    assert!(b.next_for_state(REQUESTED, 10).unwrap().is_empty());

    fx.expire_leases();
    assert_eq!(ids(&b.next_for_state(REQUESTED, 10).unwrap()), vec!["n-1"]);
    assert!(a.next_for_state(REQUESTED, 10).unwrap().is_empty());
}

fn owner_does_not_reclaim_own_lease(fx: &Fixture) {
    let a = fx.store("runtime-a");
    a.save(&TestEntity::new("n-1", REQUESTED, 0)).unwrap();

    assert_eq!(a.next_for_state(REQUESTED, 10).unwrap().len(), 1);
    assert!(a.next_for_state(REQUESTED, 10).unwrap().is_empty());
}

fn save_releases_own_lease(fx: &Fixture) {
    let a = fx.store("runtime-a");
    let b = fx.store("runtime-b");
    a.save(&TestEntity::new("n-1", REQUESTED, 0)).unwrap();

    let mut claimed = a.next_for_state(REQUESTED, 1).unwrap().remove(0);
    claimed.transition_to(REQUESTED, START_MILLIS);
    a.save(&claimed).unwrap();

    let reclaimed = b.next_for_state(REQUESTED, 1).unwrap();
    assert_eq!(ids(&reclaimed), vec!["n-1"]);
    assert_eq!(reclaimed[0].state_count(), 2);
}

fn requeued_entity_goes_behind_older_pending(fx: &Fixture) {
    let a = fx.store("runtime-a");
    let b = fx.store("runtime-b");
    a.save(&TestEntity::new("o-1", REQUESTED, 10)).unwrap();
    a.save(&TestEntity::new("o-2", REQUESTED, 20)).unwrap();
    a.save(&TestEntity::new("o-3", REQUESTED, 30)).unwrap();

    let mut failed = a.next_for_state(REQUESTED, 1).unwrap().remove(0);
    assert_eq!(failed.id(), "o-1");
    failed.transition_to(REQUESTED, START_MILLIS);
    a.save(&failed).unwrap();

    assert_eq!(ids(&b.next_for_state(REQUESTED, 2).unwrap()), vec!["o-2", "o-3"]);
    let requeued = b.next_for_state(REQUESTED, 2).unwrap();
    assert_eq!(ids(&requeued), vec!["o-1"]);
    assert_eq!(requeued[0].state_count(), 2);
}

fn save_rejects_foreign_lease(fx: &Fixture) {
    let a = fx.store("runtime-a");
    let b = fx.store("runtime-b");
    let entity = TestEntity::new("n-1", REQUESTED, 0);
    a.save(&entity).unwrap();
    a.next_for_state(REQUESTED, 1).unwrap();

    match b.save(&entity) {
        Err(StoreError::AlreadyLeased { id, leased_by }) => {
            assert_eq!(id, "n-1");
            assert_eq!(leased_by, "runtime-a");
        }
        other => panic!("expected AlreadyLeased, got {other:?}"),
    }

    fx.expire_leases();
    b.save(&entity).unwrap();
}

fn delete_removes_entity_and_lease(fx: &Fixture) {
    let a = fx.store("runtime-a");
    let b = fx.store("runtime-b");
    a.save(&TestEntity::new("n-1", REQUESTED, 0)).unwrap();
    a.next_for_state(REQUESTED, 1).unwrap();

    a.delete("n-1").unwrap();
    assert_eq!(a.find("n-1").unwrap(), None);
    a.delete("n-1").unwrap();
    a.delete("never-existed").unwrap();

    b.save(&TestEntity::new("n-1", REQUESTED, 0)).unwrap();
    assert_eq!(ids(&b.next_for_state(REQUESTED, 1).unwrap()), vec!["n-1"]);
}

fn delete_rejects_foreign_lease(fx: &Fixture) {
    let a = fx.store("runtime-a");
    let b = fx.store("runtime-b");
    a.save(&TestEntity::new("n-1", REQUESTED, 0)).unwrap();
    a.next_for_state(REQUESTED, 1).unwrap();

    assert!(b.delete("n-1").unwrap_err().is_already_leased());
    assert!(b.find("n-1").unwrap().is_some());
}

fn find_by_id_and_lease_outcomes(fx: &Fixture) {
    let a = fx.store("runtime-a");
    let b = fx.store("runtime-b");

    assert!(a.find_by_id_and_lease("n-1").unwrap_err().is_not_found());

    a.save(&TestEntity::new("n-1", REQUESTED, 0)).unwrap();
    assert_eq!(a.find_by_id_and_lease("n-1").unwrap().id(), "n-1");
    assert_eq!(a.find_by_id_and_lease("n-1").unwrap().id(), "n-1");
    assert!(b.find_by_id_and_lease("n-1").unwrap_err().is_already_leased());
    assert!(b.next_for_state(REQUESTED, 1).unwrap().is_empty());
}

fn seed_query_entities(store: &dyn EntityStore<TestEntity>) {
    store.save(&TestEntity::new("q-1", REQUESTED, 40).with_counter_party("alpha")).unwrap();
    store.save(&TestEntity::new("q-2", REQUESTED, 10).with_counter_party("beta")).unwrap();
    store.save(&TestEntity::new("q-3", AGREED, 30).with_counter_party("alpha")).unwrap();
    store.save(&TestEntity::new("q-4", REQUESTED, 20).with_counter_party("gamma")).unwrap();
    let mut failed = TestEntity::new("q-5", REQUESTED, 50).with_counter_party("delta");
    failed.state.set_error_detail("counter-party rejected offer");
    store.save(&failed).unwrap();
}

fn find_all_filters_sorts_and_pages(fx: &Fixture) {
    let store = fx.store("runtime-a");
    seed_query_entities(store.as_ref());

    let by_id = store.find_all(&QuerySpec::new()).unwrap();
    assert_eq!(ids(&by_id), vec!["q-1", "q-2", "q-3", "q-4", "q-5"]);

    let requested = QuerySpec::new()
        .filter(Criterion::eq("state", REQUESTED))
        .sort_by("state_timestamp", SortOrder::Desc);
    assert_eq!(ids(&store.find_all(&requested).unwrap()), vec!["q-5", "q-1", "q-4", "q-2"]);
    assert_eq!(
        ids(&store.find_all(&requested.clone().offset(1).limit(2)).unwrap()),
        vec!["q-1", "q-4"]
    );

    let by_party = QuerySpec::new()
        .filter(Criterion::eq("counter_party", "alpha"))
        .sort_by("state_timestamp", SortOrder::Asc);
    assert_eq!(ids(&store.find_all(&by_party).unwrap()), vec!["q-3", "q-1"]);

    let sorted_by_document = QuerySpec::new().sort_by("counter_party", SortOrder::Desc);
    assert_eq!(
        ids(&store.find_all(&sorted_by_document).unwrap()),
        vec!["q-4", "q-5", "q-2", "q-1", "q-3"]
    );

    let failed = QuerySpec::new().filter(Criterion::new("error_detail", Operator::Like, "%rejected%"));
    assert_eq!(ids(&store.find_all(&failed).unwrap()), vec!["q-5"]);

    let window = QuerySpec::new()
        .filter(Criterion::new("state_timestamp", Operator::Ge, 20))
        .filter(Criterion::new("state_timestamp", Operator::Lt, 50));
    assert_eq!(ids(&store.find_all(&window).unwrap()), vec!["q-1", "q-3", "q-4"]);

    let not_requested = QuerySpec::new().filter(Criterion::new("state", Operator::Ne, REQUESTED));
    assert_eq!(ids(&store.find_all(&not_requested).unwrap()), vec!["q-3"]);
}

fn find_all_document_operators(fx: &Fixture) {
    let store = fx.store("runtime-a");
    seed_query_entities(store.as_ref());

    let one_of = QuerySpec::new().filter(Criterion::one_of("counter_party", ["beta", "gamma"]));
    assert_eq!(ids(&store.find_all(&one_of).unwrap()), vec!["q-2", "q-4"]);

    let like = QuerySpec::new().filter(Criterion::new("counter_party", Operator::Like, "%a"));
    assert_eq!(
        ids(&store.find_all(&like).unwrap()),
        vec!["q-1", "q-2", "q-3", "q-4", "q-5"]
    );

    let after = QuerySpec::new().filter(Criterion::new("counter_party", Operator::Gt, "beta"));
    assert_eq!(ids(&store.find_all(&after).unwrap()), vec!["q-4", "q-5"]);

    let missing = QuerySpec::new().filter(Criterion::eq("counter_party_address", "anywhere"));
    assert!(store.find_all(&missing).unwrap().is_empty());

    let none_in = QuerySpec::new().filter(Criterion::one_of("state", Vec::<i32>::new()));
    assert!(store.find_all(&none_in).unwrap().is_empty());
}

fn next_not_leased_with_document_criteria(fx: &Fixture) {
    let a = fx.store("runtime-a");
    let b = fx.store("runtime-b");
    seed_query_entities(a.as_ref());

    let criteria = [
        Criterion::eq("state", REQUESTED),
        Criterion::eq("counter_party", "alpha"),
    ];
    assert_eq!(ids(&a.next_not_leased(10, &criteria).unwrap()), vec!["q-1"]);
    assert!(b.next_not_leased(10, &criteria).unwrap().is_empty());

    let remaining = b.next_for_state(REQUESTED, 10).unwrap();
    assert_eq!(ids(&remaining), vec!["q-2", "q-4", "q-5"]);
}

fn invalid_queries_are_rejected(fx: &Fixture) {
    let store = fx.store("runtime-a");
    let bad = QuerySpec::new().filter(Criterion::new("state", Operator::In, REQUESTED));
    assert!(matches!(store.find_all(&bad), Err(PersistenceError::InvalidQuery(_))));
    assert!(matches!(
        store.next_not_leased(1, &[Criterion::new("counter_party", Operator::Like, 3)]),
        Err(PersistenceError::InvalidQuery(_))
    ));
}
