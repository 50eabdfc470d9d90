//! Units of work run by a [`StateMachineManager`](super::StateMachineManager).

use std::sync::Arc;

use tracing::debug;

use dataspace_core::{EntityStore, PersistenceResult, StatefulEntity};

/// One step of work per manager iteration.
///
/// Returns how many entities made progress. Storage failures are errors;
/// an empty batch is `Ok(0)`.
pub trait Processor: Send {
    fn name(&self) -> &str;

    fn process(&mut self) -> PersistenceResult<usize>;
}

impl<P: Processor + ?Sized> Processor for Box<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn process(&mut self) -> PersistenceResult<usize> {
        (**self).process()
    }
}

/// Entity handler: returns whether the entity made progress.
pub type EntityHandler<T> = Box<dyn FnMut(T) -> bool + Send>;

/// Predicate selecting entities for the guard handler.
pub type EntityGuard<T> = Box<dyn Fn(&T) -> bool + Send>;

/// Leases a batch of entities in one state and hands each to a handler.
///
/// Entities matching the optional guard go to the guard handler instead,
/// e.g. to hold back entities awaiting manual approval.
pub struct EntityProcessor<T: StatefulEntity> {
    name: String,
    state: i32,
    batch_size: usize,
    store: Arc<dyn EntityStore<T>>,
    handler: EntityHandler<T>,
    guard: Option<(EntityGuard<T>, EntityHandler<T>)>,
}

impl<T: StatefulEntity> core::fmt::Debug for EntityProcessor<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EntityProcessor")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("batch_size", &self.batch_size)
            .field("guarded", &self.guard.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: StatefulEntity> EntityProcessor<T> {
    pub fn new<H>(name: impl Into<String>, store: Arc<dyn EntityStore<T>>, state: i32, handler: H) -> Self
    where
        H: FnMut(T) -> bool + Send + 'static,
    {
        Self {
            name: name.into(),
            state,
            batch_size: 5,
            store,
            handler: Box::new(handler),
            guard: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_guard<G, H>(mut self, guard: G, handler: H) -> Self
    where
        G: Fn(&T) -> bool + Send + 'static,
        H: FnMut(T) -> bool + Send + 'static,
    {
        self.guard = Some((Box::new(guard), Box::new(handler)));
        self
    }

    pub fn state(&self) -> i32 {
        self.state
    }
}

impl<T: StatefulEntity> Processor for EntityProcessor<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self) -> PersistenceResult<usize> {
        let entities = self.store.next_for_state(self.state, self.batch_size)?;
        if entities.is_empty() {
            return Ok(0);
        }

        let claimed = entities.len();
        let mut progressed = 0;
        for entity in entities {
            let handled = match &mut self.guard {
                Some((guard, guard_handler)) if guard(&entity) => guard_handler(entity),
                _ => (self.handler)(entity),
            };
            if handled {
                progressed += 1;
            }
        }

        debug!(
            processor = %self.name,
            state = self.state,
            claimed,
            progressed,
            "processed entity batch"
        );
        Ok(progressed)
    }
}
