//! Retry decisions for entities that failed in their current state.
//!
//! Failures are counted implicitly: an entity re-entering the same state bumps
//! `state_count`, so `state_count - 1` is the number of failed attempts.

use std::sync::Arc;

use tracing::debug;

use crate::clock::Clock;
use crate::entity::StatefulEntity;
use crate::wait::WaitStrategy;

/// What happened to one processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision<V, E> {
    Succeeded(V),
    Failed(E),
    /// Backoff window still open; the attempt was not run.
    Delayed,
    /// Retry budget spent; the attempt was not run.
    Exhausted,
}

impl<V, E> RetryDecision<V, E> {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, RetryDecision::Succeeded(_))
    }

    /// Whether the attempt was actually executed.
    pub fn was_attempted(&self) -> bool {
        matches!(self, RetryDecision::Succeeded(_) | RetryDecision::Failed(_))
    }
}

#[derive(Clone)]
pub struct RetryManager {
    retry_limit: u32,
    wait_strategy: Arc<dyn WaitStrategy>,
    clock: Arc<dyn Clock>,
}

impl core::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetryManager")
            .field("retry_limit", &self.retry_limit)
            .finish_non_exhaustive()
    }
}

impl RetryManager {
    pub fn new(retry_limit: u32, wait_strategy: Arc<dyn WaitStrategy>, clock: Arc<dyn Clock>) -> Self {
        Self {
            retry_limit,
            wait_strategy,
            clock,
        }
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// True while the entity's backoff window is still open.
    pub fn should_delay<T: StatefulEntity>(&self, entity: &T) -> bool {
        let failures = entity.state_count().saturating_sub(1);
        let delay = if failures == 0 {
            0
        } else {
            self.wait_strategy.retry_in_millis(failures)
        };
        let elapsed = self.clock.now_millis().saturating_sub(entity.state_timestamp());
        i128::from(elapsed) < i128::from(delay)
    }

    pub fn retries_exhausted<T: StatefulEntity>(&self, entity: &T) -> bool {
        entity.state_count() > self.retry_limit
    }

    /// Run `attempt` unless retries are exhausted or the backoff window is open.
    pub fn process<T, V, E, F>(&self, entity: &T, attempt: F) -> RetryDecision<V, E>
    where
        T: StatefulEntity,
        F: FnOnce(&T) -> Result<V, E>,
    {
        if self.retries_exhausted(entity) {
            debug!(
                entity_id = entity.id(),
                state = entity.state(),
                state_count = entity.state_count(),
                retry_limit = self.retry_limit,
                "retries exhausted"
            );
            return RetryDecision::Exhausted;
        }
        if self.should_delay(entity) {
            debug!(
                entity_id = entity.id(),
                state = entity.state(),
                state_count = entity.state_count(),
                "retry delayed"
            );
            return RetryDecision::Delayed;
        }
        match attempt(entity) {
            Ok(value) => RetryDecision::Succeeded(value),
            Err(err) => RetryDecision::Failed(err),
        }
    }
}
