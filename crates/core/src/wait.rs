//! Backoff policies.
//!
//! A [`WaitStrategy`] maps a failure count to a delay and reports the idle
//! wait used between worker iterations that found nothing to do. All
//! strategies are deterministic for a given input.

use std::sync::Arc;
use std::time::Duration;

pub trait WaitStrategy: Send + Sync {
    /// Delay in millis before the next attempt after `failures` failures.
    ///
    /// `failures == 0` always yields 0.
    fn retry_in_millis(&self, failures: u32) -> u64;

    /// Idle wait in millis after an iteration that processed nothing.
    fn wait_for_millis(&self) -> u64;
}

impl<W> WaitStrategy for Arc<W>
where
    W: WaitStrategy + ?Sized,
{
    fn retry_in_millis(&self, failures: u32) -> u64 {
        (**self).retry_in_millis(failures)
    }

    fn wait_for_millis(&self) -> u64 {
        (**self).wait_for_millis()
    }
}

/// `base * 2^(failures - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialWaitStrategy {
    base_millis: u64,
    max_millis: u64,
    idle_millis: u64,
}

impl ExponentialWaitStrategy {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base_millis = as_millis(base);
        Self {
            base_millis,
            max_millis: as_millis(max).max(base_millis),
            idle_millis: base_millis,
        }
    }

    pub fn with_idle_wait(mut self, idle: Duration) -> Self {
        self.idle_millis = as_millis(idle);
        self
    }
}

impl Default for ExponentialWaitStrategy {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(30))
            .with_idle_wait(Duration::from_millis(500))
    }
}

impl WaitStrategy for ExponentialWaitStrategy {
    fn retry_in_millis(&self, failures: u32) -> u64 {
        if failures == 0 {
            return 0;
        }
        let exponent = (failures - 1).min(63);
        let factor = 1u64 << exponent;
        self.base_millis.saturating_mul(factor).min(self.max_millis)
    }

    fn wait_for_millis(&self) -> u64 {
        self.idle_millis
    }
}

/// Same delay for every failure count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWaitStrategy {
    delay_millis: u64,
}

impl FixedWaitStrategy {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay_millis: as_millis(delay),
        }
    }

    pub fn millis(delay_millis: u64) -> Self {
        Self { delay_millis }
    }
}

impl WaitStrategy for FixedWaitStrategy {
    fn retry_in_millis(&self, failures: u32) -> u64 {
        if failures == 0 { 0 } else { self.delay_millis }
    }

    fn wait_for_millis(&self) -> u64 {
        self.delay_millis
    }
}

/// Spreads retries of another strategy by up to `ratio` of its delay.
///
/// The jitter fraction is derived from the failure count, so the same count
/// always produces the same delay.
#[derive(Debug, Clone, Copy)]
pub struct JitteredWaitStrategy<W> {
    inner: W,
    ratio: f64,
}

impl<W> JitteredWaitStrategy<W> {
    pub fn new(inner: W, ratio: f64) -> Self {
        Self {
            inner,
            ratio: ratio.clamp(0.0, 1.0),
        }
    }
}

impl<W: WaitStrategy> WaitStrategy for JitteredWaitStrategy<W> {
    fn retry_in_millis(&self, failures: u32) -> u64 {
        let delay = self.inner.retry_in_millis(failures);
        if delay == 0 {
            return 0;
        }
        let fraction = ((u64::from(failures) * 17) % 100) as f64 / 100.0;
        let jitter = (delay as f64 * self.ratio * fraction) as u64;
        delay.saturating_add(jitter)
    }

    fn wait_for_millis(&self) -> u64 {
        self.inner.wait_for_millis()
    }
}

fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_doubles_until_capped() {
        let strategy =
            ExponentialWaitStrategy::new(Duration::from_millis(100), Duration::from_millis(1_000));
        assert_eq!(strategy.retry_in_millis(0), 0);
        assert_eq!(strategy.retry_in_millis(1), 100);
        assert_eq!(strategy.retry_in_millis(2), 200);
        assert_eq!(strategy.retry_in_millis(4), 800);
        assert_eq!(strategy.retry_in_millis(5), 1_000);
        assert_eq!(strategy.retry_in_millis(u32::MAX), 1_000);
    }

    #[test]
    fn fixed_returns_zero_without_failures() {
        let strategy = FixedWaitStrategy::millis(10);
        assert_eq!(strategy.retry_in_millis(0), 0);
        assert_eq!(strategy.retry_in_millis(1), 10);
        assert_eq!(strategy.retry_in_millis(50), 10);
        assert_eq!(strategy.wait_for_millis(), 10);
    }

    #[test]
    fn jitter_is_bounded_and_deterministic() {
        let base = FixedWaitStrategy::millis(1_000);
        let strategy = JitteredWaitStrategy::new(base, 0.5);
        for failures in 1..200 {
            let delay = strategy.retry_in_millis(failures);
            assert!((1_000..=1_500).contains(&delay));
            assert_eq!(delay, strategy.retry_in_millis(failures));
        }
        assert_eq!(strategy.retry_in_millis(0), 0);
    }

    #[test]
    fn idle_wait_is_configurable() {
        let strategy = ExponentialWaitStrategy::new(Duration::from_millis(100), Duration::from_secs(1))
            .with_idle_wait(Duration::from_millis(250));
        assert_eq!(strategy.wait_for_millis(), 250);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            .. ProptestConfig::default()
        })]

        #[test]
        fn exponential_is_monotonic_and_capped(
            base in 1u64..10_000,
            cap in 1u64..1_000_000,
            failures in 1u32..128,
        ) {
            let strategy = ExponentialWaitStrategy::new(
                Duration::from_millis(base),
                Duration::from_millis(cap),
            );
            let current = strategy.retry_in_millis(failures);
            let next = strategy.retry_in_millis(failures + 1);
            prop_assert!(current <= next);
            prop_assert!(next <= cap.max(base));
            prop_assert!(current >= base.min(cap.max(base)));
        }
    }
}
