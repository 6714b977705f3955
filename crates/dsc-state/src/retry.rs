//! # Wait Strategies and Send Retry
//!
//! A [`WaitStrategy`] answers two questions: how long an idle polling loop
//! should sleep, and how long to wait before re-attempting a step that has
//! already failed `n` times.
//!
//! [`EntitySendRetryManager`] applies the second answer to entities. The
//! number of prior failures of the current step is `state_count - 1`, so a
//! step entered for the first time is never delayed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dsc_core::Clock;

use crate::entity::StatefulEntity;

/// Backoff policy for polling and step retries.
pub trait WaitStrategy: Send + Sync + std::fmt::Debug {
    /// Delay before the next poll after an iteration that found no work.
    /// Strategies may grow this across consecutive idle iterations.
    fn wait_for_millis(&self) -> u64;

    /// Record an iteration that found work. Resets any idle backoff.
    fn success(&self) {}

    /// Delay before re-attempting a step that has failed `failures` times.
    fn retry_in_millis(&self, failures: u32) -> u64;
}

/// Constant delays.
#[derive(Debug, Clone, Copy)]
pub struct FixedWaitStrategy {
    millis: u64,
}

impl FixedWaitStrategy {
    /// Wait `millis` between polls and between retries.
    pub fn new(millis: u64) -> Self {
        Self { millis }
    }
}

impl WaitStrategy for FixedWaitStrategy {
    fn wait_for_millis(&self) -> u64 {
        self.millis
    }

    fn retry_in_millis(&self, failures: u32) -> u64 {
        if failures == 0 {
            0
        } else {
            self.millis
        }
    }
}

/// Doubling delays, capped.
///
/// Retries wait `base * 2^(failures - 1)`. Idle polls start at `base` and
/// double with each consecutive idle iteration until [`success`] resets
/// them.
///
/// [`success`]: WaitStrategy::success
#[derive(Debug)]
pub struct ExponentialWaitStrategy {
    base_millis: u64,
    max_millis: u64,
    idle_iterations: AtomicU32,
}

impl ExponentialWaitStrategy {
    /// Doubling from `base_millis`, never exceeding `max_millis`.
    pub fn new(base_millis: u64, max_millis: u64) -> Self {
        Self {
            base_millis,
            max_millis: max_millis.max(base_millis),
            idle_iterations: AtomicU32::new(0),
        }
    }

    fn backoff(&self, exponent: u32) -> u64 {
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.base_millis.saturating_mul(factor).min(self.max_millis)
    }
}

impl WaitStrategy for ExponentialWaitStrategy {
    fn wait_for_millis(&self) -> u64 {
        let idle = self.idle_iterations.fetch_add(1, Ordering::Relaxed);
        self.backoff(idle)
    }

    fn success(&self) {
        self.idle_iterations.store(0, Ordering::Relaxed);
    }

    fn retry_in_millis(&self, failures: u32) -> u64 {
        match failures {
            0 => 0,
            n => self.backoff(n - 1),
        }
    }
}

/// Retry gate for remote sends.
#[derive(Debug, Clone)]
pub struct EntitySendRetryManager {
    wait_strategy: Arc<dyn WaitStrategy>,
    clock: Arc<dyn Clock>,
    send_retry_limit: u32,
}

impl EntitySendRetryManager {
    /// A retry manager allowing `send_retry_limit` attempts per step.
    pub fn new(wait_strategy: Arc<dyn WaitStrategy>, clock: Arc<dyn Clock>, send_retry_limit: u32) -> Self {
        Self {
            wait_strategy,
            clock,
            send_retry_limit,
        }
    }

    /// Whether the entity must wait longer before its next attempt.
    ///
    /// True while less than `retry_in_millis(state_count - 1)` has passed
    /// since the entity entered its current state.
    pub fn should_delay<T: StatefulEntity>(&self, entity: &T) -> bool {
        let meta = entity.meta();
        let failures = meta.state_count.saturating_sub(1);
        let delay = i64::try_from(self.wait_strategy.retry_in_millis(failures)).unwrap_or(i64::MAX);
        self.clock.now_millis() - meta.state_timestamp < delay
    }

    /// Whether the current step has used up its attempts.
    ///
    /// Attempt number `send_retry_limit` is the last allowed one.
    pub fn retries_exhausted<T: StatefulEntity>(&self, entity: &T) -> bool {
        entity.meta().state_count > self.send_retry_limit
    }

    /// Configured attempt limit.
    pub fn send_retry_limit(&self) -> u32 {
        self.send_retry_limit
    }
}
