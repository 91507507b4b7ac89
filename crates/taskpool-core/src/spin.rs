//! Adaptive spin-wait
//!
//! Every place the dispatch core waits (claiming a worker slot, dequeuing
//! from an empty handoff, draining a pool on reset) uses `SpinWait`
//! instead of an OS-level blocking wait, so the waiter can re-check its
//! cancellation token on each iteration.
//!
//! Backoff escalates in three phases:
//! 1. busy spin with pause hints, doubling each step
//! 2. `thread::yield_now()`
//! 3. short sleeps, doubling up to `MAX_SLEEP`

use std::time::Duration;

use crate::cancel::CancellationToken;

/// Steps spent busy-spinning
const SPIN_LIMIT: u32 = 6;

/// Steps spent yielding (after the spin phase)
const YIELD_LIMIT: u32 = 10;

/// First sleep in the sleep phase
const MIN_SLEEP: Duration = Duration::from_micros(50);

/// Sleep ceiling, bounds how late a waiter notices cancellation
const MAX_SLEEP: Duration = Duration::from_millis(1);

/// Adaptive backoff state for one wait
#[derive(Debug, Default)]
pub struct SpinWait {
    step: u32,
}

impl SpinWait {
    /// Create a fresh spin-wait
    #[inline]
    pub const fn new() -> Self {
        Self { step: 0 }
    }

    /// Back off once, escalating with every call
    #[inline]
    pub fn spin_once(&mut self) {
        if self.step < SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                core::hint::spin_loop();
            }
        } else if self.step < YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            let exp = (self.step - YIELD_LIMIT).min(5);
            let sleep = (MIN_SLEEP * (1u32 << exp)).min(MAX_SLEEP);
            std::thread::sleep(sleep);
        }
        self.step = self.step.saturating_add(1);
    }

    /// Number of times `spin_once` was called since the last reset
    #[inline]
    pub fn count(&self) -> u32 {
        self.step
    }

    /// True once the wait has left the busy-spin phase
    #[inline]
    pub fn is_yielding(&self) -> bool {
        self.step >= SPIN_LIMIT
    }

    /// Restart from the cheapest phase
    #[inline]
    pub fn reset(&mut self) {
        self.step = 0;
    }
}

/// Spin until `done()` returns true or `token` is cancelled
///
/// Returns `true` if the condition was met, `false` on cancellation.
/// The condition is checked before the token, so a condition that is
/// already true wins over a cancelled token.
pub fn spin_until<F>(token: &CancellationToken, mut done: F) -> bool
where
    F: FnMut() -> bool,
{
    let mut spin = SpinWait::new();
    loop {
        if done() {
            return true;
        }
        if token.is_cancelled() {
            return false;
        }
        spin.spin_once();
    }
}
