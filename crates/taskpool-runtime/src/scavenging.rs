//! Self-renewing pools
//!
//! A scavenging pool runs its action over and over in every slot it is
//! given: when one execution finishes and releases its slot, it claims
//! the next slot itself and schedules the action again. Starting the
//! pool is just priming it once per desired concurrent loop.
//!
//! Renewal happens after the finishing execution has released its slot,
//! so a pool with a single slot cycles without deadlocking on itself.
//! Renewal only ever claims slots in the generation the execution ran
//! in, so once `reset()` has cancelled a generation its loops die out
//! and never leak into the next one.

use std::sync::Arc;

use taskpool_core::cancel::CancellationToken;
use taskpool_core::error::PoolResult;
use taskpool_core::spin::spin_until;
use taskpool_core::{tp_trace, tp_warn};

use crate::config::TaskPoolOptions;
use crate::executor::{ElasticExecutor, Executor};
use crate::pool::{Generation, Renewal, TaskPool};

/// Create a pool whose executions renew themselves until reset
pub fn scavenging_pool<F>(action: F, options: TaskPoolOptions) -> PoolResult<TaskPool>
where
    F: Fn(&CancellationToken) + Send + Sync + 'static,
{
    let executor = Arc::new(ElasticExecutor::new(options.name.clone(), options.keep_alive));
    TaskPool::build(Box::new(action), options, executor, Renewal::Scavenge)
}

/// Same as `scavenging_pool`, on a caller-supplied executor
pub fn scavenging_pool_with_executor<F>(
    action: F,
    options: TaskPoolOptions,
    executor: Arc<dyn Executor>,
) -> PoolResult<TaskPool>
where
    F: Fn(&CancellationToken) + Send + Sync + 'static,
{
    TaskPool::build(Box::new(action), options, executor, Renewal::Scavenge)
}

/// Claim the next slot in `generation` and run the action again
///
/// Spins while the pool is full or over its waiting limit; gives up as
/// soon as the generation is cancelled.
pub(crate) fn renew(pool: &TaskPool, generation: &Arc<Generation>) {
    let mut runner = None;
    spin_until(generation.token(), || {
        runner = pool.next_in(generation);
        runner.is_some()
    });

    match runner {
        Some(runner) => {
            if let Err(e) = runner.run() {
                tp_warn!("{}: renewal failed to schedule: {}", pool.options().name, e);
            }
        }
        None => tp_trace!("{}: generation cancelled, not renewing", pool.options().name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn options(workers: usize) -> TaskPoolOptions {
        TaskPoolOptions::new()
            .max_active_workers(workers)
            .max_waiting_requests(16)
            .name("scavenge-test")
    }

    fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_single_slot_keeps_cycling() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        let pool = scavenging_pool(
            move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            },
            options(1),
        )
        .unwrap();

        assert_eq!(pool.prime(1).unwrap(), 1);
        wait_for("many cycles", || runs.load(Ordering::SeqCst) >= 100);

        pool.reset();
        let after = runs.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(runs.load(Ordering::SeqCst), after, "action ran after reset");
        assert_eq!(pool.active_workers(), 0);
    }

    #[test]
    fn test_loops_stay_within_capacity() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));
        let (c, p, r) = (Arc::clone(&current), Arc::clone(&peak), Arc::clone(&runs));

        let pool = scavenging_pool(
            move |_| {
                let now = c.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                thread::yield_now();
                c.fetch_sub(1, Ordering::SeqCst);
                r.fetch_add(1, Ordering::SeqCst);
            },
            options(3),
        )
        .unwrap();

        // Priming more than capacity only starts capacity loops
        assert_eq!(pool.prime(10).unwrap(), 3);
        wait_for("cycles", || runs.load(Ordering::SeqCst) >= 300);
        pool.reset();

        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_reset_then_prime_starts_new_generation() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        let pool = scavenging_pool(
            move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
            },
            options(2),
        )
        .unwrap();

        pool.prime(2).unwrap();
        wait_for("first generation", || runs.load(Ordering::SeqCst) >= 10);
        pool.reset();
        assert_eq!(pool.generation(), 1);

        let before = runs.load(Ordering::SeqCst);
        pool.prime(2).unwrap();
        wait_for("second generation", || runs.load(Ordering::SeqCst) >= before + 10);
        pool.reset();
    }

    #[test]
    fn test_action_sees_generation_token() {
        let pool = scavenging_pool(
            move |token| {
                while !token.is_cancelled() {
                    thread::sleep(Duration::from_millis(1));
                }
            },
            options(2),
        )
        .unwrap();

        pool.prime(2).unwrap();
        wait_for("both loops", || pool.active_workers() == 2);
        pool.reset();
        assert_eq!(pool.active_workers(), 0);
    }
}
