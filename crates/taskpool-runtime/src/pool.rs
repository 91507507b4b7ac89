//! Worker-slot pool
//!
//! A `TaskPool` bounds how many task bodies run at once. Callers ask for
//! a slot with `next()`; what they get back is a `TaskPoolRunner` that
//! owns the slot until its execution finishes.
//!
//! ## Counters
//!
//! - `active_workers`: slots currently claimed. Never exceeds
//!   `max_active_workers`.
//! - `active_waiters`: callers currently inside `next()`. A caller that
//!   would push it past `max_waiting_requests` is rejected, not queued.
//!
//! Both are plain atomics; nothing on the `next()` path takes a lock
//! except a short read of the current generation.
//!
//! ## Generations
//!
//! Every runner is tied to the generation it was claimed in. `reset()`
//! cancels the current generation, waits for every claimed slot to be
//! released and installs a fresh one. Executions of a cancelled
//! generation that have not started yet are discarded.
//!
//! ```text
//!   next() ──▶ TaskPoolRunner ──run()──▶ executor ──▶ exec()
//!                (slot held)                            │
//!                                                       ├─ generation cancelled? skip
//!                                                       ├─ start deadline missed? skip
//!                                                       ├─ run body (panics caught)
//!                                                       └─ release slot (always)
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use taskpool_core::cancel::{CancellationSource, CancellationToken};
use taskpool_core::error::PoolResult;
use taskpool_core::spin::SpinWait;
use taskpool_core::{tp_debug, tp_info, tp_trace, tp_warn};

use crate::config::TaskPoolOptions;
use crate::escalation::{Escalation, EscalationState};
use crate::executor::{panic_message, ElasticExecutor, Executor};
use crate::scavenging;

/// Added to `active_waiters` while a reset is in progress so that every
/// concurrent `next()` sees the pool as over its waiting limit.
const RESET_SENTINEL: usize = 1 << (usize::BITS - 2);

/// The body a pool runs in each slot
pub type TaskFn = dyn Fn(&CancellationToken) + Send + Sync + 'static;

/// What happens after an execution releases its slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Renewal {
    /// Nothing; the caller decides whether to run again
    Once,
    /// Claim the next slot and run again (see `scavenging`)
    Scavenge,
}

/// One epoch of the pool
pub(crate) struct Generation {
    id: u64,
    source: CancellationSource,
    token: CancellationToken,
    escalation: Escalation,
    abort: CancellationToken,
}

impl Generation {
    fn new(id: u64, options: &TaskPoolOptions) -> Arc<Self> {
        let source = CancellationSource::new();
        let token = source.token();
        let escalation = Escalation::new(format!("{}-g{}", options.name, id), options.grace_period);
        let abort = escalation.abort_token();

        // Cooperative cancellation starts the escalation timer
        let armed = escalation.clone();
        token.register(move || armed.arm());

        Arc::new(Self {
            id,
            source,
            token,
            escalation,
            abort,
        })
    }

    #[inline]
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[inline]
    fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub(crate) struct PoolShared {
    options: TaskPoolOptions,
    run: Box<TaskFn>,
    renewal: Renewal,
    executor: Arc<dyn Executor>,
    active_workers: AtomicUsize,
    active_waiters: AtomicUsize,
    generation: RwLock<Arc<Generation>>,
    reset_lock: Mutex<()>,
}

/// Pool of worker slots
///
/// Cloning gives another handle to the same pool.
#[derive(Clone)]
pub struct TaskPool {
    shared: Arc<PoolShared>,
}

/// Non-owning handle, for closures that need to reach their own pool
#[derive(Clone)]
pub struct WeakTaskPool {
    shared: Weak<PoolShared>,
}

impl WeakTaskPool {
    pub fn upgrade(&self) -> Option<TaskPool> {
        self.shared.upgrade().map(|shared| TaskPool { shared })
    }
}

impl TaskPool {
    /// Create a pool running `run` in each slot, on its own executor
    pub fn new<F>(run: F, options: TaskPoolOptions) -> PoolResult<Self>
    where
        F: Fn(&CancellationToken) + Send + Sync + 'static,
    {
        let executor = Arc::new(ElasticExecutor::new(options.name.clone(), options.keep_alive));
        Self::build(Box::new(run), options, executor, Renewal::Once)
    }

    /// Create a pool that schedules on a caller-supplied executor
    pub fn with_executor<F>(
        run: F,
        options: TaskPoolOptions,
        executor: Arc<dyn Executor>,
    ) -> PoolResult<Self>
    where
        F: Fn(&CancellationToken) + Send + Sync + 'static,
    {
        Self::build(Box::new(run), options, executor, Renewal::Once)
    }

    pub(crate) fn build(
        run: Box<TaskFn>,
        options: TaskPoolOptions,
        executor: Arc<dyn Executor>,
        renewal: Renewal,
    ) -> PoolResult<Self> {
        options.validate()?;
        let generation = Generation::new(0, &options);
        tp_debug!(
            "{}: pool created (workers={}, waiters={}, renewal={:?})",
            options.name,
            options.max_active_workers,
            options.max_waiting_requests,
            renewal
        );
        Ok(Self {
            shared: Arc::new(PoolShared {
                options,
                run,
                renewal,
                executor,
                active_workers: AtomicUsize::new(0),
                active_waiters: AtomicUsize::new(0),
                generation: RwLock::new(generation),
                reset_lock: Mutex::new(()),
            }),
        })
    }

    /// Wait for a worker slot
    ///
    /// Returns `None` without waiting if `max_waiting_requests` callers are
    /// already waiting, if the current generation is cancelled, or if a
    /// reset is in progress. Otherwise spins until a slot frees up or the
    /// generation is cancelled.
    pub fn next(&self) -> Option<TaskPoolRunner> {
        self.acquire(None, true)
    }

    /// Claim a worker slot only if one is free right now
    pub fn try_next(&self) -> Option<TaskPoolRunner> {
        self.acquire(None, false)
    }

    /// Like `next()`, but only within `expected`'s generation
    pub(crate) fn next_in(&self, expected: &Arc<Generation>) -> Option<TaskPoolRunner> {
        self.acquire(Some(expected), true)
    }

    fn acquire(&self, expected: Option<&Arc<Generation>>, wait: bool) -> Option<TaskPoolRunner> {
        let shared = &self.shared;
        let options = &shared.options;

        let waiters = shared.active_waiters.fetch_add(1, Ordering::SeqCst) + 1;
        if waiters > options.max_waiting_requests {
            shared.active_waiters.fetch_sub(1, Ordering::SeqCst);
            tp_trace!("{}: rejected, {} waiting", options.name, waiters - 1);
            return None;
        }

        let generation = self.current_generation();
        let stale = expected.is_some_and(|e| !Arc::ptr_eq(e, &generation));
        if stale || generation.is_cancelled() {
            shared.active_waiters.fetch_sub(1, Ordering::SeqCst);
            return None;
        }

        let mut spin = SpinWait::new();
        loop {
            let claimed = shared
                .active_workers
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < options.max_active_workers).then_some(n + 1)
                })
                .is_ok();
            if claimed {
                break;
            }
            if !wait || generation.is_cancelled() {
                shared.active_waiters.fetch_sub(1, Ordering::SeqCst);
                return None;
            }
            spin.spin_once();
        }

        shared.active_waiters.fetch_sub(1, Ordering::SeqCst);
        let slot = WorkerSlot {
            shared: Arc::clone(shared),
        };

        // A reset that cancelled after our check either sees this slot in
        // its drain or we see its cancellation here
        if generation.is_cancelled() {
            return None;
        }
        Some(TaskPoolRunner { slot, generation })
    }

    /// Claim up to `count` free slots without waiting and run each
    ///
    /// Returns how many were started.
    pub fn prime(&self, count: usize) -> PoolResult<usize> {
        let mut started = 0;
        while started < count {
            match self.try_next() {
                Some(runner) => {
                    runner.run()?;
                    started += 1;
                }
                None => break,
            }
        }
        tp_debug!("{}: primed {} of {} slots", self.shared.options.name, started, count);
        Ok(started)
    }

    /// Cancel all outstanding work and start a fresh generation
    ///
    /// No task body starts after this is called, and it does not return
    /// until every claimed slot has been released. Concurrent resets are
    /// serialised.
    pub fn reset(&self) {
        let shared = &self.shared;
        let _guard = shared.reset_lock.lock().unwrap_or_else(|p| p.into_inner());

        shared.active_waiters.fetch_add(RESET_SENTINEL, Ordering::SeqCst);

        let old = self.current_generation();
        tp_debug!(
            "{}: reset generation {} ({} active)",
            shared.options.name,
            old.id,
            shared.active_workers.load(Ordering::Relaxed)
        );
        old.source.cancel();

        let mut spin = SpinWait::new();
        while shared.active_workers.load(Ordering::SeqCst) > 0 {
            spin.spin_once();
        }

        if old.escalation.disarm() == EscalationState::Fired {
            tp_info!(
                "{}: generation {} drained after forced abort",
                shared.options.name,
                old.id
            );
        }

        let fresh = Generation::new(old.id + 1, &shared.options);
        *shared.generation.write().unwrap_or_else(|p| p.into_inner()) = fresh;

        shared.active_waiters.fetch_sub(RESET_SENTINEL, Ordering::SeqCst);
    }

    pub(crate) fn current_generation(&self) -> Arc<Generation> {
        Arc::clone(&self.shared.generation.read().unwrap_or_else(|p| p.into_inner()))
    }

    /// Cancellation token of the current generation
    pub fn token(&self) -> CancellationToken {
        self.current_generation().token.clone()
    }

    /// Abort token of the current generation
    ///
    /// Fires `grace_period` after the generation is cancelled if work is
    /// still running. Bodies stuck in blocking calls can consult it to
    /// give up.
    pub fn abort_token(&self) -> CancellationToken {
        self.current_generation().abort.clone()
    }

    /// Current generation number, starting at 0
    pub fn generation(&self) -> u64 {
        self.current_generation().id
    }

    /// Slots currently claimed
    pub fn active_workers(&self) -> usize {
        self.shared.active_workers.load(Ordering::SeqCst)
    }

    /// Callers currently waiting in `next()`
    pub fn active_waiters(&self) -> usize {
        self.shared.active_waiters.load(Ordering::SeqCst) & (RESET_SENTINEL - 1)
    }

    /// True while `reset()` is draining
    pub fn is_resetting(&self) -> bool {
        self.shared.active_waiters.load(Ordering::SeqCst) >= RESET_SENTINEL
    }

    pub fn options(&self) -> &TaskPoolOptions {
        &self.shared.options
    }

    pub fn downgrade(&self) -> WeakTaskPool {
        WeakTaskPool {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("name", &self.shared.options.name)
            .field("generation", &self.generation())
            .field("active_workers", &self.active_workers())
            .field("active_waiters", &self.active_waiters())
            .finish()
    }
}

/// A claimed worker slot; released on drop
struct WorkerSlot {
    shared: Arc<PoolShared>,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.shared.active_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Work {
    /// The pool's own body
    Pool,
    /// A one-off closure occupying the slot
    Adhoc(Box<dyn FnOnce(&CancellationToken) + Send + 'static>),
}

/// A claimed slot, ready to run
///
/// Dropping it without calling `run()` releases the slot.
#[must_use = "dropping a runner without running it just releases its slot"]
pub struct TaskPoolRunner {
    slot: WorkerSlot,
    generation: Arc<Generation>,
}

impl TaskPoolRunner {
    /// Schedule the pool's body on the executor
    ///
    /// On `Err` the execution was not scheduled and the slot is released.
    pub fn run(self) -> PoolResult<()> {
        self.dispatch(Work::Pool)
    }

    /// Schedule a one-off closure in this slot instead of the pool's body
    ///
    /// The closure counts against the pool's capacity like any other
    /// execution but does not trigger scavenging renewal.
    pub fn run_with<F>(self, f: F) -> PoolResult<()>
    where
        F: FnOnce(&CancellationToken) + Send + 'static,
    {
        self.dispatch(Work::Adhoc(Box::new(f)))
    }

    /// Token of the generation this slot belongs to
    pub fn token(&self) -> CancellationToken {
        self.generation.token.clone()
    }

    /// Generation this slot belongs to
    pub fn generation(&self) -> u64 {
        self.generation.id
    }

    fn dispatch(self, work: Work) -> PoolResult<()> {
        let executor = Arc::clone(&self.slot.shared.executor);
        let scheduled = Instant::now();
        let TaskPoolRunner { slot, generation } = self;
        executor.execute(Box::new(move || exec(slot, generation, work, scheduled)))
    }
}

/// Run one execution in its slot, then release the slot
fn exec(slot: WorkerSlot, generation: Arc<Generation>, work: Work, scheduled: Instant) {
    let shared = Arc::clone(&slot.shared);
    let options = &shared.options;
    let renew = matches!(work, Work::Pool) && shared.renewal == Renewal::Scavenge;

    if generation.is_cancelled() || generation.abort.is_cancelled() {
        tp_trace!("{}: generation {} cancelled, skipping", options.name, generation.id);
        return;
    }

    let expired = options.timeout.is_some_and(|t| scheduled.elapsed() > t);
    if expired {
        tp_debug!(
            "{}: execution waited {:?}, past start deadline, skipping",
            options.name,
            scheduled.elapsed()
        );
    } else {
        let result = match work {
            Work::Pool => panic::catch_unwind(AssertUnwindSafe(|| (shared.run)(&generation.token))),
            Work::Adhoc(f) => panic::catch_unwind(AssertUnwindSafe(|| f(&generation.token))),
        };
        if let Err(payload) = result {
            tp_warn!("{}: task body panicked: {}", options.name, panic_message(&payload));
        }
    }

    drop(slot);

    if renew {
        scavenging::renew(&TaskPool { shared }, &generation);
    }
}
