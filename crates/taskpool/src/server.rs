//! Listener/handler server pipelines
//!
//! Both shapes move contexts from a producer to a consumer through one
//! `Handoff<T>`:
//!
//! - `SingleServerTaskPool`: one scavenging pool. Each loop listens once,
//!   then hands the item to another free slot of the same pool, or
//!   handles it inline when none is free. Accepting and processing share
//!   one concurrency budget.
//! - `DualServerTaskPool`: a scavenging listener pool feeding a fixed
//!   fleet of handler loops. Accepting keeps going while handlers are
//!   saturated, up to the handoff's admission limit.
//!
//! ## Lifecycle
//!
//! ```text
//!   Created ──start──▶ Starting ──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!                         │                              │            │
//!                         ▼                              ▼            │
//!                   FailedStarting                FailedStopping      │
//!                                                                     │
//!   Stopped ──start──▶ Starting ...  ◀────────────────────────────────┘
//! ```
//!
//! Transitions are serialised; `state()` never blocks.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use taskpool_core::cancel::CancellationToken;
use taskpool_core::error::{PoolError, PoolResult};
use taskpool_core::{tp_error, tp_info, tp_warn};
use taskpool_runtime::config::ServerTaskPoolOptions;
use taskpool_runtime::executor::Executor;
use taskpool_runtime::handoff::{Admission, Handoff, HandoffStats, ServerHandler};
use taskpool_runtime::pool::{TaskPool, WeakTaskPool};
use taskpool_runtime::scavenging::{scavenging_pool, scavenging_pool_with_executor};

/// Server lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Created = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
    FailedStarting = 5,
    FailedStopping = 6,
}

impl ServerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ServerState::Created,
            1 => ServerState::Starting,
            2 => ServerState::Running,
            3 => ServerState::Stopping,
            4 => ServerState::Stopped,
            5 => ServerState::FailedStarting,
            _ => ServerState::FailedStopping,
        }
    }

    pub fn is_failed(self) -> bool {
        matches!(self, ServerState::FailedStarting | ServerState::FailedStopping)
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerState::Created => "created",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Stopped => "stopped",
            ServerState::FailedStarting => "failed-starting",
            ServerState::FailedStopping => "failed-stopping",
        };
        f.write_str(s)
    }
}

/// A startable, stoppable pipeline
pub trait ServerTaskPool: Send + Sync {
    /// Launch the pipeline
    ///
    /// Allowed from `Created` and `Stopped`; anything else is
    /// `PoolError::InvalidState`.
    fn start(&self) -> PoolResult<()>;

    /// Cancel all work and wait for it to drain
    ///
    /// A no-op from `Created` and `Stopped`.
    fn stop(&self) -> PoolResult<()>;

    fn state(&self) -> ServerState;
}

/// State plus the lock that serialises transitions
struct Lifecycle {
    state: AtomicU8,
    transition: Mutex<()>,
    name: String,
}

impl Lifecycle {
    fn new(name: String) -> Self {
        Self {
            state: AtomicU8::new(ServerState::Created as u8),
            transition: Mutex::new(()),
            name,
        }
    }

    fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: ServerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn start(&self, launch: impl FnOnce() -> PoolResult<()>) -> PoolResult<()> {
        let _guard = self.transition.lock().unwrap_or_else(|p| p.into_inner());
        match self.state() {
            ServerState::Created | ServerState::Stopped => {}
            state => {
                tp_warn!("{}: start refused in state {}", self.name, state);
                return Err(PoolError::InvalidState("start requires created or stopped"));
            }
        }

        self.set(ServerState::Starting);
        match run_transition(launch) {
            Ok(()) => {
                self.set(ServerState::Running);
                tp_info!("{}: running", self.name);
                Ok(())
            }
            Err(e) => {
                self.set(ServerState::FailedStarting);
                tp_error!("{}: start failed: {}", self.name, e);
                Err(e)
            }
        }
    }

    fn stop(&self, shutdown: impl FnOnce() -> PoolResult<()>) -> PoolResult<()> {
        let _guard = self.transition.lock().unwrap_or_else(|p| p.into_inner());
        match self.state() {
            ServerState::Created | ServerState::Stopped => return Ok(()),
            _ => {}
        }

        self.set(ServerState::Stopping);
        match run_transition(shutdown) {
            Ok(()) => {
                self.set(ServerState::Stopped);
                tp_info!("{}: stopped", self.name);
                Ok(())
            }
            Err(e) => {
                self.set(ServerState::FailedStopping);
                tp_error!("{}: stop failed: {}", self.name, e);
                Err(e)
            }
        }
    }
}

fn run_transition(f: impl FnOnce() -> PoolResult<()>) -> PoolResult<()> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or(Err(PoolError::Panicked))
}

// ============================================================================
// Single pool
// ============================================================================

/// Listener and handler steps sharing one pool
pub struct SingleServerTaskPool<T: Send + 'static> {
    lifecycle: Lifecycle,
    pool: TaskPool,
    handoff: Arc<Handoff<T>>,
}

impl<T: Send + 'static> SingleServerTaskPool<T> {
    /// Build around an existing handoff
    pub fn new(handoff: Handoff<T>, options: ServerTaskPoolOptions) -> PoolResult<Self> {
        Self::build(handoff, options, None)
    }

    /// Build from a producer and a consumer closure
    pub fn from_fns<L, H>(listener: L, handler: H, options: ServerTaskPoolOptions) -> PoolResult<Self>
    where
        L: Fn() -> Option<T> + Send + Sync + 'static,
        H: Fn(T) + Send + Sync + 'static,
    {
        let handoff = Handoff::new(listener, handler, options.max_queue_size);
        Self::build(handoff, options, None)
    }

    /// Build from a `ServerHandler`
    pub fn from_handler<S>(handler: Arc<S>, options: ServerTaskPoolOptions) -> PoolResult<Self>
    where
        S: ServerHandler<T>,
    {
        let handoff = Handoff::from_source(handler, options.max_queue_size);
        Self::build(handoff, options, None)
    }

    /// Build on a caller-supplied executor
    pub fn with_executor(
        handoff: Handoff<T>,
        options: ServerTaskPoolOptions,
        executor: Arc<dyn Executor>,
    ) -> PoolResult<Self> {
        Self::build(handoff, options, Some(executor))
    }

    fn build(
        handoff: Handoff<T>,
        options: ServerTaskPoolOptions,
        executor: Option<Arc<dyn Executor>>,
    ) -> PoolResult<Self> {
        options.validate()?;
        let handoff = Arc::new(handoff);

        // The action dispatches into its own pool, which does not exist
        // until the action has been handed over
        let this_pool: Arc<OnceLock<WeakTaskPool>> = Arc::new(OnceLock::new());
        let action = {
            let handoff = Arc::clone(&handoff);
            let this_pool = Arc::clone(&this_pool);
            move |_: &CancellationToken| listen_then_dispatch(&handoff, &this_pool)
        };

        let mut pool_options = options.handler_options();
        pool_options.name = options.name.clone();
        let pool = match executor {
            Some(executor) => scavenging_pool_with_executor(action, pool_options, executor)?,
            None => scavenging_pool(action, pool_options)?,
        };
        // Freshly created, so never already set
        let _ = this_pool.set(pool.downgrade());

        Ok(Self {
            lifecycle: Lifecycle::new(options.name),
            pool,
            handoff,
        })
    }

    pub fn handoff(&self) -> &Handoff<T> {
        &self.handoff
    }

    pub fn stats(&self) -> HandoffStats {
        self.handoff.stats()
    }

    pub fn pool(&self) -> &TaskPool {
        &self.pool
    }
}

/// One iteration of the single-pool loop
fn listen_then_dispatch<T: Send + 'static>(
    handoff: &Arc<Handoff<T>>,
    this_pool: &OnceLock<WeakTaskPool>,
) {
    match handoff.listen() {
        Admission::Enqueued => {}
        // Nothing new: work off anything left queued by an earlier generation
        Admission::Empty | Admission::Failed => {
            handoff.try_handle();
            return;
        }
        Admission::Rejected => {
            if !handoff.try_handle() {
                thread::yield_now();
            }
            return;
        }
    }

    let runner = this_pool
        .get()
        .and_then(WeakTaskPool::upgrade)
        .and_then(|pool| pool.try_next());

    match runner {
        Some(runner) => {
            let deferred = Arc::clone(handoff);
            if let Err(e) = runner.run_with(move |_| {
                deferred.try_handle();
            }) {
                tp_warn!("handler dispatch failed ({}), handling inline", e);
                handoff.try_handle();
            }
        }
        None => {
            handoff.try_handle();
        }
    }
}

impl<T: Send + 'static> ServerTaskPool for SingleServerTaskPool<T> {
    fn start(&self) -> PoolResult<()> {
        self.lifecycle.start(|| {
            let capacity = self.pool.options().max_active_workers;
            self.pool.prime(capacity).map(drop)
        })
    }

    fn stop(&self) -> PoolResult<()> {
        self.lifecycle.stop(|| {
            self.pool.reset();
            Ok(())
        })
    }

    fn state(&self) -> ServerState {
        self.lifecycle.state()
    }
}

impl<T: Send + 'static> Drop for SingleServerTaskPool<T> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tp_warn!("{}: stop on drop failed: {}", self.lifecycle.name, e);
        }
    }
}

// ============================================================================
// Dual pool
// ============================================================================

/// Separate listener and handler pools sharing one handoff
pub struct DualServerTaskPool<T: Send + 'static> {
    lifecycle: Lifecycle,
    listener_pool: TaskPool,
    handler_pool: TaskPool,
    handoff: Arc<Handoff<T>>,
    options: ServerTaskPoolOptions,
}

impl<T: Send + 'static> DualServerTaskPool<T> {
    /// Build around an existing handoff
    pub fn new(handoff: Handoff<T>, options: ServerTaskPoolOptions) -> PoolResult<Self> {
        Self::build(handoff, options, None)
    }

    /// Build from a producer and a consumer closure
    pub fn from_fns<L, H>(listener: L, handler: H, options: ServerTaskPoolOptions) -> PoolResult<Self>
    where
        L: Fn() -> Option<T> + Send + Sync + 'static,
        H: Fn(T) + Send + Sync + 'static,
    {
        let handoff = Handoff::new(listener, handler, options.max_queue_size);
        Self::build(handoff, options, None)
    }

    /// Build from a `ServerHandler`
    pub fn from_handler<S>(handler: Arc<S>, options: ServerTaskPoolOptions) -> PoolResult<Self>
    where
        S: ServerHandler<T>,
    {
        let handoff = Handoff::from_source(handler, options.max_queue_size);
        Self::build(handoff, options, None)
    }

    /// Build both pools on a caller-supplied executor
    pub fn with_executor(
        handoff: Handoff<T>,
        options: ServerTaskPoolOptions,
        executor: Arc<dyn Executor>,
    ) -> PoolResult<Self> {
        Self::build(handoff, options, Some(executor))
    }

    fn build(
        handoff: Handoff<T>,
        options: ServerTaskPoolOptions,
        executor: Option<Arc<dyn Executor>>,
    ) -> PoolResult<Self> {
        options.validate()?;
        let handoff = Arc::new(handoff);

        let listen = {
            let handoff = Arc::clone(&handoff);
            move |_: &CancellationToken| {
                if handoff.listen() == Admission::Rejected {
                    thread::yield_now();
                }
            }
        };
        let handle = {
            let handoff = Arc::clone(&handoff);
            move |token: &CancellationToken| {
                while !token.is_cancelled() {
                    handoff.handle(token);
                }
            }
        };

        let (listener_pool, handler_pool) = match executor {
            Some(executor) => (
                scavenging_pool_with_executor(listen, options.listener_options(), Arc::clone(&executor))?,
                TaskPool::with_executor(handle, options.handler_options(), executor)?,
            ),
            None => (
                scavenging_pool(listen, options.listener_options())?,
                TaskPool::new(handle, options.handler_options())?,
            ),
        };

        Ok(Self {
            lifecycle: Lifecycle::new(options.name.clone()),
            listener_pool,
            handler_pool,
            handoff,
            options,
        })
    }

    pub fn handoff(&self) -> &Handoff<T> {
        &self.handoff
    }

    pub fn stats(&self) -> HandoffStats {
        self.handoff.stats()
    }

    pub fn listener_pool(&self) -> &TaskPool {
        &self.listener_pool
    }

    pub fn handler_pool(&self) -> &TaskPool {
        &self.handler_pool
    }
}

impl<T: Send + 'static> ServerTaskPool for DualServerTaskPool<T> {
    fn start(&self) -> PoolResult<()> {
        self.lifecycle.start(|| {
            let handlers = self.handler_pool.prime(self.options.max_active_handler_workers)?;
            let listeners = self.listener_pool.prime(self.options.max_active_listener_workers)?;
            tp_info!(
                "{}: {} listener loops, {} handler loops",
                self.options.name,
                listeners,
                handlers
            );
            Ok(())
        })
    }

    fn stop(&self) -> PoolResult<()> {
        self.lifecycle.stop(|| {
            self.listener_pool.reset();
            self.handler_pool.reset();
            Ok(())
        })
    }

    fn state(&self) -> ServerState {
        self.lifecycle.state()
    }
}

impl<T: Send + 'static> Drop for DualServerTaskPool<T> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tp_warn!("{}: stop on drop failed: {}", self.lifecycle.name, e);
        }
    }
}
