//! # taskpool - bounded-concurrency task dispatch
//!
//! Worker-slot pools and listener/handler pipelines with cooperative,
//! generation-based cancellation.
//!
//! ## Quick Start
//!
//! ```ignore
//! use taskpool::{DualServerTaskPool, ServerTaskPool, ServerTaskPoolOptions};
//!
//! let server = DualServerTaskPool::from_fns(
//!     || accept_with_timeout(&listener),   // Option<TcpStream>
//!     |stream| serve(stream),
//!     ServerTaskPoolOptions::from_env().name("echo"),
//! )?;
//!
//! server.start()?;
//! // ...
//! server.stop()?;   // returns once every handler has finished
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 ServerTaskPool (start/stop)                  │
//! │        SingleServerTaskPool        DualServerTaskPool        │
//! └──────────────────────────────────────────────────────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌──────────────────────────┐    ┌──────────────────────────────┐
//! │  TaskPool / scavenging   │◀──▶│  Handoff<T> (listen/handle)  │
//! │  slots, generations      │    │  SegQueue + live-count       │
//! └──────────────────────────┘    └──────────────────────────────┘
//!                │
//!                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │       Executor (ElasticExecutor: cached named threads)       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Cancellation
//!
//! Every pool has a current generation with its own `CancellationToken`.
//! `TaskPool::reset()` (and so `ServerTaskPool::stop()`) cancels it, waits
//! for all claimed slots to be released and starts a new generation. Task
//! bodies are expected to check their token; if they are still running
//! `grace_period` after cancellation, the generation's abort token fires.

pub mod server;

// Re-export core types
pub use taskpool_core::{
    CancellationSource, CancellationToken, PoolError, PoolResult, SpinWait,
};
pub use taskpool_core::log::{init as init_logging, set_log_level, LogLevel};
pub use taskpool_core::{tp_debug, tp_error, tp_info, tp_println, tp_trace, tp_warn};

// Re-export runtime types
pub use taskpool_runtime::{
    Admission, ElasticExecutor, Executor, Handoff, HandoffStats, Job, ServerHandler,
    ServerTaskPoolOptions, TaskPool, TaskPoolOptions, TaskPoolRunner, WeakTaskPool,
};

pub use server::{DualServerTaskPool, ServerState, ServerTaskPool, SingleServerTaskPool};

/// Create a pool that runs `run` once per `TaskPoolRunner::run()`
pub fn task_pool<F>(run: F, options: TaskPoolOptions) -> PoolResult<TaskPool>
where
    F: Fn(&CancellationToken) + Send + Sync + 'static,
{
    TaskPool::new(run, options)
}

/// Create a pool whose executions keep renewing themselves until reset
pub fn scavenging_pool<F>(action: F, options: TaskPoolOptions) -> PoolResult<TaskPool>
where
    F: Fn(&CancellationToken) + Send + Sync + 'static,
{
    taskpool_runtime::scavenging_pool(action, options)
}

/// Create a handoff from a producer and a consumer
pub fn handoff<T, L, H>(listener: L, handler: H, max_queue_size: usize) -> Handoff<T>
where
    T: Send + 'static,
    L: Fn() -> Option<T> + Send + Sync + 'static,
    H: Fn(T) + Send + Sync + 'static,
{
    Handoff::new(listener, handler, max_queue_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_task_pool_runs() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let pool = task_pool(
            move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            },
            TaskPoolOptions::new().max_active_workers(2),
        )
        .unwrap();

        for _ in 0..5 {
            pool.next().unwrap().run().unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) < 5 {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_handoff_fn() {
        let h = handoff(|| Some(3u8), |_| {}, 1);
        assert_eq!(h.listen(), Admission::Enqueued);
        assert_eq!(h.listen(), Admission::Rejected);
    }

    #[test]
    fn test_scavenging_pool_fn() {
        let pool = scavenging_pool(|_| std::thread::yield_now(), TaskPoolOptions::new().max_active_workers(1)).unwrap();
        assert_eq!(pool.prime(1).unwrap(), 1);
        pool.reset();
        assert_eq!(pool.active_workers(), 0);
    }
}
