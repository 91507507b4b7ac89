//! Compiled-in defaults for pool configuration
//!
//! Environment variables override these at `from_env()` time.

use taskpool_core::constants;

/// Max concurrently running task bodies per pool (0 = logical CPU count)
pub const MAX_ACTIVE_WORKERS: usize = 0;

/// Max callers concurrently waiting in `TaskPool::next()`
pub const MAX_WAITING_REQUESTS: usize = constants::DEFAULT_MAX_WAITING_REQUESTS;

/// Start deadline for scheduled executions in milliseconds (0 = infinite)
pub const TIMEOUT_MS: u64 = 0;

/// Delay between cooperative cancellation and forced abort
pub const GRACE_PERIOD_MS: u64 = constants::DEFAULT_GRACE_PERIOD.as_millis() as u64;

/// Idle executor thread lifetime
pub const KEEP_ALIVE_MS: u64 = constants::DEFAULT_KEEP_ALIVE.as_millis() as u64;

/// Listener workers in the dual-pool server
pub const MAX_ACTIVE_LISTENER_WORKERS: usize = 1;

/// Handler workers in the dual-pool server (0 = logical CPU count)
pub const MAX_ACTIVE_HANDLER_WORKERS: usize = 0;

/// Max callers waiting for a listener slot
pub const MAX_WAITING_ACCEPTS: usize = constants::DEFAULT_MAX_WAITING_REQUESTS;

/// Handoff admission limit
pub const MAX_QUEUE_SIZE: usize = constants::DEFAULT_MAX_QUEUE_SIZE;

/// Resolve a worker count where 0 means "one per logical CPU"
#[inline]
pub fn resolve_workers(n: usize) -> usize {
    if n == 0 {
        constants::logical_cpus()
    } else {
        n
    }
}
