//! # taskpool-core
//!
//! Core types for the taskpool dispatch core.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Thread management, parking and the pools themselves live in
//! `taskpool-runtime`.
//!
//! ## Modules
//!
//! - `cancel` - Cancellation source/token with ordered callbacks
//! - `error` - Error types
//! - `spin` - Adaptive spin-wait used at every cooperative suspension point
//! - `log` - Leveled stderr logging macros
//! - `env` - Environment variable utilities

pub mod cancel;
pub mod error;
pub mod spin;
pub mod log;
pub mod env;

// Re-exports for convenience
pub use cancel::{CancellationSource, CancellationToken};
pub use error::{PoolError, PoolResult};
pub use spin::SpinWait;
pub use env::{env_get, env_get_bool, env_get_duration_ms};

/// Shared constants
pub mod constants {
    use std::time::Duration;

    /// Default bound on callers concurrently waiting for a worker slot
    pub const DEFAULT_MAX_WAITING_REQUESTS: usize = 32767;

    /// Default handoff admission limit
    pub const DEFAULT_MAX_QUEUE_SIZE: usize = 32767;

    /// Delay between cooperative cancellation and the forced abort
    pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

    /// Idle lifetime of an executor thread
    pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(10);

    /// Thread name prefix
    pub const DEFAULT_POOL_NAME: &str = "taskpool";

    /// Logical CPU count, falling back to 4 when it cannot be queried
    pub fn logical_cpus() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}
