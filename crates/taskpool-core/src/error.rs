//! Error types for the taskpool dispatch core

use core::fmt;

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur in pool and server operations
///
/// Task-body failures never show up here: they are caught and logged at
/// the innermost execution wrapper. Only lifecycle and configuration
/// problems propagate to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Operation was cancelled via CancellationToken
    Cancelled,

    /// Admission was declined (pool or queue at capacity)
    Rejected,

    /// Options failed validation
    InvalidConfig(&'static str),

    /// Lifecycle operation not allowed in the current state
    InvalidState(&'static str),

    /// Failed to spawn an executor thread
    SpawnFailed,

    /// Executor no longer accepts jobs
    ExecutorShutdown,

    /// A lifecycle transition panicked
    Panicked,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Cancelled => write!(f, "operation cancelled"),
            PoolError::Rejected => write!(f, "admission rejected"),
            PoolError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            PoolError::InvalidState(state) => write!(f, "invalid state: {}", state),
            PoolError::SpawnFailed => write!(f, "failed to spawn executor thread"),
            PoolError::ExecutorShutdown => write!(f, "executor is shut down"),
            PoolError::Panicked => write!(f, "transition panicked"),
        }
    }
}

impl std::error::Error for PoolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", PoolError::Cancelled), "operation cancelled");
        assert_eq!(
            format!("{}", PoolError::InvalidConfig("max_active_workers must be at least 1")),
            "invalid configuration: max_active_workers must be at least 1"
        );
        assert_eq!(format!("{}", PoolError::InvalidState("Running")), "invalid state: Running");
    }

    #[test]
    fn test_error_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(PoolError::SpawnFailed);
        assert_eq!(err.to_string(), "failed to spawn executor thread");
    }
}
