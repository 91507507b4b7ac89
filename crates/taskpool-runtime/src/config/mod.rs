//! Pool configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env()` only)
//! 3. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use taskpool_runtime::config::TaskPoolOptions;
//!
//! let options = TaskPoolOptions::from_env()
//!     .max_active_workers(8)
//!     .timeout(Some(Duration::from_secs(30)));
//! ```

pub mod defaults;

use std::time::Duration;

use taskpool_core::constants::DEFAULT_POOL_NAME;
use taskpool_core::env::{env_get, env_get_duration_ms};
use taskpool_core::error::{PoolError, PoolResult};

fn timeout_from_ms(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

/// Options for a single `TaskPool`
///
/// Copied into the pool at construction; later changes to the caller's
/// copy have no effect on a running pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPoolOptions {
    /// Max task bodies executing at once
    pub max_active_workers: usize,
    /// Max callers waiting for a slot; more are rejected
    pub max_waiting_requests: usize,
    /// Start deadline for a scheduled execution (`None` = infinite)
    pub timeout: Option<Duration>,
    /// Delay between cooperative cancellation and forced abort
    pub grace_period: Duration,
    /// Idle lifetime of executor threads
    pub keep_alive: Duration,
    /// Thread name prefix
    pub name: String,
}

impl Default for TaskPoolOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskPoolOptions {
    /// Library defaults, no environment overrides
    pub fn new() -> Self {
        Self {
            max_active_workers: defaults::resolve_workers(defaults::MAX_ACTIVE_WORKERS),
            max_waiting_requests: defaults::MAX_WAITING_REQUESTS,
            timeout: timeout_from_ms(defaults::TIMEOUT_MS),
            grace_period: Duration::from_millis(defaults::GRACE_PERIOD_MS),
            keep_alive: Duration::from_millis(defaults::KEEP_ALIVE_MS),
            name: DEFAULT_POOL_NAME.to_string(),
        }
    }

    /// Library defaults with environment overrides
    ///
    /// Environment variables (all optional):
    /// - `TASKPOOL_MAX_ACTIVE_WORKERS` - Concurrent task bodies (0 = CPU count)
    /// - `TASKPOOL_MAX_WAITING_REQUESTS` - Waiting callers before rejection
    /// - `TASKPOOL_TIMEOUT_MS` - Start deadline (0/inf = none)
    /// - `TASKPOOL_GRACE_PERIOD_MS` - Escalation delay
    /// - `TASKPOOL_KEEP_ALIVE_MS` - Idle executor thread lifetime
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            max_active_workers: defaults::resolve_workers(env_get(
                "TASKPOOL_MAX_ACTIVE_WORKERS",
                defaults::MAX_ACTIVE_WORKERS,
            )),
            max_waiting_requests: env_get(
                "TASKPOOL_MAX_WAITING_REQUESTS",
                base.max_waiting_requests,
            ),
            timeout: env_get_duration_ms("TASKPOOL_TIMEOUT_MS", base.timeout),
            grace_period: Duration::from_millis(env_get(
                "TASKPOOL_GRACE_PERIOD_MS",
                defaults::GRACE_PERIOD_MS,
            )),
            keep_alive: Duration::from_millis(env_get(
                "TASKPOOL_KEEP_ALIVE_MS",
                defaults::KEEP_ALIVE_MS,
            )),
            name: base.name,
        }
    }

    // Builder methods

    pub fn max_active_workers(mut self, n: usize) -> Self {
        self.max_active_workers = n;
        self
    }

    pub fn max_waiting_requests(mut self, n: usize) -> Self {
        self.max_waiting_requests = n;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn grace_period(mut self, d: Duration) -> Self {
        self.grace_period = d;
        self
    }

    pub fn keep_alive(mut self, d: Duration) -> Self {
        self.keep_alive = d;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_active_workers == 0 {
            return Err(PoolError::InvalidConfig("max_active_workers must be at least 1"));
        }
        if self.max_waiting_requests == 0 {
            return Err(PoolError::InvalidConfig("max_waiting_requests must be at least 1"));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(PoolError::InvalidConfig("timeout must be positive or None"));
        }
        if self.name.is_empty() {
            return Err(PoolError::InvalidConfig("name must not be empty"));
        }
        Ok(())
    }
}

/// Options for the server pipelines
///
/// The single-pool server uses `handler_options()` for its one pool; the
/// dual-pool server uses both `listener_options()` and `handler_options()`.
/// `max_queue_size` is the handoff admission limit in both shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTaskPoolOptions {
    /// Concurrent listener (accept) workers
    pub max_active_listener_workers: usize,
    /// Concurrent handler workers
    pub max_active_handler_workers: usize,
    /// Callers waiting for a listener slot before rejection
    pub max_waiting_accepts: usize,
    /// Callers waiting for a handler slot before rejection
    pub max_waiting_requests: usize,
    /// Handoff admission limit
    pub max_queue_size: usize,
    /// Start deadline for a scheduled execution (`None` = infinite)
    pub timeout: Option<Duration>,
    /// Delay between cooperative cancellation and forced abort
    pub grace_period: Duration,
    /// Idle lifetime of executor threads
    pub keep_alive: Duration,
    /// Thread name prefix
    pub name: String,
}

impl Default for ServerTaskPoolOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerTaskPoolOptions {
    /// Library defaults, no environment overrides
    pub fn new() -> Self {
        Self {
            max_active_listener_workers: defaults::resolve_workers(
                defaults::MAX_ACTIVE_LISTENER_WORKERS,
            ),
            max_active_handler_workers: defaults::resolve_workers(
                defaults::MAX_ACTIVE_HANDLER_WORKERS,
            ),
            max_waiting_accepts: defaults::MAX_WAITING_ACCEPTS,
            max_waiting_requests: defaults::MAX_WAITING_REQUESTS,
            max_queue_size: defaults::MAX_QUEUE_SIZE,
            timeout: timeout_from_ms(defaults::TIMEOUT_MS),
            grace_period: Duration::from_millis(defaults::GRACE_PERIOD_MS),
            keep_alive: Duration::from_millis(defaults::KEEP_ALIVE_MS),
            name: DEFAULT_POOL_NAME.to_string(),
        }
    }

    /// Library defaults with environment overrides
    ///
    /// Reads the `TaskPoolOptions::from_env()` variables plus:
    /// - `TASKPOOL_MAX_ACTIVE_LISTENER_WORKERS`
    /// - `TASKPOOL_MAX_ACTIVE_HANDLER_WORKERS` (0 = CPU count)
    /// - `TASKPOOL_MAX_WAITING_ACCEPTS`
    /// - `TASKPOOL_MAX_QUEUE_SIZE`
    pub fn from_env() -> Self {
        let pool = TaskPoolOptions::from_env();
        Self {
            max_active_listener_workers: defaults::resolve_workers(env_get(
                "TASKPOOL_MAX_ACTIVE_LISTENER_WORKERS",
                defaults::MAX_ACTIVE_LISTENER_WORKERS,
            )),
            max_active_handler_workers: defaults::resolve_workers(env_get(
                "TASKPOOL_MAX_ACTIVE_HANDLER_WORKERS",
                defaults::MAX_ACTIVE_HANDLER_WORKERS,
            )),
            max_waiting_accepts: env_get(
                "TASKPOOL_MAX_WAITING_ACCEPTS",
                defaults::MAX_WAITING_ACCEPTS,
            ),
            max_waiting_requests: pool.max_waiting_requests,
            max_queue_size: env_get("TASKPOOL_MAX_QUEUE_SIZE", defaults::MAX_QUEUE_SIZE),
            timeout: pool.timeout,
            grace_period: pool.grace_period,
            keep_alive: pool.keep_alive,
            name: pool.name,
        }
    }

    // Builder methods

    pub fn max_active_listener_workers(mut self, n: usize) -> Self {
        self.max_active_listener_workers = n;
        self
    }

    pub fn max_active_handler_workers(mut self, n: usize) -> Self {
        self.max_active_handler_workers = n;
        self
    }

    pub fn max_waiting_accepts(mut self, n: usize) -> Self {
        self.max_waiting_accepts = n;
        self
    }

    pub fn max_waiting_requests(mut self, n: usize) -> Self {
        self.max_waiting_requests = n;
        self
    }

    pub fn max_queue_size(mut self, n: usize) -> Self {
        self.max_queue_size = n;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn grace_period(mut self, d: Duration) -> Self {
        self.grace_period = d;
        self
    }

    pub fn keep_alive(mut self, d: Duration) -> Self {
        self.keep_alive = d;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Options for the listener stage
    pub fn listener_options(&self) -> TaskPoolOptions {
        TaskPoolOptions {
            max_active_workers: self.max_active_listener_workers,
            max_waiting_requests: self.max_waiting_accepts,
            timeout: self.timeout,
            grace_period: self.grace_period,
            keep_alive: self.keep_alive,
            name: format!("{}-listen", self.name),
        }
    }

    /// Options for the handler stage (also the single-pool server's pool)
    pub fn handler_options(&self) -> TaskPoolOptions {
        TaskPoolOptions {
            max_active_workers: self.max_active_handler_workers,
            max_waiting_requests: self.max_waiting_requests,
            timeout: self.timeout,
            grace_period: self.grace_period,
            keep_alive: self.keep_alive,
            name: format!("{}-handle", self.name),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_active_listener_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "max_active_listener_workers must be at least 1",
            ));
        }
        if self.max_active_handler_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "max_active_handler_workers must be at least 1",
            ));
        }
        if self.max_waiting_accepts == 0 {
            return Err(PoolError::InvalidConfig("max_waiting_accepts must be at least 1"));
        }
        if self.max_queue_size == 0 {
            return Err(PoolError::InvalidConfig("max_queue_size must be at least 1"));
        }
        self.listener_options().validate()?;
        self.handler_options().validate()
    }
}
