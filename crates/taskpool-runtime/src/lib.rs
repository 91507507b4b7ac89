//! # taskpool-runtime
//!
//! Runtime implementation for the taskpool dispatch core.
//!
//! This crate provides:
//! - Pool options with environment overrides
//! - Idle-thread parking (futex on Linux, condvar elsewhere)
//! - An elastic thread executor
//! - Cancellation escalation (cooperative cancel, then forced abort)
//! - `TaskPool` / `TaskPoolRunner` worker-slot pools
//! - Self-renewing scavenging pools
//! - The `Handoff<T>` listener-to-handler queue

pub mod config;
pub mod parking;
pub mod executor;
pub mod escalation;
pub mod pool;
pub mod scavenging;
pub mod handoff;

// Re-exports
pub use config::{ServerTaskPoolOptions, TaskPoolOptions};
pub use executor::{ElasticExecutor, Executor, Job};
pub use escalation::{Escalation, EscalationState};
pub use pool::{TaskPool, TaskPoolRunner, WeakTaskPool};
pub use scavenging::{scavenging_pool, scavenging_pool_with_executor};
pub use handoff::{Admission, Handoff, HandoffStats, ServerHandler};
pub use parking::{new_parking, Parking};
