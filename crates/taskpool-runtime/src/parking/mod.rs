//! Idle-thread parking
//!
//! Executor threads with nothing to run park here instead of spinning.
//! Parking is epoch based so a wake that lands between "queue looked
//! empty" and "go to sleep" is never lost:
//!
//! ```text
//! let epoch = parking.epoch();   // 1. snapshot
//! if let Some(job) = queue.pop() // 2. re-check for work
//!     { ... }
//! parking.park(epoch, timeout);  // 3. sleeps only if no unpark since 1.
//! ```
//!
//! Every unpark bumps the epoch, so step 3 returns at once if a producer
//! pushed work after step 1.

use std::time::Duration;

/// Platform-specific parking primitive
pub trait Parking: Send + Sync {
    /// Snapshot the current wake epoch
    fn epoch(&self) -> u32;

    /// Sleep until the epoch moves past `epoch` or `timeout` elapses
    ///
    /// Returns `true` if woken by an unpark (the epoch changed), `false`
    /// on timeout. Callers re-check for work either way.
    fn park(&self, epoch: u32, timeout: Option<Duration>) -> bool;

    /// Advance the epoch and wake at most one parked thread
    fn unpark_one(&self);

    /// Advance the epoch and wake every parked thread
    fn unpark_all(&self);

    /// Number of currently parked threads (hint, may be stale)
    fn parked_count(&self) -> usize;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParking as PlatformParking;
    } else {
        mod fallback;
        pub use fallback::CondvarParking as PlatformParking;
    }
}

/// Create a new platform-appropriate parking instance
pub fn new_parking() -> Box<dyn Parking> {
    Box::new(PlatformParking::new())
}
