//! Cooperative cancellation
//!
//! A `CancellationSource` owns a shared flag and an ordered list of
//! callbacks. Any number of `CancellationToken`s can observe the same
//! source. Cancellation is one-way: a pool that needs a fresh start
//! replaces its source instead of clearing it.
//!
//! Nothing here interrupts blocked code. Work that wants to stop promptly
//! must poll `is_cancelled()` (or `check()`) at its own checkpoints.

use core::sync::atomic::{AtomicBool, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::error::{PoolError, PoolResult};

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    /// Cancellation flag
    cancelled: AtomicBool,

    /// Callbacks still waiting for cancellation, in registration order
    callbacks: Mutex<Vec<Callback>>,
}

/// Owner side: the only way to request cancellation
pub struct CancellationSource {
    shared: Arc<Shared>,
}

impl CancellationSource {
    /// Create a new, not yet cancelled source
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Hand out a token observing this source
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            inner: TokenInner::Source(Arc::clone(&self.shared)),
        }
    }

    /// Request cancellation
    ///
    /// The first call flips the flag and runs every registered callback
    /// once, in registration order. A panicking callback is logged and
    /// skipped; the remaining callbacks still run. Later calls do nothing.
    pub fn cancel(&self) {
        if self.shared.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        let callbacks = {
            let mut guard = self
                .shared
                .callbacks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };

        for (index, callback) in callbacks.into_iter().enumerate() {
            if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                crate::tp_warn!("cancellation callback #{} panicked", index);
            }
        }
    }

    /// Check if cancellation was requested
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationSource")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Observer side of a `CancellationSource`
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct CancellationToken {
    inner: TokenInner,
}

#[derive(Clone)]
enum TokenInner {
    /// Backed by a source
    Source(Arc<Shared>),
    /// Never cancels
    Never,
}

impl CancellationToken {
    /// A token that can never be cancelled
    pub fn never() -> Self {
        Self {
            inner: TokenInner::Never,
        }
    }

    /// Check if cancellation was requested
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        match &self.inner {
            TokenInner::Source(shared) => shared.cancelled.load(Ordering::SeqCst),
            TokenInner::Never => false,
        }
    }

    /// Check if cancelled and return error if so
    ///
    /// ```ignore
    /// fn accept_loop(token: &CancellationToken) -> PoolResult<()> {
    ///     loop {
    ///         token.check()?;
    ///         // ... accept one connection ...
    ///     }
    /// }
    /// ```
    #[inline]
    pub fn check(&self) -> PoolResult<()> {
        if self.is_cancelled() {
            Err(PoolError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Register a callback to run on cancellation
    ///
    /// Returns `true` if the callback was stored for later. If the token is
    /// already cancelled the callback runs right away on this thread and
    /// `false` is returned. Callbacks on a `never()` token are dropped.
    pub fn register<F>(&self, callback: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = match &self.inner {
            TokenInner::Source(shared) => shared,
            TokenInner::Never => return false,
        };

        {
            let mut guard = shared
                .callbacks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // cancel() sets the flag before taking the list, so under the
            // lock a clear flag means the list has not been drained yet.
            if !shared.cancelled.load(Ordering::SeqCst) {
                guard.push(Box::new(callback));
                return true;
            }
        }

        if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
            crate::tp_warn!("cancellation callback panicked");
        }
        false
    }

    /// Check whether two tokens observe the same source
    pub fn same_source(&self, other: &CancellationToken) -> bool {
        match (&self.inner, &other.inner) {
            (TokenInner::Source(a), TokenInner::Source(b)) => Arc::ptr_eq(a, b),
            (TokenInner::Never, TokenInner::Never) => true,
            _ => false,
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_basic_cancellation() {
        let source = CancellationSource::new();
        let token = source.token();

        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        source.cancel();

        assert!(token.is_cancelled());
        assert!(source.is_cancelled());
        assert!(matches!(token.check(), Err(PoolError::Cancelled)));
    }

    #[test]
    fn test_callbacks_run_once_in_order() {
        let source = CancellationSource::new();
        let token = source.token();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = Arc::clone(&order);
            assert!(token.register(move || order.lock().unwrap().push(i)));
        }

        source.cancel();
        source.cancel();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_panicking_callback_does_not_block_others() {
        crate::log::set_log_level(crate::log::LogLevel::Off);
        let source = CancellationSource::new();
        let token = source.token();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        token.register(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        token.register(|| panic!("misbehaving callback"));
        let h = Arc::clone(&hits);
        token.register(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        source.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_register_after_cancel_runs_immediately() {
        let source = CancellationSource::new();
        source.cancel();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let deferred = source.token().register(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!deferred);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_register_and_cancel() {
        for _ in 0..50 {
            let source = Arc::new(CancellationSource::new());
            let hits = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let token = source.token();
                    let hits = Arc::clone(&hits);
                    thread::spawn(move || {
                        for _ in 0..25 {
                            let h = Arc::clone(&hits);
                            token.register(move || {
                                h.fetch_add(1, Ordering::SeqCst);
                            });
                        }
                    })
                })
                .collect();

            source.cancel();
            for h in handles {
                h.join().unwrap();
            }

            // Every callback fires exactly once, whichever side won the race
            assert_eq!(hits.load(Ordering::SeqCst), 100);
        }
    }

    #[test]
    fn test_clone_shares_state() {
        let source = CancellationSource::new();
        let token1 = source.token();
        let token2 = token1.clone();

        assert!(token1.same_source(&token2));
        source.cancel();
        assert!(token2.is_cancelled());
    }

    #[test]
    fn test_never_token() {
        let token = CancellationToken::never();
        assert!(!token.is_cancelled());
        assert!(!token.register(|| panic!("never runs")));
        assert!(!token.same_source(&CancellationSource::new().token()));
    }
}
