//! Condvar-based parking
//!
//! Used on platforms without futex support.

use super::Parking;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Condvar-based parking (fallback)
pub struct CondvarParking {
    /// Wake epoch
    epoch: Mutex<u32>,

    condvar: Condvar,

    /// Count of parked threads
    parked: AtomicUsize,
}

impl CondvarParking {
    pub fn new() -> Self {
        Self {
            epoch: Mutex::new(0),
            condvar: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }

    fn bump(&self) {
        let mut guard = self.epoch.lock().unwrap_or_else(|p| p.into_inner());
        *guard = guard.wrapping_add(1);
    }
}

impl Default for CondvarParking {
    fn default() -> Self {
        Self::new()
    }
}

impl Parking for CondvarParking {
    fn epoch(&self) -> u32 {
        *self.epoch.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn park(&self, epoch: u32, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.epoch.lock().unwrap_or_else(|p| p.into_inner());
        self.parked.fetch_add(1, Ordering::SeqCst);

        while *guard == epoch {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (g, _) = self
                        .condvar
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(|p| p.into_inner());
                    guard = g;
                }
                None => {
                    guard = self.condvar.wait(guard).unwrap_or_else(|p| p.into_inner());
                }
            }
        }

        self.parked.fetch_sub(1, Ordering::SeqCst);
        *guard != epoch
    }

    fn unpark_one(&self) {
        self.bump();
        self.condvar.notify_one();
    }

    fn unpark_all(&self) {
        self.bump();
        self.condvar.notify_all();
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
