//! Linux futex-based parking
//!
//! The futex word is the wake epoch. A parker sleeps with
//! `FUTEX_WAIT(word, epoch)`, which the kernel refuses (EAGAIN) if the
//! word already moved on. Unparkers bump the word, then `FUTEX_WAKE`.

use super::Parking;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// Linux futex-based parking
pub struct FutexParking {
    /// Futex word: wake epoch
    epoch: AtomicU32,

    /// Count of parked threads (skip the wake syscall when zero)
    parked: AtomicUsize,
}

impl FutexParking {
    pub fn new() -> Self {
        Self {
            epoch: AtomicU32::new(0),
            parked: AtomicUsize::new(0),
        }
    }

    fn wake(&self, count: i32) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if self.parked.load(Ordering::SeqCst) == 0 {
            return;
        }
        // Safety: the futex word lives as long as self; FUTEX_WAKE only
        // reads the address.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.epoch.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                count,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }
}

impl Default for FutexParking {
    fn default() -> Self {
        Self::new()
    }
}

impl Parking for FutexParking {
    fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn park(&self, epoch: u32, timeout: Option<Duration>) -> bool {
        self.parked.fetch_add(1, Ordering::SeqCst);

        if self.epoch.load(Ordering::SeqCst) == epoch {
            let timespec = timeout.map(|d| libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            });
            let timespec_ptr = match &timespec {
                Some(ts) => ts as *const libc::timespec,
                None => std::ptr::null(),
            };

            // Safety: the futex word and timespec outlive the call.
            // ETIMEDOUT, EAGAIN and EINTR are all handled by re-reading
            // the epoch below.
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    self.epoch.as_ptr(),
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    epoch,
                    timespec_ptr,
                    std::ptr::null::<u32>(),
                    0u32,
                );
            }
        }

        self.parked.fetch_sub(1, Ordering::SeqCst);
        self.epoch.load(Ordering::SeqCst) != epoch
    }

    fn unpark_one(&self) {
        self.wake(1);
    }

    fn unpark_all(&self) {
        self.wake(i32::MAX);
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}
