//! Cancellation escalation
//!
//! Cancelling a pool generation is cooperative: running bodies only stop
//! when they next look at their token. To bound how long that can drag
//! on, each generation carries an `Escalation` that, once armed, fires a
//! second "abort" source after a grace period unless it is disarmed
//! first.
//!
//! ```text
//!            arm()              grace elapsed
//!   Idle ─────────────▶ Armed ───────────────▶ Fired   (abort source cancelled)
//!     │                   │
//!     │ disarm()          │ disarm()
//!     ▼                   ▼
//!  Disarmed ◀─────────────┘
//! ```
//!
//! The abort source is observed by executions that have not started yet:
//! once it fires they are discarded instead of run.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use taskpool_core::cancel::{CancellationSource, CancellationToken};
use taskpool_core::{tp_debug, tp_warn};

/// Escalation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationState {
    /// Not armed yet
    Idle,
    /// Timer running
    Armed,
    /// Disarmed before firing; terminal
    Disarmed,
    /// Abort source cancelled; terminal
    Fired,
}

struct Inner {
    state: Mutex<EscalationState>,
    cond: Condvar,
    abort: CancellationSource,
    grace_period: Duration,
    name: String,
}

/// Timer-driven escalation from cooperative cancel to forced abort
#[derive(Clone)]
pub struct Escalation {
    inner: Arc<Inner>,
}

impl Escalation {
    /// Create an idle escalation with its own abort source
    pub fn new(name: impl Into<String>, grace_period: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(EscalationState::Idle),
                cond: Condvar::new(),
                abort: CancellationSource::new(),
                grace_period,
                name: name.into(),
            }),
        }
    }

    /// Token observing the abort source
    pub fn abort_token(&self) -> CancellationToken {
        self.inner.abort.token()
    }

    /// Current state
    pub fn state(&self) -> EscalationState {
        *self.lock()
    }

    /// Start the grace timer
    ///
    /// Only the first call from `Idle` has an effect. A zero grace period
    /// fires immediately on the calling thread.
    pub fn arm(&self) {
        {
            let mut state = self.lock();
            if *state != EscalationState::Idle {
                return;
            }
            *state = EscalationState::Armed;
        }

        if self.inner.grace_period.is_zero() {
            self.fire_if_armed();
            return;
        }

        let escalation = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-abort", self.inner.name))
            .spawn(move || escalation.wait_and_fire());

        if let Err(e) = spawned {
            // Without a timer thread, escalate right away rather than never
            tp_warn!("{}: failed to spawn escalation timer: {}", self.inner.name, e);
            self.fire_if_armed();
        }
    }

    /// Stop the timer if it has not fired; returns the resulting state
    pub fn disarm(&self) -> EscalationState {
        let mut state = self.lock();
        if matches!(*state, EscalationState::Idle | EscalationState::Armed) {
            *state = EscalationState::Disarmed;
            self.inner.cond.notify_all();
        }
        *state
    }

    fn wait_and_fire(&self) {
        let deadline = Instant::now() + self.inner.grace_period;
        let mut state = self.lock();
        while *state == EscalationState::Armed {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            state = guard;
        }
        drop(state);
        self.fire_if_armed();
    }

    fn fire_if_armed(&self) {
        {
            let mut state = self.lock();
            if *state != EscalationState::Armed {
                tp_debug!("{}: escalation {:?}, not firing", self.inner.name, *state);
                return;
            }
            *state = EscalationState::Fired;
        }
        tp_warn!(
            "{}: work still running {:?} after cancellation, aborting pending executions",
            self.inner.name,
            self.inner.grace_period
        );
        self.inner.abort.cancel();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EscalationState> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl std::fmt::Debug for Escalation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Escalation")
            .field("state", &self.state())
            .field("grace_period", &self.inner.grace_period)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() {
        taskpool_core::log::set_log_level(taskpool_core::log::LogLevel::Off);
    }

    #[test]
    fn test_fires_after_grace_period() {
        quiet();
        let escalation = Escalation::new("esc-fire", Duration::from_millis(30));
        let abort = escalation.abort_token();
        let start = Instant::now();

        escalation.arm();
        assert_eq!(escalation.state(), EscalationState::Armed);

        while !abort.is_cancelled() {
            assert!(start.elapsed() < Duration::from_secs(5), "never fired");
            thread::sleep(Duration::from_millis(2));
        }
        assert!(start.elapsed() >= Duration::from_millis(25));
        assert_eq!(escalation.state(), EscalationState::Fired);
    }

    #[test]
    fn test_disarm_prevents_firing() {
        let escalation = Escalation::new("esc-disarm", Duration::from_millis(30));
        let abort = escalation.abort_token();

        escalation.arm();
        assert_eq!(escalation.disarm(), EscalationState::Disarmed);

        thread::sleep(Duration::from_millis(80));
        assert!(!abort.is_cancelled());
        assert_eq!(escalation.state(), EscalationState::Disarmed);
    }

    #[test]
    fn test_disarm_before_arm_is_terminal() {
        let escalation = Escalation::new("esc-early", Duration::ZERO);
        escalation.disarm();
        escalation.arm();
        assert!(!escalation.abort_token().is_cancelled());
    }

    #[test]
    fn test_zero_grace_fires_inline() {
        quiet();
        let escalation = Escalation::new("esc-zero", Duration::ZERO);
        escalation.arm();
        assert!(escalation.abort_token().is_cancelled());
        assert_eq!(escalation.disarm(), EscalationState::Fired);
    }

    #[test]
    fn test_arm_twice_is_noop() {
        let escalation = Escalation::new("esc-twice", Duration::from_secs(60));
        escalation.arm();
        escalation.arm();
        assert_eq!(escalation.state(), EscalationState::Armed);
        escalation.disarm();
    }
}
