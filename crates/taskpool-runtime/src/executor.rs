//! Thread executor for pool work
//!
//! `TaskPoolRunner::run()` hands its execution to an `Executor`. The
//! default `ElasticExecutor` is a cached thread pool:
//!
//! - jobs go to a lock-free `SegQueue`
//! - if an idle thread is parked, one is woken; otherwise a new named
//!   thread is spawned
//! - idle threads exit after `keep_alive`
//!
//! The pools above already bound how many jobs exist at once, so the
//! executor itself is unbounded. Long-running jobs (listener loops,
//! handler loops) each hold a thread for as long as they run.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use taskpool_core::error::{PoolError, PoolResult};
use taskpool_core::{tp_debug, tp_warn};

use crate::parking::{new_parking, Parking};

/// A unit of work for an executor
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs asynchronously
///
/// **Contract:**
/// - `execute()` must never block the caller on the job itself.
/// - A job accepted with `Ok(())` runs exactly once.
/// - On `Err`, the job has been dropped without running.
pub trait Executor: Send + Sync {
    /// Schedule `job` to run on some other thread
    fn execute(&self, job: Job) -> PoolResult<()>;
}

struct Shared {
    /// Pending jobs
    queue: SegQueue<Job>,
    /// Idle-thread parking
    parking: Box<dyn Parking>,
    /// Threads counted as idle (about to park or parked)
    idle: AtomicUsize,
    /// Threads currently alive
    live: AtomicUsize,
    /// Threads ever spawned
    spawned: AtomicU64,
    /// Shutdown flag
    shutdown: AtomicBool,
    /// Idle lifetime
    keep_alive: Duration,
    /// Thread name prefix
    name: String,
}

impl Shared {
    /// Take one idle thread off the idle count; false if none is left
    fn claim_idle(&self) -> bool {
        self.idle
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Cached thread pool: reuses idle threads, spawns when none are idle
pub struct ElasticExecutor {
    shared: Arc<Shared>,
}

impl ElasticExecutor {
    /// Create an executor whose threads are named `<name>-<n>`
    pub fn new(name: impl Into<String>, keep_alive: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: SegQueue::new(),
                parking: new_parking(),
                idle: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                spawned: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
                keep_alive,
                name: name.into(),
            }),
        }
    }

    /// Threads currently alive
    pub fn live_threads(&self) -> usize {
        self.shared.live.load(Ordering::Relaxed)
    }

    /// Threads spawned since creation
    pub fn spawned_threads(&self) -> u64 {
        self.shared.spawned.load(Ordering::Relaxed)
    }

    /// Jobs waiting for a thread
    pub fn queued_jobs(&self) -> usize {
        self.shared.queue.len()
    }

    /// Stop accepting jobs and let threads exit once the queue is drained
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.parking.unpark_all();
    }

    /// Check if shutdown was requested
    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    fn spawn_worker(&self) -> PoolResult<()> {
        let id = self.shared.spawned.fetch_add(1, Ordering::Relaxed);
        self.shared.live.fetch_add(1, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.shared.name, id))
            .spawn(move || worker_loop(shared));

        match spawned {
            Ok(_) => Ok(()),
            Err(e) => {
                self.shared.live.fetch_sub(1, Ordering::SeqCst);
                tp_warn!("{}: failed to spawn executor thread: {}", self.shared.name, e);
                Err(PoolError::SpawnFailed)
            }
        }
    }
}

impl Executor for ElasticExecutor {
    fn execute(&self, job: Job) -> PoolResult<()> {
        if self.is_shutdown() {
            return Err(PoolError::ExecutorShutdown);
        }

        self.shared.queue.push(job);

        // Claim an idle thread for this job. Only reading the count would
        // let two back-to-back pushes both count on the same thread.
        if self.shared.claim_idle() {
            self.shared.parking.unpark_one();
            return Ok(());
        }

        if let Err(e) = self.spawn_worker() {
            // Take a job back out so the caller sees a clean failure. It
            // may not be the one just pushed; whichever it is, it drops
            // without running, which releases whatever it holds.
            if self.shared.live.load(Ordering::SeqCst) == 0 {
                drop(self.shared.queue.pop());
                return Err(e);
            }
            // Some other thread is alive and will get to the job
            self.shared.parking.unpark_one();
        }
        Ok(())
    }
}

impl Drop for ElasticExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Executor thread main loop.
fn worker_loop(shared: Arc<Shared>) {
    tp_debug!("{}: executor thread started", shared.name);

    'outer: loop {
        while let Some(job) = shared.queue.pop() {
            run_job(job);
        }

        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        // Announce idleness, then re-check the queue before sleeping so a
        // push that found no idle thread (and spawned) or claimed one (and
        // bumped the epoch) cannot be missed.
        //
        // Leaving idle goes through `claim_idle`: if a push already claimed
        // this thread the count is not decremented twice. The count may
        // undershoot the threads actually parked, which only costs a spawn;
        // it never overshoots, so a claim always has a thread behind it.
        shared.idle.fetch_add(1, Ordering::SeqCst);
        let epoch = shared.parking.epoch();
        if let Some(job) = shared.queue.pop() {
            shared.claim_idle();
            run_job(job);
            continue;
        }

        let woken = shared.parking.park(epoch, Some(shared.keep_alive));
        let handed_work = !shared.claim_idle();

        if !woken && !handed_work {
            // Idle for keep_alive and nobody counted on us. Jobs pushed
            // from here on spawn or claim another thread; only jobs pushed
            // before this point are ours to drain.
            match shared.queue.pop() {
                Some(job) => run_job(job),
                None => break 'outer,
            }
        }
    }

    shared.live.fetch_sub(1, Ordering::SeqCst);
    tp_debug!("{}: executor thread exiting", shared.name);
}

fn run_job(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        tp_warn!("executor job panicked: {}", panic_message(&payload));
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn test_runs_jobs() {
        let executor = ElasticExecutor::new("exec-test", Duration::from_secs(1));
        let (tx, rx) = mpsc::channel();

        for i in 0..10 {
            let tx = tx.clone();
            executor
                .execute(Box::new(move || tx.send(i).unwrap()))
                .unwrap();
        }

        let mut got: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_reuses_idle_thread() {
        let executor = ElasticExecutor::new("exec-reuse", Duration::from_secs(5));
        let (tx, rx) = mpsc::channel();

        for i in 0..5 {
            let tx = tx.clone();
            executor
                .execute(Box::new(move || tx.send(i).unwrap()))
                .unwrap();
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), i);

            // Let the thread go idle before the next job
            let deadline = Instant::now() + Duration::from_secs(5);
            while executor.shared.idle.load(Ordering::SeqCst) == 0 {
                assert!(Instant::now() < deadline);
                thread::sleep(Duration::from_millis(1));
            }
        }

        assert_eq!(executor.spawned_threads(), 1);
    }

    #[test]
    fn test_idle_threads_expire() {
        let executor = ElasticExecutor::new("exec-expire", Duration::from_millis(20));
        let (tx, rx) = mpsc::channel();
        executor.execute(Box::new(move || tx.send(()).unwrap())).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while executor.live_threads() > 0 {
            assert!(Instant::now() < deadline, "idle thread never exited");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_panicking_job_does_not_kill_thread() {
        taskpool_core::log::set_log_level(taskpool_core::log::LogLevel::Off);
        let executor = ElasticExecutor::new("exec-panic", Duration::from_secs(5));
        executor.execute(Box::new(|| panic!("job failure"))).unwrap();

        let (tx, rx) = mpsc::channel();
        executor.execute(Box::new(move || tx.send(7).unwrap())).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn test_idle_thread_serves_only_one_blocking_job() {
        let executor = ElasticExecutor::new("exec-claim", Duration::from_secs(5));
        let wait_idle = |executor: &ElasticExecutor| {
            let deadline = Instant::now() + Duration::from_secs(5);
            while executor.shared.idle.load(Ordering::SeqCst) == 0 {
                assert!(Instant::now() < deadline, "thread never went idle");
                thread::sleep(Duration::from_millis(1));
            }
        };

        for round in 0..20 {
            // Warm a thread and let it park
            let (tx, rx) = mpsc::channel();
            executor.execute(Box::new(move || tx.send(()).unwrap())).unwrap();
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
            wait_idle(&executor);

            // Two jobs that both block until released
            let gate = Arc::new(AtomicBool::new(false));
            let (tx, rx) = mpsc::channel();
            for _ in 0..2 {
                let gate = Arc::clone(&gate);
                let tx = tx.clone();
                executor
                    .execute(Box::new(move || {
                        tx.send(()).unwrap();
                        while !gate.load(Ordering::SeqCst) {
                            thread::sleep(Duration::from_millis(1));
                        }
                    }))
                    .unwrap();
            }

            for started in 0..2 {
                assert!(
                    rx.recv_timeout(Duration::from_secs(5)).is_ok(),
                    "round {}: job {} never started",
                    round,
                    started + 1
                );
            }
            gate.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_rejects_after_shutdown() {
        let executor = ElasticExecutor::new("exec-shutdown", Duration::from_secs(1));
        executor.shutdown();
        assert_eq!(
            executor.execute(Box::new(|| {})),
            Err(PoolError::ExecutorShutdown)
        );
    }

    #[test]
    fn test_concurrent_jobs_get_own_threads() {
        let executor = ElasticExecutor::new("exec-concurrent", Duration::from_secs(1));
        let barrier = Arc::new(std::sync::Barrier::new(4));
        let (tx, rx) = mpsc::channel();

        // Three jobs that only finish together with the test thread
        for _ in 0..3 {
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            executor
                .execute(Box::new(move || {
                    barrier.wait();
                    tx.send(()).unwrap();
                }))
                .unwrap();
        }

        barrier.wait();
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(executor.spawned_threads() >= 3);
    }
}
