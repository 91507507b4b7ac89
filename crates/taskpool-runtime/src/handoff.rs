//! Listener-to-handler handoff queue
//!
//! A `Handoff<T>` couples a producer (the listener, e.g. `accept()`) and a
//! consumer (the handler) through a lock-free FIFO. Admission is bounded
//! by a live-count rather than by the queue itself:
//!
//! - `listen()` reserves an admission, runs the producer and enqueues what
//!   it returns. Over `max_queue_size` it is rejected without running the
//!   producer.
//! - `handle()` dequeues one item, runs the consumer and gives the
//!   admission back once the consumer returns.
//!
//! So the live-count covers items queued plus items being handled.
//!
//! The check is soft: the count is read, then acted on, with no lock in
//! between. Under contention a few extra items may be momentarily
//! admitted or rejected; the queue is unbounded so nothing is lost.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use taskpool_core::cancel::CancellationToken;
use taskpool_core::spin::spin_until;
use taskpool_core::{tp_trace, tp_warn};

use crate::executor::panic_message;

/// Producer/consumer pair behind a handoff
///
/// Implemented by servers that would rather provide one object than two
/// closures.
pub trait ServerHandler<T>: Send + Sync + 'static {
    /// Produce the next context, e.g. accept a connection
    ///
    /// `None` means nothing arrived this round.
    fn get_context(&self) -> Option<T>;

    /// Handle one context
    fn handle(&self, context: T);
}

/// Outcome of `Handoff::listen`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// An item was produced and queued
    Enqueued,
    /// The producer had nothing
    Empty,
    /// The queue was at capacity; the producer was not run
    Rejected,
    /// The producer panicked
    Failed,
}

/// Cumulative handoff counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandoffStats {
    /// Producer invocations
    pub listened: u64,
    /// Items queued
    pub enqueued: u64,
    /// Admissions refused at capacity
    pub rejected: u64,
    /// Items passed to the consumer
    pub delivered: u64,
    /// Producer or consumer panics
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    listened: AtomicU64,
    enqueued: AtomicU64,
    rejected: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

type Listener<T> = Box<dyn Fn() -> Option<T> + Send + Sync + 'static>;
type Handler<T> = Box<dyn Fn(T) + Send + Sync + 'static>;

/// Bounded handoff between a listener and a handler stage
pub struct Handoff<T> {
    queue: SegQueue<T>,
    live: AtomicUsize,
    max_queue_size: usize,
    listener: Listener<T>,
    handler: Handler<T>,
    counters: Counters,
}

impl<T: Send + 'static> Handoff<T> {
    /// Create a handoff from a producer and a consumer closure
    pub fn new<L, H>(listener: L, handler: H, max_queue_size: usize) -> Self
    where
        L: Fn() -> Option<T> + Send + Sync + 'static,
        H: Fn(T) + Send + Sync + 'static,
    {
        Self {
            queue: SegQueue::new(),
            live: AtomicUsize::new(0),
            max_queue_size,
            listener: Box::new(listener),
            handler: Box::new(handler),
            counters: Counters::default(),
        }
    }

    /// Create a handoff driven by a `ServerHandler`
    pub fn from_source<S>(source: Arc<S>, max_queue_size: usize) -> Self
    where
        S: ServerHandler<T>,
    {
        let producer = Arc::clone(&source);
        Self::new(
            move || producer.get_context(),
            move |context| source.handle(context),
            max_queue_size,
        )
    }

    /// Run the producer once if there is room, queueing its result
    pub fn listen(&self) -> Admission {
        let admitted = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        if admitted > self.max_queue_size {
            self.live.fetch_sub(1, Ordering::SeqCst);
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tp_trace!("handoff: rejected at {} live", admitted - 1);
            return Admission::Rejected;
        }

        self.counters.listened.fetch_add(1, Ordering::Relaxed);
        match panic::catch_unwind(AssertUnwindSafe(|| (self.listener)())) {
            Ok(Some(item)) => {
                self.queue.push(item);
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Admission::Enqueued
            }
            Ok(None) => {
                self.release();
                Admission::Empty
            }
            Err(payload) => {
                self.release();
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tp_warn!("handoff: listener panicked: {}", panic_message(&payload));
                Admission::Failed
            }
        }
    }

    /// Wait for one item and hand it to the consumer
    ///
    /// Returns `false` if `token` was cancelled before an item arrived.
    pub fn handle(&self, token: &CancellationToken) -> bool {
        let mut item = None;
        spin_until(token, || {
            item = self.queue.pop();
            item.is_some()
        });
        match item {
            Some(item) => {
                self.deliver(item);
                true
            }
            None => false,
        }
    }

    /// Hand one item to the consumer if one is queued
    pub fn try_handle(&self) -> bool {
        match self.queue.pop() {
            Some(item) => {
                self.deliver(item);
                true
            }
            None => false,
        }
    }

    fn deliver(&self, item: T) {
        let _admission = Release(self);
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (self.handler)(item))) {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            tp_warn!("handoff: handler panicked: {}", panic_message(&payload));
        }
    }

    /// Give one admission back
    fn release(&self) {
        let released = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if released.is_err() {
            let len = self.queue.len();
            self.live.store(len, Ordering::SeqCst);
            tp_warn!("handoff: live count underflow, resynced to {}", len);
        }
    }

    /// Items queued and not yet dequeued
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Admissions currently held (queued plus being handled)
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    pub fn stats(&self) -> HandoffStats {
        let c = &self.counters;
        HandoffStats {
            listened: c.listened.load(Ordering::Relaxed),
            enqueued: c.enqueued.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }
}

impl<T> std::fmt::Debug for Handoff<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handoff")
            .field("queued", &self.queue.len())
            .field("live", &self.live.load(Ordering::Relaxed))
            .field("max_queue_size", &self.max_queue_size)
            .finish()
    }
}

/// Releases one admission when dropped
struct Release<'a, T: Send + 'static>(&'a Handoff<T>);

impl<T: Send + 'static> Drop for Release<'_, T> {
    fn drop(&mut self) {
        self.0.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    fn quiet() {
        taskpool_core::log::set_log_level(taskpool_core::log::LogLevel::Off);
    }

    fn counter_source(limit: u32) -> impl Fn() -> Option<u32> + Send + Sync + 'static {
        let next = AtomicUsize::new(0);
        move || {
            let n = next.fetch_add(1, Ordering::SeqCst) as u32;
            (n < limit).then_some(n)
        }
    }

    #[test]
    fn test_fifo_exactly_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let handoff = Handoff::new(counter_source(50), move |n| s.lock().unwrap().push(n), 100);

        for _ in 0..50 {
            assert_eq!(handoff.listen(), Admission::Enqueued);
        }
        assert_eq!(handoff.listen(), Admission::Empty);
        assert_eq!(handoff.len(), 50);

        let token = CancellationToken::never();
        for _ in 0..50 {
            assert!(handoff.handle(&token));
        }

        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
        assert_eq!(handoff.live(), 0);
        assert!(handoff.is_empty());
    }

    #[test]
    fn test_rejection_does_not_run_producer() {
        let produced = Arc::new(AtomicUsize::new(0));
        let p = Arc::clone(&produced);
        let handoff = Handoff::new(
            move || Some(p.fetch_add(1, Ordering::SeqCst)),
            |_| {},
            2,
        );

        assert_eq!(handoff.listen(), Admission::Enqueued);
        assert_eq!(handoff.listen(), Admission::Enqueued);
        assert_eq!(handoff.listen(), Admission::Rejected);
        assert_eq!(produced.load(Ordering::SeqCst), 2);
        assert_eq!(handoff.live(), 2);

        // Handling one frees one admission
        assert!(handoff.try_handle());
        assert_eq!(handoff.listen(), Admission::Enqueued);

        let stats = handoff.stats();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn test_admission_held_while_handling() {
        let inside = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let (i, r) = (Arc::clone(&inside), Arc::clone(&release));
        let handoff = Arc::new(Handoff::new(
            || Some(()),
            move |_| {
                i.store(true, Ordering::SeqCst);
                while !r.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
            },
            1,
        ));

        assert_eq!(handoff.listen(), Admission::Enqueued);
        let h = Arc::clone(&handoff);
        let consumer = thread::spawn(move || h.try_handle());
        while !inside.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }

        assert!(handoff.is_empty());
        assert_eq!(handoff.listen(), Admission::Rejected);

        release.store(true, Ordering::SeqCst);
        assert!(consumer.join().unwrap());
        assert_eq!(handoff.live(), 0);
    }

    #[test]
    fn test_failure_isolation() {
        quiet();
        let handoff = Handoff::new(
            counter_source(u32::MAX),
            |n| {
                if n % 2 == 0 {
                    panic!("handler failure on {}", n);
                }
            },
            10,
        );

        for _ in 0..6 {
            assert_eq!(handoff.listen(), Admission::Enqueued);
        }
        for _ in 0..6 {
            assert!(handoff.try_handle());
        }

        assert_eq!(handoff.live(), 0);
        assert_eq!(handoff.stats().failed, 3);
        assert_eq!(handoff.stats().delivered, 6);

        let failing: Handoff<u32> = Handoff::new(|| panic!("listener failure"), |_| {}, 10);
        assert_eq!(failing.listen(), Admission::Failed);
        assert_eq!(failing.live(), 0);
    }

    #[test]
    fn test_handle_returns_on_cancel() {
        let source = taskpool_core::cancel::CancellationSource::new();
        let token = source.token();
        let handoff: Arc<Handoff<u32>> = Arc::new(Handoff::new(|| None, |_| {}, 4));

        let h = Arc::clone(&handoff);
        let waiter = thread::spawn(move || h.handle(&token));
        thread::sleep(Duration::from_millis(20));
        source.cancel();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_underflow_resyncs() {
        quiet();
        let handoff: Handoff<u32> = Handoff::new(|| None, |_| {}, 4);
        handoff.release();
        assert_eq!(handoff.live(), 0);
    }

    #[test]
    fn test_concurrent_counts_stay_consistent() {
        let handled = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&handled);
        let handoff = Arc::new(Handoff::new(
            || Some(1usize),
            move |n| {
                h.fetch_add(n, Ordering::SeqCst);
            },
            8,
        ));

        let source = taskpool_core::cancel::CancellationSource::new();
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let handoff = Arc::clone(&handoff);
                let token = source.token();
                thread::spawn(move || while handoff.handle(&token) {})
            })
            .collect();

        let producers: Vec<_> = (0..3)
            .map(|_| {
                let handoff = Arc::clone(&handoff);
                thread::spawn(move || {
                    let mut enqueued = 0;
                    while enqueued < 200 {
                        if handoff.listen() == Admission::Enqueued {
                            enqueued += 1;
                        } else {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        while handled.load(Ordering::SeqCst) < 600 {
            thread::sleep(Duration::from_millis(1));
        }
        source.cancel();
        for c in consumers {
            c.join().unwrap();
        }

        assert_eq!(handled.load(Ordering::SeqCst), 600);
        assert_eq!(handoff.live(), 0);
        assert_eq!(handoff.stats().enqueued, 600);
    }

    struct Echo {
        next: AtomicUsize,
        seen: Mutex<Vec<usize>>,
    }

    impl ServerHandler<usize> for Echo {
        fn get_context(&self) -> Option<usize> {
            Some(self.next.fetch_add(1, Ordering::SeqCst))
        }
        fn handle(&self, context: usize) {
            self.seen.lock().unwrap().push(context);
        }
    }

    #[test]
    fn test_from_source() {
        let echo = Arc::new(Echo {
            next: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let handoff = Handoff::from_source(Arc::clone(&echo), 4);
        handoff.listen();
        handoff.listen();
        handoff.try_handle();
        handoff.try_handle();
        assert_eq!(*echo.seen.lock().unwrap(), vec![0, 1]);
    }
}
