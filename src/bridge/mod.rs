//! Execution bridge onto the privileged hardware context.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │        Caller threads (network handlers, timers, CLI)          │
//! │   run_blocking / run_async / call_later through a Bridge       │
//! └───────────────────────────────┬────────────────────────────────┘
//!                                 │ crossbeam channel (FIFO)
//!                                 ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │                  MainLoop (privileged context)                 │
//! │   Runs jobs in arrival order, fires due timers, owns hardware  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The privileged context is whichever thread attached to the [`MainLoop`],
//! either by calling [`MainLoop::run`] / [`MainLoop::attach`] itself or via
//! [`MainLoop::spawn`]. A [`Bridge`] used from that thread short-circuits:
//! blocking work runs inline and async work is queued behind whatever is
//! already waiting.
//!
//! A blocking call that gets no answer within the configured timeout fails
//! with [`BridgeError::Unresponsive`]. The context is then assumed to be
//! shutting down; the error is never retried.

mod clock;
mod timer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use timer::TimerHandle;

use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use timer::Timer;

/// A unit of work for the privileged context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Longest the running loop sleeps without checking the clock.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Messages carried to the main loop.
enum Message {
    Run(Job),
    Schedule(Timer),
    Shutdown,
}

/// Bridge errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("Privileged context unresponsive after {timeout:?}, assuming shutdown")]
    Unresponsive { timeout: Duration },

    #[error("Privileged context has shut down")]
    Closed,

    #[error("Main loop is already attached to another thread")]
    ForeignThread,
}

/// State shared between the loop and every bridge clone.
struct Shared {
    owner: OnceLock<ThreadId>,
    /// Set once the loop has processed a shutdown
    closed: AtomicBool,
    clock: Arc<dyn Clock>,
    next_seq: AtomicU64,
    timeout: Duration,
    thread_name: String,
}

impl Shared {
    fn is_owner(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Cloneable handle for submitting work to the privileged context.
#[derive(Clone)]
pub struct Bridge {
    tx: Sender<Message>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("thread_name", &self.shared.thread_name)
            .field("timeout", &self.shared.timeout)
            .field("attached", &self.shared.owner.get().is_some())
            .finish()
    }
}

impl Bridge {
    /// Whether the calling thread is the privileged context.
    pub fn is_privileged(&self) -> bool {
        self.shared.is_owner()
    }

    /// Run `work` on the privileged context and wait for its result.
    ///
    /// Inline when already on the context. A panic inside `work` is resumed
    /// on the calling thread; the context itself keeps running.
    pub fn run_blocking<T, F>(&self, work: F) -> Result<T, BridgeError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_privileged() {
            return Ok(work());
        }
        if self.shared.is_closed() {
            return Err(BridgeError::Closed);
        }

        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(work));
            // The caller may have given up already.
            let _ = result_tx.send(outcome);
        });

        self.tx
            .send(Message::Run(job))
            .map_err(|_| BridgeError::Closed)?;

        match result_rx.recv_timeout(self.shared.timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(RecvTimeoutError::Timeout) => {
                error!(
                    timeout = ?self.shared.timeout,
                    "Privileged context did not answer, aborting"
                );
                Err(BridgeError::Unresponsive {
                    timeout: self.shared.timeout,
                })
            }
            // Job dropped without running: the loop went away.
            Err(RecvTimeoutError::Disconnected) => Err(BridgeError::Closed),
        }
    }

    /// Queue `work` for the privileged context without waiting.
    ///
    /// From the context itself this yields: `work` runs after the current
    /// job and everything already queued.
    pub fn run_async<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.is_closed() || self.tx.send(Message::Run(Box::new(work))).is_err() {
            warn!("Privileged context has shut down, dropping async work");
        }
    }

    /// Run `work` on the privileged context once `delay` has elapsed.
    pub fn call_later<F>(&self, delay: Duration, work: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = TimerHandle::new(self.shared.clock.now() + delay);
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let timer = Timer::new(handle.clone(), seq, Box::new(work));
        if self.shared.is_closed() || self.tx.send(Message::Schedule(timer)).is_err() {
            warn!("Privileged context has shut down, timer will never fire");
            handle.cancel();
        }
        handle
    }

    /// Ask the main loop to stop after the work already queued.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Message::Shutdown);
    }
}

/// The privileged context's work queue.
pub struct MainLoop {
    rx: Receiver<Message>,
    shared: Arc<Shared>,
    timers: BinaryHeap<Timer>,
    stopped: bool,
}

impl MainLoop {
    /// Create a loop on wall-clock time.
    pub fn new(config: &BridgeConfig) -> (Self, Bridge) {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a loop on the given clock.
    pub fn with_clock(config: &BridgeConfig, clock: Arc<dyn Clock>) -> (Self, Bridge) {
        Self::from_parts(config.blocking_timeout(), &config.thread_name, clock)
    }

    /// Create a loop from explicit settings.
    pub fn from_parts(
        timeout: Duration,
        thread_name: &str,
        clock: Arc<dyn Clock>,
    ) -> (Self, Bridge) {
        let (tx, rx) = unbounded();
        let shared = Arc::new(Shared {
            owner: OnceLock::new(),
            closed: AtomicBool::new(false),
            clock,
            next_seq: AtomicU64::new(0),
            timeout,
            thread_name: thread_name.to_string(),
        });

        let main_loop = Self {
            rx,
            shared: Arc::clone(&shared),
            timers: BinaryHeap::new(),
            stopped: false,
        };
        (main_loop, Bridge { tx, shared })
    }

    /// Make the calling thread the privileged context.
    ///
    /// Attaching again from the same thread is a no-op.
    pub fn attach(&self) -> Result<(), BridgeError> {
        let current = thread::current().id();
        let owner = *self.shared.owner.get_or_init(|| current);
        if owner == current {
            Ok(())
        } else {
            Err(BridgeError::ForeignThread)
        }
    }

    /// Whether [`Bridge::shutdown`] has been processed.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Run the jobs queued so far and the timers that are due, then return.
    ///
    /// Jobs queued while draining wait for the next call. Returns the number
    /// of jobs and timers run. Once stopped, queued work is dropped instead,
    /// which fails its blocking callers with [`BridgeError::Closed`].
    pub fn run_pending(&mut self) -> Result<usize, BridgeError> {
        self.attach()?;
        if self.stopped {
            self.discard_queued();
            return Ok(0);
        }
        let mut ran = 0;

        for _ in 0..self.rx.len() {
            if self.stopped {
                break;
            }
            match self.rx.try_recv() {
                Ok(message) => ran += self.handle(message),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        if self.stopped {
            self.discard_queued();
            return Ok(ran);
        }
        ran += self.fire_due_timers();
        Ok(ran)
    }

    /// Run until [`Bridge::shutdown`] is called or every bridge is dropped.
    pub fn run(mut self) -> Result<(), BridgeError> {
        self.attach()?;
        info!(thread = %self.shared.thread_name, "Main loop started");

        while !self.stopped {
            self.fire_due_timers();

            match self.rx.recv_timeout(self.next_wait()) {
                Ok(message) => {
                    self.handle(message);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("All bridges dropped");
                    break;
                }
            }
        }

        info!("Main loop stopped");
        Ok(())
    }

    /// Run the loop on a new thread named after the configuration.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        let name = self.shared.thread_name.clone();
        thread::Builder::new().name(name).spawn(move || {
            if let Err(e) = self.run() {
                error!("Main loop failed: {}", e);
            }
        })
    }

    fn handle(&mut self, message: Message) -> usize {
        match message {
            Message::Run(job) => {
                run_job(job);
                1
            }
            Message::Schedule(timer) => {
                self.timers.push(timer);
                0
            }
            Message::Shutdown => {
                self.stopped = true;
                self.shared.closed.store(true, Ordering::Release);
                0
            }
        }
    }

    /// Drop everything still queued; waiting callers see the channel close.
    fn discard_queued(&mut self) {
        let mut dropped = 0;
        while let Ok(message) = self.rx.try_recv() {
            if matches!(message, Message::Run(_)) {
                dropped += 1;
            }
        }
        self.timers.clear();
        if dropped > 0 {
            debug!(dropped, "Discarded work queued after shutdown");
        }
    }

    fn fire_due_timers(&mut self) -> usize {
        let now = self.shared.clock.now();
        let mut fired = 0;
        while self.timers.peek().is_some_and(|t| t.deadline() <= now) {
            let Some(timer) = self.timers.pop() else {
                break;
            };
            if let Some(job) = timer.into_job() {
                run_job(job);
                fired += 1;
            }
        }
        fired
    }

    fn next_wait(&self) -> Duration {
        let now = self.shared.clock.now();
        self.timers
            .peek()
            .map(|t| t.deadline().saturating_duration_since(now).min(IDLE_POLL))
            .unwrap_or(IDLE_POLL)
    }
}

/// Run a job, keeping the loop alive if it panics.
fn run_job(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!("Job panicked on the privileged context: {}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn detached(timeout_ms: u64) -> (MainLoop, Bridge) {
        MainLoop::from_parts(
            Duration::from_millis(timeout_ms),
            "test-main",
            Arc::new(SystemClock),
        )
    }

    fn manual(clock: &ManualClock) -> (MainLoop, Bridge) {
        MainLoop::from_parts(Duration::from_secs(1), "test-main", Arc::new(clock.clone()))
    }

    fn spawn_loop(timeout_ms: u64) -> (Bridge, JoinHandle<()>) {
        let (main_loop, bridge) = detached(timeout_ms);
        let handle = main_loop.spawn().unwrap();
        (bridge, handle)
    }

    #[test]
    fn test_blocking_returns_value_from_context_thread() {
        let (bridge, handle) = spawn_loop(1000);
        let name = bridge
            .run_blocking(|| thread::current().name().map(str::to_string))
            .unwrap();
        assert_eq!(name.as_deref(), Some("test-main"));

        bridge.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_blocking_short_circuits_on_context() {
        let (mut main_loop, bridge) = detached(1000);
        main_loop.attach().unwrap();

        assert!(bridge.is_privileged());
        let value = bridge.run_blocking(|| 7).unwrap();
        assert_eq!(value, 7);
        assert_eq!(main_loop.run_pending().unwrap(), 0);
    }

    #[test]
    fn test_blocking_times_out_when_context_never_runs() {
        let (main_loop, bridge) = detached(50);

        let started = std::time::Instant::now();
        let result = bridge.run_blocking(|| 1);
        assert!(matches!(result, Err(BridgeError::Unresponsive { .. })));
        assert!(started.elapsed() >= Duration::from_millis(50));

        // Keep the loop alive until after the wait so the failure is a timeout.
        drop(main_loop);
    }

    #[test]
    fn test_blocking_fails_fast_after_loop_dropped() {
        let (main_loop, bridge) = detached(5000);
        drop(main_loop);

        let started = std::time::Instant::now();
        assert!(matches!(bridge.run_blocking(|| 1), Err(BridgeError::Closed)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_work_panic_is_resumed_on_caller() {
        let (bridge, handle) = spawn_loop(1000);

        let caller = bridge.clone();
        let outcome = thread::spawn(move || caller.run_blocking(|| -> u32 { panic!("boom") }))
            .join();
        assert!(outcome.is_err());

        // Context survived the panic.
        assert_eq!(bridge.run_blocking(|| 3).unwrap(), 3);
        bridge.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_async_from_context_runs_after_queued_work() {
        let (mut main_loop, bridge) = detached(1000);
        main_loop.attach().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let (o1, o2, b) = (Arc::clone(&order), Arc::clone(&order), bridge.clone());
        bridge.run_async(move || {
            let inner = Arc::clone(&o1);
            b.run_async(move || inner.lock().push("yielded"));
            o1.lock().push("first");
        });
        bridge.run_async(move || o2.lock().push("second"));

        assert_eq!(main_loop.run_pending().unwrap(), 2);
        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert_eq!(main_loop.run_pending().unwrap(), 1);
        assert_eq!(*order.lock(), vec!["first", "second", "yielded"]);
    }

    #[test]
    fn test_timers_fire_on_manual_clock() {
        let clock = ManualClock::new();
        let (mut main_loop, bridge) = manual(&clock);
        let fired = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&fired);
        let handle = bridge.call_later(Duration::from_secs(5), move || {
            flag.store(true, Ordering::SeqCst)
        });

        main_loop.run_pending().unwrap();
        clock.advance(Duration::from_secs(4));
        main_loop.run_pending().unwrap();
        assert!(!fired.load(Ordering::SeqCst));
        assert!(handle.is_pending());

        clock.advance(Duration::from_secs(1));
        assert_eq!(main_loop.run_pending().unwrap(), 1);
        assert!(fired.load(Ordering::SeqCst));
        assert!(handle.has_fired());
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let clock = ManualClock::new();
        let (mut main_loop, bridge) = manual(&clock);
        let fired = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&fired);
        let handle = bridge.call_later(Duration::from_secs(1), move || {
            flag.store(true, Ordering::SeqCst)
        });
        assert!(handle.cancel());

        clock.advance(Duration::from_secs(2));
        assert_eq!(main_loop.run_pending().unwrap(), 0);
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_attach_from_second_thread_is_rejected() {
        let (main_loop, _bridge) = detached(1000);
        main_loop.attach().unwrap();

        let result = thread::spawn(move || main_loop.attach()).join().unwrap();
        assert!(matches!(result, Err(BridgeError::ForeignThread)));
    }

    #[test]
    fn test_concurrent_callers_never_interleave() {
        let (bridge, handle) = spawn_loop(5000);
        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        thread::scope(|s| {
            for _ in 0..4 {
                let (bridge, busy, overlaps, done) = (
                    bridge.clone(),
                    Arc::clone(&busy),
                    Arc::clone(&overlaps),
                    Arc::clone(&done),
                );
                s.spawn(move || {
                    for _ in 0..25 {
                        let (busy, overlaps, done) =
                            (Arc::clone(&busy), Arc::clone(&overlaps), Arc::clone(&done));
                        bridge
                            .run_blocking(move || {
                                if busy.swap(true, Ordering::SeqCst) {
                                    overlaps.fetch_add(1, Ordering::SeqCst);
                                }
                                thread::yield_now();
                                busy.store(false, Ordering::SeqCst);
                                done.fetch_add(1, Ordering::SeqCst);
                            })
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(done.load(Ordering::SeqCst), 100);
        bridge.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn test_attached_loop_closes_after_shutdown() {
        let (mut main_loop, bridge) = detached(5000);
        main_loop.attach().unwrap();
        let ran = Arc::new(AtomicBool::new(false));

        bridge.shutdown();
        let flag = Arc::clone(&ran);
        bridge.run_async(move || flag.store(true, Ordering::SeqCst));
        assert_eq!(main_loop.run_pending().unwrap(), 0);
        assert!(main_loop.is_stopped());
        assert!(!ran.load(Ordering::SeqCst));

        let caller = bridge.clone();
        let started = std::time::Instant::now();
        let result = thread::spawn(move || caller.run_blocking(|| 1)).join().unwrap();
        assert!(matches!(result, Err(BridgeError::Closed)));
        assert!(started.elapsed() < Duration::from_secs(1));

        let handle = bridge.call_later(Duration::ZERO, || {});
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_blocking_job_behind_shutdown_fails_closed() {
        let (mut main_loop, bridge) = detached(5000);
        main_loop.attach().unwrap();
        bridge.shutdown();

        let caller = bridge.clone();
        let waiter = thread::spawn(move || caller.run_blocking(|| 1));
        while main_loop.rx.len() < 2 {
            thread::yield_now();
        }
        let started = std::time::Instant::now();
        assert_eq!(main_loop.run_pending().unwrap(), 0);

        assert!(matches!(waiter.join().unwrap(), Err(BridgeError::Closed)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    proptest! {
        /// Async work from one caller runs in submission order.
        #[test]
        fn async_jobs_keep_submission_order(count in 1usize..64) {
            let (mut main_loop, bridge) = detached(1000);
            let seen = Arc::new(Mutex::new(Vec::new()));
            for i in 0..count {
                let seen = Arc::clone(&seen);
                bridge.run_async(move || seen.lock().push(i));
            }
            prop_assert_eq!(main_loop.run_pending().unwrap(), count);
            prop_assert_eq!(seen.lock().clone(), (0..count).collect::<Vec<_>>());
        }
    }
}
