//! Idle watchdog: gives up exclusive hardware control some time after a stop.

use parking_lot::Mutex;
use std::time::Duration;

use crate::bridge::{Bridge, TimerHandle};

/// One-shot, re-armable timer around [`Bridge::call_later`].
///
/// Arming replaces any previous timer. Disarming may happen from any
/// thread; the expiry job runs on the privileged context.
#[derive(Debug)]
pub struct IdleWatchdog {
    delay: Duration,
    timer: Mutex<Option<TimerHandle>>,
}

impl IdleWatchdog {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            timer: Mutex::new(None),
        }
    }

    /// Start the countdown; `on_expiry` runs once unless disarmed first.
    pub fn arm<F>(&self, bridge: &Bridge, on_expiry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = bridge.call_later(self.delay, on_expiry);
        if let Some(previous) = self.timer.lock().replace(handle) {
            previous.cancel();
        }
        tracing::debug!(delay = ?self.delay, "Idle watchdog armed");
    }

    /// Cancel the countdown. Returns `true` if an armed timer was stopped.
    pub fn disarm(&self) -> bool {
        self.timer
            .lock()
            .take()
            .map(|handle| handle.cancel())
            .unwrap_or(false)
    }

    pub fn is_armed(&self) -> bool {
        self.timer
            .lock()
            .as_ref()
            .is_some_and(TimerHandle::is_pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{MainLoop, ManualClock};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (MainLoop, Bridge, ManualClock) {
        let clock = ManualClock::new();
        let (main_loop, bridge) =
            MainLoop::from_parts(Duration::from_secs(1), "test-main", Arc::new(clock.clone()));
        main_loop.attach().unwrap();
        (main_loop, bridge, clock)
    }

    #[test]
    fn test_fires_once_after_delay() {
        let (mut main_loop, bridge, clock) = setup();
        let watchdog = IdleWatchdog::new(Duration::from_secs(5));
        let fired = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&fired);
        watchdog.arm(&bridge, move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        assert!(watchdog.is_armed());

        clock.advance(Duration::from_millis(4999));
        main_loop.run_pending().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_millis(1));
        main_loop.run_pending().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!watchdog.is_armed());
        assert!(!watchdog.disarm());
    }

    #[test]
    fn test_disarm_prevents_expiry() {
        let (mut main_loop, bridge, clock) = setup();
        let watchdog = IdleWatchdog::new(Duration::from_secs(5));
        let fired = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&fired);
        watchdog.arm(&bridge, move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
        clock.advance(Duration::from_secs(2));
        main_loop.run_pending().unwrap();

        assert!(watchdog.disarm());
        clock.advance(Duration::from_secs(10));
        main_loop.run_pending().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rearm_replaces_previous_timer() {
        let (mut main_loop, bridge, clock) = setup();
        let watchdog = IdleWatchdog::new(Duration::from_secs(5));
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let count = Arc::clone(&fired);
            watchdog.arm(&bridge, move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
            clock.advance(Duration::from_secs(3));
            main_loop.run_pending().unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_secs(2));
        main_loop.run_pending().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
