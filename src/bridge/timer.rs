//! One-shot timers owned by the main loop.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use super::Job;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Handle to a timer scheduled with [`Bridge::call_later`](super::Bridge::call_later).
///
/// Cancelling and firing race on a single atomic, so exactly one of them
/// wins: a cancelled timer never runs, and `cancel` on a fired timer
/// reports `false`.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    status: Arc<AtomicU8>,
    deadline: Instant,
}

impl TimerHandle {
    pub(crate) fn new(deadline: Instant) -> Self {
        Self {
            status: Arc::new(AtomicU8::new(PENDING)),
            deadline,
        }
    }

    /// Cancel the timer. Returns `true` if this call stopped it from firing.
    pub fn cancel(&self) -> bool {
        self.status
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether the timer is still waiting to fire.
    pub fn is_pending(&self) -> bool {
        self.status.load(Ordering::Acquire) == PENDING
    }

    pub fn is_cancelled(&self) -> bool {
        self.status.load(Ordering::Acquire) == CANCELLED
    }

    pub fn has_fired(&self) -> bool {
        self.status.load(Ordering::Acquire) == FIRED
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Claim the timer for firing.
    fn claim(&self) -> bool {
        self.status
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// A scheduled job waiting in the main loop's heap.
pub(crate) struct Timer {
    handle: TimerHandle,
    seq: u64,
    job: Job,
}

impl Timer {
    pub(crate) fn new(handle: TimerHandle, seq: u64, job: Job) -> Self {
        Self { handle, seq, job }
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.handle.deadline
    }

    /// Returns the job if the timer was not cancelled in the meantime.
    pub(crate) fn into_job(self) -> Option<Job> {
        self.handle.claim().then_some(self.job)
    }
}

// BinaryHeap is a max-heap; earliest deadline (then lowest seq) must come out first.
impl Ord for Timer {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline()
            .cmp(&self.deadline())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline() == other.deadline() && self.seq == other.seq
    }
}

impl Eq for Timer {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;
    use std::time::Duration;

    fn timer(deadline: Instant, seq: u64) -> Timer {
        Timer::new(TimerHandle::new(deadline), seq, Box::new(|| {}))
    }

    #[test]
    fn test_heap_pops_earliest_deadline_first() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(timer(now + Duration::from_secs(5), 0));
        heap.push(timer(now + Duration::from_secs(1), 1));
        heap.push(timer(now + Duration::from_secs(1), 2));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|t| t.seq)).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_cancel_prevents_firing() {
        let handle = TimerHandle::new(Instant::now());
        let timer = Timer::new(handle.clone(), 0, Box::new(|| {}));

        assert!(handle.cancel());
        assert!(timer.into_job().is_none());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_cancel_after_fire_reports_false() {
        let handle = TimerHandle::new(Instant::now());
        let timer = Timer::new(handle.clone(), 0, Box::new(|| {}));

        assert!(timer.into_job().is_some());
        assert!(handle.has_fired());
        assert!(!handle.cancel());
    }
}
