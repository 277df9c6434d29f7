//! # Sync Objects
//!
//! Timeline fences shared between queues and clients.
//!
//! Each submission that signals a sync object reserves the next point on its
//! timeline when it is accepted. Points complete in any order but the
//! reported value only advances over a contiguous prefix, so a waiter never
//! observes point `n` while some point below `n` is still outstanding.
//!
//! Waiters park their thread and are unparked by whoever advances the
//! timeline. Abandoning a wait (timeout or cancel) only removes the waiter.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::collections::BTreeSet;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use spin::Mutex;

use crate::error::{Error, Result};

/// A point on a sync object timeline
pub type SyncPoint = u64;

/// Park slice used while an interruptible wait polls its cancel flag
const CANCEL_POLL: Duration = Duration::from_millis(1);

static NEXT_SYNC_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// TIMELINE STATE
// =============================================================================

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    point: SyncPoint,
    thread: Thread,
}

#[derive(Debug, Default)]
struct Timeline {
    /// Highest contiguous completed point
    completed: SyncPoint,
    /// Highest point handed out to a submission
    reserved: SyncPoint,
    /// Points completed ahead of the contiguous prefix
    ahead: BTreeSet<SyncPoint>,
    waiters: Vec<Waiter>,
    next_ticket: u64,
}

impl Timeline {
    fn advance(&mut self) {
        while self.completed < SyncPoint::MAX && self.ahead.remove(&(self.completed + 1)) {
            self.completed += 1;
        }
    }

    fn take_ready(&mut self) -> Vec<Thread> {
        let completed = self.completed;
        let mut ready = Vec::new();
        self.waiters.retain(|w| {
            if w.point <= completed {
                ready.push(w.thread.clone());
                false
            } else {
                true
            }
        });
        ready
    }
}

// =============================================================================
// SYNC OBJECT
// =============================================================================

/// Monotonic completion timeline
#[derive(Debug)]
pub struct SyncObject {
    id: u64,
    timeline: Mutex<Timeline>,
}

impl SyncObject {
    /// Create an unsignaled sync object at point 0
    pub fn new() -> Self {
        Self {
            id: NEXT_SYNC_ID.fetch_add(1, Ordering::Relaxed),
            timeline: Mutex::new(Timeline::default()),
        }
    }

    /// Device-unique id, for logging
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Highest point known complete
    pub fn current(&self) -> SyncPoint {
        self.timeline.lock().completed
    }

    /// Highest point anything has been scheduled to reach
    pub fn last_reserved(&self) -> SyncPoint {
        let tl = self.timeline.lock();
        tl.reserved.max(tl.completed)
    }

    /// Check if `point` has been reached
    pub fn is_signaled(&self, point: SyncPoint) -> bool {
        self.current() >= point
    }

    /// Reserve the next point for a submission
    pub fn reserve(&self) -> SyncPoint {
        let mut tl = self.timeline.lock();
        tl.reserved = tl.reserved.max(tl.completed).saturating_add(1);
        tl.reserved
    }

    /// Mark a reserved point complete
    ///
    /// Completing a point already covered is a no-op, so every point
    /// advances the timeline at most once.
    pub fn complete(&self, point: SyncPoint) {
        let ready = {
            let mut tl = self.timeline.lock();
            if point <= tl.completed {
                return;
            }
            tl.ahead.insert(point);
            tl.advance();
            tl.take_ready()
        };
        for thread in ready {
            thread.unpark();
        }
    }

    /// Host-side signal to `point`
    ///
    /// Fails with `InvalidArgument` if that would move the timeline backward.
    pub fn signal(&self, point: SyncPoint) -> Result<()> {
        let ready = {
            let mut tl = self.timeline.lock();
            if point < tl.completed {
                return Err(Error::InvalidArgument);
            }
            tl.completed = point;
            tl.reserved = tl.reserved.max(point);
            tl.ahead = match point.checked_add(1) {
                Some(next) => tl.ahead.split_off(&next),
                None => BTreeSet::new(),
            };
            tl.advance();
            tl.take_ready()
        };
        for thread in ready {
            thread.unpark();
        }
        Ok(())
    }

    /// Block until `point` is reached or `timeout` elapses
    ///
    /// `None` waits forever. A zero timeout only polls.
    pub fn wait(&self, point: SyncPoint, timeout: Option<Duration>) -> Result<()> {
        self.wait_inner(point, timeout, None)
    }

    /// Like [`wait`](Self::wait), returning `Interrupted` once `cancel` is set
    pub fn wait_interruptible(
        &self,
        point: SyncPoint,
        timeout: Option<Duration>,
        cancel: &AtomicBool,
    ) -> Result<()> {
        self.wait_inner(point, timeout, Some(cancel))
    }

    fn wait_inner(
        &self,
        point: SyncPoint,
        timeout: Option<Duration>,
        cancel: Option<&AtomicBool>,
    ) -> Result<()> {
        // A deadline past what `Instant` can hold waits forever.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        let ticket = {
            let mut tl = self.timeline.lock();
            if tl.completed >= point {
                return Ok(());
            }
            if timeout == Some(Duration::ZERO) {
                return Err(Error::TimedOut);
            }
            let ticket = tl.next_ticket;
            tl.next_ticket += 1;
            tl.waiters.push(Waiter {
                ticket,
                point,
                thread: thread::current(),
            });
            ticket
        };

        let outcome = loop {
            if self.is_signaled(point) {
                break Ok(());
            }
            if cancel.is_some_and(|c| c.load(Ordering::Acquire)) {
                break Err(Error::Interrupted);
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break Err(Error::TimedOut);
                    }
                    Some(remaining)
                }
                None => None,
            };
            let slice = match (remaining, cancel) {
                (Some(r), Some(_)) => Some(r.min(CANCEL_POLL)),
                (Some(r), None) => Some(r),
                (None, Some(_)) => Some(CANCEL_POLL),
                (None, None) => None,
            };
            match slice {
                Some(slice) => thread::park_timeout(slice),
                None => thread::park(),
            }
        };

        if outcome.is_err() {
            let mut tl = self.timeline.lock();
            tl.waiters.retain(|w| w.ticket != ticket);
            // Reached while unregistering
            if tl.completed >= point {
                return Ok(());
            }
        }
        outcome
    }
}

impl Default for SyncObject {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reserve_and_complete_in_order() {
        let sync = SyncObject::new();
        let a = sync.reserve();
        let b = sync.reserve();
        assert_eq!((a, b), (1, 2));
        sync.complete(a);
        assert_eq!(sync.current(), 1);
        sync.complete(b);
        assert_eq!(sync.current(), 2);
    }

    #[test]
    fn test_out_of_order_completion_is_contiguous() {
        let sync = SyncObject::new();
        let a = sync.reserve();
        let b = sync.reserve();
        sync.complete(b);
        assert_eq!(sync.current(), 0);
        assert!(!sync.is_signaled(b));
        sync.complete(a);
        assert_eq!(sync.current(), 2);
    }

    #[test]
    fn test_complete_twice_is_noop() {
        let sync = SyncObject::new();
        let a = sync.reserve();
        sync.complete(a);
        sync.complete(a);
        assert_eq!(sync.current(), 1);
    }

    #[test]
    fn test_signal_is_monotonic() {
        let sync = SyncObject::new();
        sync.signal(5).unwrap();
        assert_eq!(sync.current(), 5);
        assert_eq!(sync.signal(3), Err(Error::InvalidArgument));
        assert_eq!(sync.current(), 5);
        assert_eq!(sync.reserve(), 6);
    }

    #[test]
    fn test_wait_already_reached() {
        let sync = SyncObject::new();
        sync.signal(1).unwrap();
        assert_eq!(sync.wait(1, Some(Duration::ZERO)), Ok(()));
    }

    #[test]
    fn test_wait_times_out_without_side_effects() {
        let sync = SyncObject::new();
        let point = sync.reserve();
        assert_eq!(
            sync.wait(point, Some(Duration::from_millis(20))),
            Err(Error::TimedOut)
        );
        assert_eq!(sync.current(), 0);
        assert_eq!(sync.last_reserved(), point);
        assert!(sync.timeline.lock().waiters.is_empty());
    }

    #[test]
    fn test_wait_woken_by_complete() {
        let sync = Arc::new(SyncObject::new());
        let point = sync.reserve();
        let signaler = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                sync.complete(point);
            })
        };
        assert_eq!(sync.wait(point, Some(Duration::from_secs(5))), Ok(()));
        signaler.join().unwrap();
    }

    #[test]
    fn test_wait_interrupted() {
        let sync = Arc::new(SyncObject::new());
        let cancel = Arc::new(AtomicBool::new(false));
        let canceller = {
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                cancel.store(true, Ordering::Release);
            })
        };
        assert_eq!(
            sync.wait_interruptible(1, None, &cancel),
            Err(Error::Interrupted)
        );
        canceller.join().unwrap();
        assert_eq!(sync.current(), 0);
    }

    #[test]
    fn test_wait_with_unbounded_timeout() {
        let sync = Arc::new(SyncObject::new());
        let cancel = AtomicBool::new(true);
        assert_eq!(
            sync.wait_interruptible(1, Some(Duration::MAX), &cancel),
            Err(Error::Interrupted)
        );

        let point = sync.reserve();
        let signaller = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                sync.complete(point);
            })
        };
        assert_eq!(sync.wait(point, Some(Duration::MAX)), Ok(()));
        signaller.join().unwrap();
    }
}
