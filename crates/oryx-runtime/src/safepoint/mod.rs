//! Safepoint infrastructure for stop-the-world operations
//!
//! Mutator threads poll at well-defined checkpoints (loop back-edges,
//! allocation sites, call boundaries). When a pause is pending they park on
//! a condition variable until the requester resumes the world. The fast
//! path of [`SafepointCoordinator::poll`] is a single atomic load.
//!
//! Threads blocked inside runtime-managed waits (monitor entry, class
//! initialization) mark themselves safepoint-safe instead of polling: their
//! visible state is already consistent, so the requester does not wait for
//! them.

pub mod operation;

pub use operation::{
    SafepointWorld, VmOperation, VmOperationExecutor, MAX_NESTED_SAFEPOINT_DEPTH,
};

use crate::threads::{ThreadStatus, VmThread};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Statistics tracking for safepoint pauses
#[derive(Debug, Default)]
pub struct SafepointStats {
    /// Total number of safepoints executed
    total_safepoints: AtomicUsize,
    /// Total time mutators spent paused (microseconds)
    total_pause_time_us: AtomicUsize,
    /// Maximum single pause (microseconds)
    max_pause_time_us: AtomicUsize,
}

impl SafepointStats {
    /// Total number of safepoints executed
    pub fn total_safepoints(&self) -> usize {
        self.total_safepoints.load(Ordering::Relaxed)
    }

    /// Total time mutators spent paused, in microseconds
    pub fn total_pause_time_us(&self) -> usize {
        self.total_pause_time_us.load(Ordering::Relaxed)
    }

    /// Longest single pause, in microseconds
    pub fn max_pause_time_us(&self) -> usize {
        self.max_pause_time_us.load(Ordering::Relaxed)
    }

    fn record_pause(&self, elapsed_us: usize) {
        self.total_pause_time_us
            .fetch_add(elapsed_us, Ordering::Relaxed);
        let mut max = self.max_pause_time_us.load(Ordering::Relaxed);
        while elapsed_us > max {
            match self.max_pause_time_us.compare_exchange_weak(
                max,
                elapsed_us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => max = current,
            }
        }
    }
}

#[derive(Debug)]
struct SafepointSync {
    pending: bool,
}

/// Coordinates stop-the-world pauses across mutator threads
pub struct SafepointCoordinator {
    /// Fast-path pending flag (single atomic load in `poll`)
    pause_pending: AtomicBool,
    /// Mutators currently parked at the safepoint
    parked: AtomicUsize,
    sync: Mutex<SafepointSync>,
    /// Mutators wait here for the resume
    mutator_cv: Condvar,
    /// The requester waits here for mutators to park
    requester_cv: Condvar,
    /// Pause statistics
    pub stats: SafepointStats,
}

impl Default for SafepointCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SafepointCoordinator {
    /// Create a new coordinator with no pause pending
    pub fn new() -> Self {
        Self {
            pause_pending: AtomicBool::new(false),
            parked: AtomicUsize::new(0),
            sync: Mutex::new(SafepointSync { pending: false }),
            mutator_cv: Condvar::new(),
            requester_cv: Condvar::new(),
            stats: SafepointStats::default(),
        }
    }

    /// Fast inline check, called frequently from mutator loops
    #[inline(always)]
    pub fn poll(&self, thread: &VmThread) {
        if self.pause_pending.load(Ordering::Acquire) {
            self.block_at_safepoint(thread);
        }
    }

    /// True when a pause is currently pending
    pub fn is_pause_pending(&self) -> bool {
        self.pause_pending.load(Ordering::Acquire)
    }

    /// Number of mutators currently parked
    pub fn parked_count(&self) -> usize {
        self.parked.load(Ordering::SeqCst)
    }

    /// Slow path: park until the requester resumes the world
    #[cold]
    #[inline(never)]
    fn block_at_safepoint(&self, thread: &VmThread) {
        let start = Instant::now();
        let mut sync = self.sync.lock();
        if !sync.pending {
            return;
        }

        self.parked.fetch_add(1, Ordering::SeqCst);
        let previous = thread.status();
        thread.set_status(ThreadStatus::AtSafepoint);
        self.requester_cv.notify_all();

        while sync.pending {
            self.mutator_cv.wait(&mut sync);
        }

        self.parked.fetch_sub(1, Ordering::SeqCst);
        thread.set_status(previous);
        drop(sync);

        self.stats.record_pause(start.elapsed().as_micros() as usize);
    }

    /// Request a stop-the-world pause and wait for the mutators to park.
    ///
    /// `required` recomputes how many mutators still have to reach the
    /// safepoint; it is re-evaluated while waiting because threads may
    /// transition in and out of runtime-managed (safepoint-safe) waits.
    pub(crate) fn begin(&self, required: &dyn Fn() -> usize) {
        let mut sync = self.sync.lock();
        debug_assert!(!sync.pending, "safepoint begin while one is pending");
        sync.pending = true;
        self.pause_pending.store(true, Ordering::Release);

        while self.parked.load(Ordering::SeqCst) < required() {
            let _ = self
                .requester_cv
                .wait_for(&mut sync, Duration::from_millis(1));
        }

        self.stats.total_safepoints.fetch_add(1, Ordering::Relaxed);
        log::trace!("safepoint reached: {} mutators parked", self.parked_count());
    }

    /// Resume the world
    pub(crate) fn end(&self) {
        let mut sync = self.sync.lock();
        debug_assert!(sync.pending, "safepoint end without begin");
        sync.pending = false;
        self.pause_pending.store(false, Ordering::Release);
        self.mutator_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_poll_is_noop_without_pause() {
        let coordinator = SafepointCoordinator::new();
        let t = VmThread::new("t");
        coordinator.poll(&t);
        assert_eq!(coordinator.parked_count(), 0);
    }

    #[test]
    fn test_mutators_park_and_resume() {
        let coordinator = Arc::new(SafepointCoordinator::new());
        let stop = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for i in 0..4 {
            let coordinator = coordinator.clone();
            let stop = stop.clone();
            handles.push(std::thread::spawn(move || {
                let me = VmThread::new(format!("mutator-{i}"));
                while !stop.load(Ordering::Acquire) {
                    coordinator.poll(&me);
                    std::hint::spin_loop();
                }
            }));
        }

        coordinator.begin(&|| 4);
        assert_eq!(coordinator.parked_count(), 4);
        coordinator.end();

        stop.store(true, Ordering::Release);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(coordinator.stats.total_safepoints(), 1);
        assert!(coordinator.stats.max_pause_time_us() > 0);
    }
}
