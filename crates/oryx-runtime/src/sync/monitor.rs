//! Object monitors
//!
//! A monitor is the per-object ordinary lock. Ownership is recursive and
//! keyed by thread identity; the owner field is additionally mirrored into
//! an atomic so diagnostics can read it at a safepoint without taking the
//! monitor's own lock.

use crate::object::ObjectId;
use crate::threads::{ThreadId, ThreadStatus, VmThread};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unique identifier for a monitor
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MonitorId(u64);

impl MonitorId {
    /// Create a new unique monitor ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild an identity from its raw value
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl Default for MonitorId {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors from monitor operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    /// The calling thread does not own the monitor
    #[error("Thread {thread:?} does not own monitor {monitor:?}")]
    NotOwner {
        /// The offending thread
        thread: ThreadId,
        /// The monitor in question
        monitor: MonitorId,
    },
}

#[derive(Debug, Default)]
struct MonitorCore {
    owner: Option<ThreadId>,
    recursion: usize,
}

/// A recursive per-object lock
pub struct Monitor {
    id: MonitorId,
    object: ObjectId,
    core: Mutex<MonitorCore>,
    available: Condvar,
    /// Owner mirror readable without the core lock (0 = unowned)
    owner_cache: AtomicU64,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("id", &self.id)
            .field("object", &self.object)
            .field("owner", &self.owner())
            .finish()
    }
}

impl Monitor {
    /// Create a monitor for the given object
    pub fn new(id: MonitorId, object: ObjectId) -> Self {
        Self {
            id,
            object,
            core: Mutex::new(MonitorCore::default()),
            available: Condvar::new(),
            owner_cache: AtomicU64::new(0),
        }
    }

    /// Monitor ID
    pub fn id(&self) -> MonitorId {
        self.id
    }

    /// The object this monitor locks
    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Current owner, if any (lock-free read for diagnostics)
    pub fn owner(&self) -> Option<ThreadId> {
        match self.owner_cache.load(Ordering::Acquire) {
            0 => None,
            raw => Some(ThreadId::from_u64(raw)),
        }
    }

    /// Enter the monitor, blocking until it is available.
    ///
    /// Reentrant for the owning thread. While blocked, the thread is marked
    /// safepoint-safe and records the monitor it is blocked on, which is
    /// what deadlock detection walks.
    pub fn enter(&self, thread: &Arc<VmThread>) {
        let mut core = self.core.lock();
        loop {
            match core.owner {
                None => {
                    core.owner = Some(thread.id());
                    core.recursion = 1;
                    self.owner_cache
                        .store(thread.id().as_u64(), Ordering::Release);
                    return;
                }
                Some(owner) if owner == thread.id() => {
                    core.recursion += 1;
                    return;
                }
                Some(_) => {
                    thread.set_blocked_on_monitor(Some(self.id));
                    thread.set_status(ThreadStatus::BlockedOnMonitor);
                    thread.set_safepoint_safe(true);
                    self.available.wait(&mut core);
                    thread.set_safepoint_safe(false);
                    thread.set_status(ThreadStatus::Runnable);
                    thread.set_blocked_on_monitor(None);
                }
            }
        }
    }

    /// Try to enter without blocking; returns false when contended
    pub fn try_enter(&self, thread: &Arc<VmThread>) -> bool {
        let mut core = self.core.lock();
        match core.owner {
            None => {
                core.owner = Some(thread.id());
                core.recursion = 1;
                self.owner_cache
                    .store(thread.id().as_u64(), Ordering::Release);
                true
            }
            Some(owner) if owner == thread.id() => {
                core.recursion += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Exit the monitor
    pub fn exit(&self, thread: &Arc<VmThread>) -> Result<(), MonitorError> {
        let mut core = self.core.lock();
        if core.owner != Some(thread.id()) {
            return Err(MonitorError::NotOwner {
                thread: thread.id(),
                monitor: self.id,
            });
        }
        core.recursion -= 1;
        if core.recursion == 0 {
            core.owner = None;
            self.owner_cache.store(0, Ordering::Release);
            self.available.notify_one();
        }
        Ok(())
    }

    /// Force ownership (snapshot restore and test fixtures)
    pub fn set_owner_for_testing(&self, owner: Option<ThreadId>) {
        let mut core = self.core.lock();
        core.owner = owner;
        core.recursion = usize::from(owner.is_some());
        self.owner_cache
            .store(owner.map(|t| t.as_u64()).unwrap_or(0), Ordering::Release);
    }
}
