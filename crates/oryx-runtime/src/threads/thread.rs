//! Mutator thread descriptors

use crate::class::MethodId;
use crate::object::ObjectId;
use crate::sync::MonitorId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Unique identifier for a mutator thread
///
/// Zero is reserved to mean "no thread".
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Create a new unique thread ID
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

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle and scheduling status of a thread
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadStatus {
    /// Created but not yet registered
    New = 0,
    /// Registered and runnable
    Runnable = 1,
    /// Blocked entering a monitor
    BlockedOnMonitor = 2,
    /// Waiting (wait/notify or join)
    Waiting = 3,
    /// Parked on a blocker object
    Parked = 4,
    /// Stopped at a safepoint
    AtSafepoint = 5,
    /// Removed from the registry
    Terminated = 6,
}

impl ThreadStatus {
    fn from_u8(raw: u8) -> ThreadStatus {
        match raw {
            0 => ThreadStatus::New,
            1 => ThreadStatus::Runnable,
            2 => ThreadStatus::BlockedOnMonitor,
            3 => ThreadStatus::Waiting,
            4 => ThreadStatus::Parked,
            5 => ThreadStatus::AtSafepoint,
            6 => ThreadStatus::Terminated,
            _ => unreachable!("invalid thread status {raw}"),
        }
    }
}

/// One stack frame of a thread, as maintained by the (external) interpreter
#[derive(Debug, Clone)]
pub struct Frame {
    /// Executing method
    pub method: MethodId,
    /// Current bytecode offset within the method
    pub bci: u32,
    /// Monitors locked by this frame
    pub monitors: Vec<MonitorId>,
    /// Heap references held by the frame (locals and operands)
    pub refs: Vec<ObjectId>,
}

/// A mutator thread known to the runtime
///
/// The hazard-pointer slot and the nested-list bookkeeping below belong to
/// the thread-SMR protocol in [`crate::threads::registry`]; only the owning
/// thread writes its own slot, while any thread may scan it.
pub struct VmThread {
    id: ThreadId,
    name: String,
    status: AtomicU8,

    /// Hazard-pointer slot: 0, or a `ThreadSnapshotList` address whose low
    /// bit marks the pointer as published-but-unverified.
    pub(crate) hazard: AtomicUsize,
    /// Lists this thread promoted from hazard to refcount protection,
    /// innermost acquisition last.
    pub(crate) nested_lists: Mutex<Vec<usize>>,

    /// True while the thread is blocked in a runtime-managed wait and is
    /// therefore already at a consistent stopping point for safepoints.
    safepoint_safe: AtomicBool,

    // Diagnostics inputs, written by the thread itself (or test fixtures)
    // and read only at a safepoint.
    blocked_on_monitor: AtomicU64,
    blocked_on_raw: AtomicU64,
    park_blocker: AtomicU64,
    frames: Mutex<Vec<Frame>>,
}

impl std::fmt::Debug for VmThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

impl VmThread {
    /// Create a new thread descriptor in the `New` state
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: ThreadId::new(),
            name: name.into(),
            status: AtomicU8::new(ThreadStatus::New as u8),
            hazard: AtomicUsize::new(0),
            nested_lists: Mutex::new(Vec::new()),
            safepoint_safe: AtomicBool::new(false),
            blocked_on_monitor: AtomicU64::new(0),
            blocked_on_raw: AtomicU64::new(0),
            park_blocker: AtomicU64::new(0),
            frames: Mutex::new(Vec::new()),
        })
    }

    /// Thread ID
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status
    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Update the status
    pub fn set_status(&self, status: ThreadStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Mark the thread as already-consistent for safepoint accounting
    pub fn set_safepoint_safe(&self, safe: bool) {
        self.safepoint_safe.store(safe, Ordering::Release);
    }

    /// True when the thread does not need to reach a safepoint poll
    pub fn is_safepoint_safe(&self) -> bool {
        self.safepoint_safe.load(Ordering::Acquire)
    }

    /// Monitor this thread is blocked entering, if any
    pub fn blocked_on_monitor(&self) -> Option<MonitorId> {
        match self.blocked_on_monitor.load(Ordering::Acquire) {
            0 => None,
            raw => Some(MonitorId::from_u64(raw)),
        }
    }

    /// Record (or clear) the monitor this thread is blocked entering
    pub fn set_blocked_on_monitor(&self, monitor: Option<MonitorId>) {
        self.blocked_on_monitor.store(
            monitor.map(|m| m.as_u64()).unwrap_or(0),
            Ordering::Release,
        );
    }

    /// Internal (raw) lock this thread is blocked on, if any
    pub fn blocked_on_raw_lock(&self) -> Option<u64> {
        match self.blocked_on_raw.load(Ordering::Acquire) {
            0 => None,
            raw => Some(raw),
        }
    }

    /// Record (or clear) the internal lock this thread is blocked on
    pub fn set_blocked_on_raw_lock(&self, lock: Option<u64>) {
        self.blocked_on_raw
            .store(lock.unwrap_or(0), Ordering::Release);
    }

    /// Park-blocker object this thread is parked on, if any
    pub fn park_blocker(&self) -> Option<ObjectId> {
        match self.park_blocker.load(Ordering::Acquire) {
            0 => None,
            raw => Some(ObjectId::from_u64(raw)),
        }
    }

    /// Record (or clear) the park-blocker object
    pub fn set_park_blocker(&self, blocker: Option<ObjectId>) {
        self.park_blocker
            .store(blocker.map(|o| o.as_u64()).unwrap_or(0), Ordering::Release);
    }

    /// Push a frame (interpreter call entry)
    pub fn push_frame(&self, frame: Frame) {
        self.frames.lock().push(frame);
    }

    /// Pop the top frame (interpreter call exit)
    pub fn pop_frame(&self) -> Option<Frame> {
        self.frames.lock().pop()
    }

    /// Copy the stack, top frame first, up to `max_depth` frames
    /// (0 = unlimited).
    pub fn frames_snapshot(&self, max_depth: usize) -> Vec<Frame> {
        let frames = self.frames.lock();
        let iter = frames.iter().rev().cloned();
        if max_depth == 0 {
            iter.collect()
        } else {
            iter.take(max_depth).collect()
        }
    }

    /// Current stack depth
    pub fn stack_depth(&self) -> usize {
        self.frames.lock().len()
    }
}
