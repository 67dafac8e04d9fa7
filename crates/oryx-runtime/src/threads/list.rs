//! Immutable thread snapshot lists
//!
//! Every add/remove of a thread produces a brand-new list; a published list
//! is never mutated. A list stays allocated while it is the registry's
//! current list, while any thread's hazard pointer references it, or while
//! its nested-use reference count is non-zero.

use crate::threads::thread::{ThreadId, VmThread};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

/// An immutable, ordered snapshot of the live threads
pub struct ThreadSnapshotList {
    /// Monotonically increasing version; each registry mutation produces
    /// exactly one new list with a new version.
    version: u64,
    threads: Box<[Arc<VmThread>]>,
    /// Nested-use reference count: protections promoted off a hazard slot.
    nested_refs: AtomicUsize,
    /// Link in the registry's pending-free chain; only touched while the
    /// registry's writer lock is held.
    next_free: AtomicPtr<ThreadSnapshotList>,
}

impl std::fmt::Debug for ThreadSnapshotList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSnapshotList")
            .field("version", &self.version)
            .field("len", &self.threads.len())
            .field("nested_refs", &self.nested_refs.load(Ordering::Relaxed))
            .finish()
    }
}

impl ThreadSnapshotList {
    /// The initial, empty list
    pub(crate) fn empty() -> Box<Self> {
        Box::new(Self {
            version: 0,
            threads: Box::new([]),
            nested_refs: AtomicUsize::new(0),
            next_free: AtomicPtr::new(ptr::null_mut()),
        })
    }

    /// Copy-on-write append
    pub(crate) fn with_added(&self, thread: Arc<VmThread>, version: u64) -> Box<Self> {
        let mut threads = self.threads.to_vec();
        threads.push(thread);
        Box::new(Self {
            version,
            threads: threads.into_boxed_slice(),
            nested_refs: AtomicUsize::new(0),
            next_free: AtomicPtr::new(ptr::null_mut()),
        })
    }

    /// Copy-on-write removal
    pub(crate) fn with_removed(&self, id: ThreadId, version: u64) -> Box<Self> {
        let threads: Vec<Arc<VmThread>> = self
            .threads
            .iter()
            .filter(|t| t.id() != id)
            .cloned()
            .collect();
        Box::new(Self {
            version,
            threads: threads.into_boxed_slice(),
            nested_refs: AtomicUsize::new(0),
            next_free: AtomicPtr::new(ptr::null_mut()),
        })
    }

    /// List version
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of threads in the snapshot
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// True for an empty snapshot
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// The snapshot entries
    pub fn threads(&self) -> &[Arc<VmThread>] {
        &self.threads
    }

    /// True when the snapshot includes the given thread
    pub fn contains(&self, id: ThreadId) -> bool {
        self.threads.iter().any(|t| t.id() == id)
    }

    /// Current nested-use reference count
    pub(crate) fn nested_ref_count(&self) -> usize {
        self.nested_refs.load(Ordering::SeqCst)
    }

    /// Promote one hazard-slot protection onto the reference count
    pub(crate) fn retain_nested(&self) {
        self.nested_refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one promoted protection
    pub(crate) fn release_nested(&self) {
        let prev = self.nested_refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "nested refcount underflow");
    }

    pub(crate) fn next_free(&self) -> *mut ThreadSnapshotList {
        self.next_free.load(Ordering::Relaxed)
    }

    pub(crate) fn set_next_free(&self, next: *mut ThreadSnapshotList) {
        self.next_free.store(next, Ordering::Relaxed);
    }
}
