//! Thread registry with safe-memory-reclamation (SMR) protected listing
//!
//! The registry keeps the canonical copy-on-write list of live threads in a
//! single atomically-swapped pointer. Readers never block and never take the
//! writer lock: they protect a snapshot with a per-thread hazard pointer
//! using a tag/verify protocol:
//!
//! 1. Read the current list optimistically.
//! 2. Publish it to the thread's own hazard slot *tagged* as unverified,
//!    with a full fence so a concurrent reclamation scan cannot miss it.
//! 3. Re-read the current list; if it changed, restart.
//! 4. Clear the tag with a compare-and-swap; if the CAS is lost, restart.
//! 5. The snapshot is now safe to dereference until released.
//!
//! The tag distinguishes "I intend to use this" from "confirmed safe": a
//! reclamation scan treats tagged slots conservatively (their value keeps a
//! list alive, but their target is never dereferenced, since a mid-publish
//! slot may hold a pointer that already became stale).
//!
//! Superseded lists go onto a pending-free chain and are freed by whichever
//! thread next mutates the registry, after a scan proves no hazard pointer
//! and no nested-use reference still reaches them.

use crate::threads::list::ThreadSnapshotList;
use crate::threads::thread::{ThreadId, ThreadStatus, VmThread};
use crossbeam::utils::Backoff;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

/// Low bit of a published hazard pointer marking it unverified.
const HAZARD_TAG: usize = 1;

/// Writer-side state, guarded by the registry's writer lock.
struct WriterState {
    /// Head of the pending-free chain of superseded lists
    pending_head: *mut ThreadSnapshotList,
    /// Number of mutations performed; the version of the newest list
    mutations: u64,
}

// The raw chain head is only touched under the writer lock.
unsafe impl Send for WriterState {}

/// Registry of live mutator threads with SMR-protected listing
pub struct ThreadRegistry {
    /// The newest snapshot list; swapped atomically on every mutation
    current: AtomicPtr<ThreadSnapshotList>,
    /// Serializes add/remove and the reclamation sweep
    writer: Mutex<WriterState>,
    /// Every attached thread, whether or not it is in the snapshot list;
    /// this is the set whose hazard slots the reclamation scan reads.
    known: DashMap<u64, Arc<VmThread>>,
    /// Wakes threads blocked in `remove_thread` waiting for protection of
    /// the removed thread to drain.
    deletion_gen: Mutex<u64>,
    deletion_cv: Condvar,
    deletion_waiters: AtomicUsize,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRegistry {
    /// Create a registry with an empty thread list
    pub fn new() -> Self {
        Self {
            current: AtomicPtr::new(Box::into_raw(ThreadSnapshotList::empty())),
            writer: Mutex::new(WriterState {
                pending_head: ptr::null_mut(),
                mutations: 0,
            }),
            known: DashMap::new(),
            deletion_gen: Mutex::new(0),
            deletion_cv: Condvar::new(),
            deletion_waiters: AtomicUsize::new(0),
        }
    }

    /// Attach a thread so it may publish hazard pointers, without adding it
    /// to the live list (diagnostic or helper threads).
    pub fn attach(&self, thread: &Arc<VmThread>) {
        self.known.insert(thread.id().as_u64(), thread.clone());
    }

    /// Add a thread to the live list.
    ///
    /// Builds a new snapshot list, swaps it in, and sweeps the pending-free
    /// chain.
    pub fn add_thread(&self, thread: &Arc<VmThread>) {
        self.known.insert(thread.id().as_u64(), thread.clone());
        let mut w = self.writer.lock();
        let old = self.current.load(Ordering::Relaxed);
        w.mutations += 1;
        let new_list =
            Box::into_raw(unsafe { &*old }.with_added(thread.clone(), w.mutations));
        self.current.store(new_list, Ordering::SeqCst);
        Self::push_pending(&mut w, old);
        self.sweep_pending(&mut w);
        thread.set_safepoint_safe(false);
        thread.set_status(ThreadStatus::Runnable);
    }

    /// Remove a thread from the live list.
    ///
    /// Blocks until no hazard pointer and no nested-use reference anywhere
    /// still reaches the removed thread, so the caller may safely destroy
    /// the underlying OS thread afterwards.
    pub fn remove_thread(&self, thread: &Arc<VmThread>) {
        // The thread is leaving managed execution; it will never reach
        // another poll, so a pending stop-the-world whose snapshot still
        // includes it must not wait for it while its protection drains.
        thread.set_safepoint_safe(true);
        {
            let mut w = self.writer.lock();
            let old = self.current.load(Ordering::Relaxed);
            w.mutations += 1;
            let new_list =
                Box::into_raw(unsafe { &*old }.with_removed(thread.id(), w.mutations));
            self.current.store(new_list, Ordering::SeqCst);
            Self::push_pending(&mut w, old);
            self.sweep_pending(&mut w);
        }

        self.wait_until_unprotected(thread);
        self.known.remove(&thread.id().as_u64());
        thread.set_status(ThreadStatus::Terminated);
    }

    /// Acquire a stable, SMR-protected snapshot of the live threads.
    ///
    /// Never blocks: a pure publish/verify retry loop. The calling thread
    /// must be attached. If the thread already holds a stable list, that
    /// list is promoted from hazard-slot protection to reference-count
    /// protection *before* the slot is reused, so there is no window where
    /// it is unprotected.
    pub fn acquire_stable_list<'a>(
        &'a self,
        thread: &'a Arc<VmThread>,
    ) -> StableListHandle<'a> {
        debug_assert!(
            self.known.contains_key(&thread.id().as_u64()),
            "thread {:?} acquired a stable list without being attached",
            thread.id()
        );

        let held = thread.hazard.load(Ordering::Relaxed);
        if held != 0 {
            debug_assert_eq!(held & HAZARD_TAG, 0, "nested acquire from tagged slot");
            // Promote the currently held list to refcount protection first;
            // only then may the hazard slot be republished.
            let list = held as *const ThreadSnapshotList;
            unsafe { (*list).retain_nested() };
            thread.nested_lists.lock().push(held);
        }

        let backoff = Backoff::new();
        let verified = loop {
            // Step 1: optimistic read.
            let observed = self.current.load(Ordering::SeqCst) as usize;

            // Step 2: publish tagged. The full fence makes the publication
            // visible to a concurrent reclamation scan before we re-read;
            // a relaxed store here would let the scan miss the slot and
            // free the list out from under us.
            thread.hazard.store(observed | HAZARD_TAG, Ordering::SeqCst);
            fence(Ordering::SeqCst);

            // Step 3: the snapshot is stale if the current list moved on.
            if self.current.load(Ordering::SeqCst) as usize != observed {
                backoff.spin();
                continue;
            }

            // Step 4: verify by clearing the tag. Losing the CAS means a
            // scanner invalidated the publication.
            if thread
                .hazard
                .compare_exchange(
                    observed | HAZARD_TAG,
                    observed,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                break observed;
            }
            backoff.spin();
        };

        StableListHandle {
            registry: self,
            thread,
            list: verified as *const ThreadSnapshotList,
        }
    }

    /// Number of threads in the current live list
    pub fn live_count(&self) -> usize {
        // The length read races with mutation, which is fine for a count.
        unsafe { &*self.current.load(Ordering::SeqCst) }.len()
    }

    /// Version of the current live list
    pub fn current_version(&self) -> u64 {
        unsafe { &*self.current.load(Ordering::SeqCst) }.version()
    }

    /// Number of superseded lists still awaiting reclamation
    pub fn pending_free_count(&self) -> usize {
        let w = self.writer.lock();
        let mut n = 0;
        let mut head = w.pending_head;
        while !head.is_null() {
            n += 1;
            head = unsafe { (*head).next_free() };
        }
        n
    }

    fn push_pending(w: &mut WriterState, list: *mut ThreadSnapshotList) {
        unsafe { (*list).set_next_free(w.pending_head) };
        w.pending_head = list;
    }

    /// Reclamation sweep over the pending-free chain.
    ///
    /// Builds the set of all currently-published hazard pointers
    /// (tag-stripped: a tagged slot conservatively keeps its target alive)
    /// and frees every pending list that is unreferenced and has a zero
    /// nested-use count. Lists still in use stay on the chain for the next
    /// sweep. Any list that becomes referenced after this scan is, by
    /// construction, the current list or one already protected by another
    /// mechanism, never one freed here.
    fn sweep_pending(&self, w: &mut WriterState) {
        let mut protected: FxHashSet<usize> = FxHashSet::default();
        for entry in self.known.iter() {
            let slot = entry.value().hazard.load(Ordering::SeqCst);
            if slot != 0 {
                protected.insert(slot & !HAZARD_TAG);
            }
        }

        let mut head = w.pending_head;
        let mut survivors: *mut ThreadSnapshotList = ptr::null_mut();
        while !head.is_null() {
            let next = unsafe { (*head).next_free() };
            let in_use = protected.contains(&(head as usize))
                || unsafe { (*head).nested_ref_count() } > 0;
            if in_use {
                unsafe { (*head).set_next_free(survivors) };
                survivors = head;
            } else {
                drop(unsafe { Box::from_raw(head) });
            }
            head = next;
        }
        w.pending_head = survivors;
    }

    /// Release protocol shared by [`StableListHandle::drop`].
    fn release_stable_list(&self, thread: &Arc<VmThread>, list: *const ThreadSnapshotList) {
        let slot = thread.hazard.load(Ordering::Relaxed);
        if slot != 0 && (slot & !HAZARD_TAG) == list as usize {
            thread.hazard.store(0, Ordering::SeqCst);
        } else {
            // The protection was promoted to the reference count by a
            // nested acquisition.
            let mut nested = thread.nested_lists.lock();
            match nested.iter().rposition(|&p| p == list as usize) {
                Some(pos) => {
                    nested.remove(pos);
                    unsafe { (*list).release_nested() };
                }
                None => debug_assert!(false, "released an unprotected stable list"),
            }
        }

        if self.deletion_waiters.load(Ordering::SeqCst) > 0 {
            let mut gen = self.deletion_gen.lock();
            *gen += 1;
            self.deletion_cv.notify_all();
        }
    }

    /// Block until no protected snapshot anywhere still includes `thread`.
    fn wait_until_unprotected(&self, thread: &Arc<VmThread>) {
        loop {
            // Register as a waiter and sample the generation *before* the
            // protection scan. Any release that clears a slot after the
            // scan is then guaranteed to observe the waiter count and bump
            // the generation, so the wait below cannot miss it.
            self.deletion_waiters.fetch_add(1, Ordering::SeqCst);
            let gen_at_scan = *self.deletion_gen.lock();

            let still_protected = {
                let w = self.writer.lock();
                self.is_thread_protected(thread.id(), &w)
            };
            if !still_protected {
                self.deletion_waiters.fetch_sub(1, Ordering::SeqCst);
                return;
            }

            {
                let mut gen = self.deletion_gen.lock();
                while *gen == gen_at_scan {
                    self.deletion_cv.wait(&mut gen);
                }
            }
            self.deletion_waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// True when some verified hazard pointer or refcounted pending list
    /// still contains `id`. Caller holds the writer lock, so no list can be
    /// freed during the scan; tagged (unverified) slots are never
    /// dereferenced, since their holder is guaranteed to re-verify against
    /// the current list, which no longer contains `id`.
    fn is_thread_protected(&self, id: ThreadId, w: &WriterState) -> bool {
        for entry in self.known.iter() {
            let slot = entry.value().hazard.load(Ordering::SeqCst);
            if slot == 0 || (slot & HAZARD_TAG) != 0 {
                continue;
            }
            let list = slot as *const ThreadSnapshotList;
            if unsafe { (*list).contains(id) } {
                return true;
            }
        }

        let mut head = w.pending_head;
        while !head.is_null() {
            unsafe {
                if (*head).nested_ref_count() > 0 && (*head).contains(id) {
                    return true;
                }
                head = (*head).next_free();
            }
        }
        false
    }
}

impl Drop for ThreadRegistry {
    fn drop(&mut self) {
        let w = self.writer.get_mut();
        let mut head = w.pending_head;
        while !head.is_null() {
            let next = unsafe { (*head).next_free() };
            drop(unsafe { Box::from_raw(head) });
            head = next;
        }
        let current = *self.current.get_mut();
        if !current.is_null() {
            drop(unsafe { Box::from_raw(current) });
        }
    }
}

/// RAII handle to an SMR-protected thread snapshot
///
/// The snapshot stays valid until the handle is dropped. Handles are tied to
/// the acquiring thread and must be released on it, which the borrow of the
/// thread enforces.
pub struct StableListHandle<'a> {
    registry: &'a ThreadRegistry,
    thread: &'a Arc<VmThread>,
    list: *const ThreadSnapshotList,
}

impl Deref for StableListHandle<'_> {
    type Target = ThreadSnapshotList;

    fn deref(&self) -> &ThreadSnapshotList {
        // Valid for the handle's lifetime: the hazard pointer or the
        // promoted reference count keeps the list allocated.
        unsafe { &*self.list }
    }
}

impl StableListHandle<'_> {
    /// The snapshot entries
    pub fn threads(&self) -> &[Arc<VmThread>] {
        self.deref().threads()
    }
}

impl Drop for StableListHandle<'_> {
    fn drop(&mut self) {
        self.registry.release_stable_list(self.thread, self.list);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_add_remove_updates_live_count() {
        let registry = ThreadRegistry::new();
        let a = VmThread::new("a");
        let b = VmThread::new("b");

        registry.add_thread(&a);
        registry.add_thread(&b);
        assert_eq!(registry.live_count(), 2);
        assert_eq!(a.status(), ThreadStatus::Runnable);

        registry.remove_thread(&a);
        assert_eq!(registry.live_count(), 1);
        assert_eq!(a.status(), ThreadStatus::Terminated);
    }

    #[test]
    fn test_every_mutation_makes_a_new_list() {
        let registry = ThreadRegistry::new();
        assert_eq!(registry.current_version(), 0);

        let a = VmThread::new("a");
        let b = VmThread::new("b");
        registry.add_thread(&a);
        registry.add_thread(&b);
        registry.remove_thread(&a);
        registry.remove_thread(&b);

        // Four mutations, four distinct list versions.
        assert_eq!(registry.current_version(), 4);
    }

    #[test]
    fn test_stable_list_sees_snapshot() {
        let registry = ThreadRegistry::new();
        let reader = VmThread::new("reader");
        registry.attach(&reader);

        let a = VmThread::new("a");
        registry.add_thread(&a);

        let handle = registry.acquire_stable_list(&reader);
        assert!(handle.contains(a.id()));
        let version_at_acquire = handle.version();

        // A concurrent mutation does not disturb the held snapshot.
        let b = VmThread::new("b");
        registry.add_thread(&b);
        assert!(handle.contains(a.id()));
        assert!(!handle.contains(b.id()));
        assert_eq!(handle.version(), version_at_acquire);
        drop(handle);

        let fresh = registry.acquire_stable_list(&reader);
        assert!(fresh.contains(b.id()));
    }

    #[test]
    fn test_hazard_slot_cleared_on_release() {
        let registry = ThreadRegistry::new();
        let reader = VmThread::new("reader");
        registry.attach(&reader);

        let handle = registry.acquire_stable_list(&reader);
        assert_ne!(reader.hazard.load(Ordering::SeqCst), 0);
        // Verified pointers are untagged.
        assert_eq!(reader.hazard.load(Ordering::SeqCst) & HAZARD_TAG, 0);
        drop(handle);
        assert_eq!(reader.hazard.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_nested_acquire_promotes_outer_list() {
        let registry = ThreadRegistry::new();
        let reader = VmThread::new("reader");
        registry.attach(&reader);

        let a = VmThread::new("a");
        registry.add_thread(&a);

        let outer = registry.acquire_stable_list(&reader);
        let outer_version = outer.version();

        // Mutate so the nested acquisition sees a different list.
        let b = VmThread::new("b");
        registry.add_thread(&b);

        let inner = registry.acquire_stable_list(&reader);
        assert_ne!(inner.version(), outer_version);
        // The outer list is now refcount-protected.
        assert_eq!(outer.nested_ref_count(), 1);
        assert!(outer.contains(a.id()));
        assert!(inner.contains(b.id()));

        drop(inner);
        // Outer protection survives the inner release.
        assert!(outer.contains(a.id()));
        drop(outer);

        assert_eq!(reader.hazard.load(Ordering::SeqCst), 0);
        assert!(reader.nested_lists.lock().is_empty());
    }

    #[test]
    fn test_superseded_lists_reclaimed_when_unreferenced() {
        let registry = ThreadRegistry::new();
        let a = VmThread::new("a");
        registry.add_thread(&a);
        for _ in 0..16 {
            let t = VmThread::new("churn");
            registry.add_thread(&t);
            registry.remove_thread(&t);
        }
        // No reader holds anything, so at most the most recently superseded
        // lists linger until the final sweep of the last mutation.
        assert_eq!(registry.pending_free_count(), 0);
    }

    #[test]
    fn test_held_list_survives_sweeps() {
        let registry = ThreadRegistry::new();
        let reader = VmThread::new("reader");
        registry.attach(&reader);

        let a = VmThread::new("a");
        registry.add_thread(&a);
        let handle = registry.acquire_stable_list(&reader);

        for _ in 0..8 {
            let t = VmThread::new("churn");
            registry.add_thread(&t);
            registry.remove_thread(&t);
        }
        // The held snapshot is still on the pending chain, not freed.
        assert!(registry.pending_free_count() >= 1);
        assert!(handle.contains(a.id()));
        drop(handle);

        let b = VmThread::new("b");
        registry.add_thread(&b);
        assert_eq!(registry.pending_free_count(), 0);
    }

    #[test]
    fn test_remove_waits_for_protection_to_drain() {
        let registry = Arc::new(ThreadRegistry::new());
        let reader = VmThread::new("reader");
        registry.attach(&reader);

        let victim = VmThread::new("victim");
        registry.add_thread(&victim);

        let handle = registry.acquire_stable_list(&reader);
        assert!(handle.contains(victim.id()));

        let remover = {
            let registry = registry.clone();
            let victim = victim.clone();
            std::thread::spawn(move || {
                registry.remove_thread(&victim);
            })
        };

        // The remover must block while our handle still covers the victim.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!remover.is_finished());

        drop(handle);
        remover.join().unwrap();
        assert_eq!(victim.status(), ThreadStatus::Terminated);
    }
}
