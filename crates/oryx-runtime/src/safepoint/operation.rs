//! VM operations executed inside a stop-the-world pause
//!
//! A [`VmOperation`] runs its `doit` body while every other mutator is
//! parked, against a stable snapshot of the thread list. Operations are
//! serialized through [`VmOperationExecutor`]; requesters queued behind a
//! running operation are marked safepoint-safe while they wait, so competing
//! requests never stall each other's world-stop. An operation that declares
//! [`VmOperation::allows_nested`] may have further operations requested
//! from inside its own `doit`, which then run inline without a second
//! world-stop (the world is already stopped).

use crate::runtime::RuntimeState;
use crate::threads::{ThreadStatus, VmThread};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Maximum depth of nested VM operations
pub const MAX_NESTED_SAFEPOINT_DEPTH: usize = 4;

/// The world as seen by a VM operation: every mutator is parked and the
/// thread list cannot change for the lifetime of this view.
pub struct SafepointWorld<'a> {
    runtime: &'a RuntimeState,
    threads: &'a [Arc<VmThread>],
}

impl<'a> SafepointWorld<'a> {
    /// Shared runtime state
    pub fn runtime(&self) -> &'a RuntimeState {
        self.runtime
    }

    /// Stable snapshot of all registered threads
    pub fn threads(&self) -> &'a [Arc<VmThread>] {
        self.threads
    }
}

/// An operation that must run with the world stopped
pub trait VmOperation {
    /// Human-readable operation name, used in logging
    fn name(&self) -> &'static str;

    /// Whether further VM operations may be requested from inside `doit`
    fn allows_nested(&self) -> bool {
        false
    }

    /// Runs on the requesting thread before the pause; returning `false`
    /// cancels the operation without stopping the world.
    fn doit_prologue(&mut self) -> bool {
        true
    }

    /// The operation body, executed while all mutators are parked
    fn doit(&mut self, world: &mut SafepointWorld<'_>);

    /// Runs on the requesting thread after the world has resumed
    fn doit_epilogue(&mut self) {}
}

/// Serializes VM operations and drives the stop/resume protocol
pub struct VmOperationExecutor {
    /// Only one top-level operation at a time
    op_lock: Mutex<()>,
    /// Thread currently running an operation (0 = none)
    owner: AtomicU64,
    /// Current operation nesting depth
    depth: AtomicUsize,
    /// Whether the currently running operation permits nesting
    nested_allowed: AtomicBool,
    /// Completed operation count
    executed: AtomicUsize,
}

impl Default for VmOperationExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl VmOperationExecutor {
    /// Create an idle executor
    pub fn new() -> Self {
        Self {
            op_lock: Mutex::new(()),
            owner: AtomicU64::new(0),
            depth: AtomicUsize::new(0),
            nested_allowed: AtomicBool::new(false),
            executed: AtomicUsize::new(0),
        }
    }

    /// Number of operations that have completed
    pub fn executed_count(&self) -> usize {
        self.executed.load(Ordering::Relaxed)
    }

    /// Execute `op` with the world stopped, blocking the requester until it
    /// completes. Returns `false` when the prologue cancelled the operation.
    ///
    /// When the requester is already inside an operation that allows
    /// nesting, the nested operation runs inline against a freshly acquired
    /// stable thread list.
    pub fn execute(
        &self,
        runtime: &RuntimeState,
        requester: &Arc<VmThread>,
        op: &mut dyn VmOperation,
    ) -> bool {
        let me = requester.id().as_u64();
        if self.owner.load(Ordering::Acquire) == me {
            return self.execute_nested(runtime, requester, op);
        }

        // A requester queued behind another operation is parked at a
        // consistent stopping point; the winning requester must not wait
        // for it to reach a poll.
        requester.set_safepoint_safe(true);
        let guard = self.op_lock.lock();
        requester.set_safepoint_safe(false);

        if !op.doit_prologue() {
            return false;
        }

        log::debug!("VM operation {} stopping the world", op.name());
        let handle = runtime.threads().acquire_stable_list(requester);
        let threads = handle.threads();
        // Threads parked in runtime-managed waits are already safe; the
        // requester stops itself by definition.
        let required = || {
            threads
                .iter()
                .filter(|t| {
                    t.id().as_u64() != me
                        && !t.is_safepoint_safe()
                        && t.status() != ThreadStatus::New
                        && t.status() != ThreadStatus::Terminated
                })
                .count()
        };
        runtime.safepoint().begin(&required);

        self.owner.store(me, Ordering::Release);
        self.nested_allowed
            .store(op.allows_nested(), Ordering::Release);
        self.depth.store(1, Ordering::Release);

        {
            let mut world = SafepointWorld { runtime, threads };
            op.doit(&mut world);
        }

        self.depth.store(0, Ordering::Release);
        self.nested_allowed.store(false, Ordering::Release);
        self.owner.store(0, Ordering::Release);

        runtime.safepoint().end();
        drop(handle);
        drop(guard);
        log::debug!("VM operation {} complete, world resumed", op.name());

        op.doit_epilogue();
        self.executed.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn execute_nested(
        &self,
        runtime: &RuntimeState,
        requester: &Arc<VmThread>,
        op: &mut dyn VmOperation,
    ) -> bool {
        assert!(
            self.nested_allowed.load(Ordering::Acquire),
            "nested VM operation {} requested inside an operation that forbids nesting",
            op.name()
        );
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        assert!(
            depth <= MAX_NESTED_SAFEPOINT_DEPTH,
            "VM operation nesting exceeds {MAX_NESTED_SAFEPOINT_DEPTH}"
        );

        if !op.doit_prologue() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return false;
        }

        log::debug!("VM operation {} running nested at depth {depth}", op.name());
        let saved = self
            .nested_allowed
            .swap(op.allows_nested(), Ordering::AcqRel);
        {
            // The world is already stopped; a fresh stable list keeps the
            // snapshot alive independently of the outer operation's.
            let handle = runtime.threads().acquire_stable_list(requester);
            let mut world = SafepointWorld {
                runtime,
                threads: handle.threads(),
            };
            op.doit(&mut world);
        }
        self.nested_allowed.store(saved, Ordering::Release);
        self.depth.fetch_sub(1, Ordering::AcqRel);

        op.doit_epilogue();
        self.executed.fetch_add(1, Ordering::Relaxed);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{RuntimeOptions, RuntimeState};

    struct CountingOp {
        name: &'static str,
        ran: bool,
        seen_threads: usize,
        cancel: bool,
        epilogue_ran: bool,
    }

    impl CountingOp {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                ran: false,
                seen_threads: 0,
                cancel: false,
                epilogue_ran: false,
            }
        }
    }

    impl VmOperation for CountingOp {
        fn name(&self) -> &'static str {
            self.name
        }

        fn doit_prologue(&mut self) -> bool {
            !self.cancel
        }

        fn doit(&mut self, world: &mut SafepointWorld<'_>) {
            self.ran = true;
            self.seen_threads = world.threads().len();
        }

        fn doit_epilogue(&mut self) {
            self.epilogue_ran = true;
        }
    }

    #[test]
    fn test_execute_runs_all_phases() {
        let runtime = RuntimeState::new(RuntimeOptions::default());
        let requester = runtime.attach_thread("requester");

        let mut op = CountingOp::new("counting");
        assert!(runtime.executor().execute(&runtime, &requester, &mut op));
        assert!(op.ran);
        assert!(op.epilogue_ran);
        assert_eq!(op.seen_threads, 1);
        assert_eq!(runtime.executor().executed_count(), 1);
    }

    #[test]
    fn test_prologue_can_cancel() {
        let runtime = RuntimeState::new(RuntimeOptions::default());
        let requester = runtime.attach_thread("requester");

        let mut op = CountingOp::new("cancelled");
        op.cancel = true;
        assert!(!runtime.executor().execute(&runtime, &requester, &mut op));
        assert!(!op.ran);
        assert!(!op.epilogue_ran);
        assert_eq!(runtime.executor().executed_count(), 0);
    }

    struct OuterOp {
        inner_ran: bool,
    }

    impl VmOperation for OuterOp {
        fn name(&self) -> &'static str {
            "outer"
        }

        fn allows_nested(&self) -> bool {
            true
        }

        fn doit(&mut self, world: &mut SafepointWorld<'_>) {
            let runtime = world.runtime();
            let requester = world
                .threads()
                .iter()
                .find(|t| t.name() == "requester")
                .unwrap()
                .clone();
            let mut inner = CountingOp::new("inner");
            assert!(runtime.executor().execute(runtime, &requester, &mut inner));
            self.inner_ran = inner.ran;
        }
    }

    #[test]
    fn test_nested_operation_runs_inline() {
        let runtime = RuntimeState::new(RuntimeOptions::default());
        let requester = runtime.attach_thread("requester");

        let mut op = OuterOp { inner_ran: false };
        assert!(runtime.executor().execute(&runtime, &requester, &mut op));
        assert!(op.inner_ran);
        assert_eq!(runtime.executor().executed_count(), 2);
    }
}
