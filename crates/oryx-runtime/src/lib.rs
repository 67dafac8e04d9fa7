//! Oryx Managed-Object Runtime Core
//!
//! This crate provides the core of a managed-object virtual machine:
//! - Class metadata with a race-safe class-initialization state machine
//! - Object and array allocation over an external heap collaborator
//! - SMR (hazard-pointer) protected, lock-free thread enumeration
//! - Cooperative safepoints and stop-the-world VM operations
//! - Diagnostics built on the above: deadlock detection, thread dumps and
//!   binary heap dumps
//!
//! Execution engine, garbage collection and class file parsing live in
//! their own layers; this crate only defines the runtime substrate they
//! plug into.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod alloc;
pub mod class;
pub mod diagnostics;
pub mod heap;
pub mod object;
pub mod runtime;
pub mod safepoint;
pub mod sync;
pub mod threads;

pub use alloc::{AllocError, ObjectAllocator};
pub use class::{ClassError, ClassId, ClassMetadata, ClassRegistry, InitState, VmException};
pub use diagnostics::{
    dump_heap, dump_stack_traces, find_deadlocks, DeadlockCycle, HeapDumpOperation, ThreadSnapshot,
};
pub use heap::{Heap, HeapError, HeapObject, SimpleHeap};
pub use object::ObjectId;
pub use runtime::{RuntimeOptions, RuntimeState};
pub use safepoint::{SafepointCoordinator, SafepointWorld, VmOperation, VmOperationExecutor};
pub use sync::{Monitor, MonitorRegistry};
pub use threads::{StableListHandle, ThreadId, ThreadRegistry, VmThread};
