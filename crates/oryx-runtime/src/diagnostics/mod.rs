//! Runtime diagnostics: deadlock detection, thread dumps, heap dumps
//!
//! Everything here consumes quiesced state. The entry points either take a
//! [`crate::safepoint::SafepointWorld`] or an explicit thread snapshot the
//! caller obtained inside a VM operation.

pub mod deadlock;
pub mod heap_dump;
pub mod thread_dump;

pub use deadlock::{find_deadlocks, DeadlockCycle};
pub use heap_dump::{
    dump_heap, read_dump, DumpStats, HeapDumpOperation, HeapDumpSummary, DUMP_MAGIC, DUMP_VERSION,
};
pub use thread_dump::{dump_stack_traces, FrameSnapshot, ThreadSnapshot};
