//! Per-thread stack and lock snapshots
//!
//! Snapshots are owning copies taken at a safepoint; they stay valid after
//! the world resumes and the live frames start mutating again.

use crate::class::MethodId;
use crate::object::ObjectId;
use crate::sync::{MonitorId, MonitorRegistry};
use crate::threads::{ThreadId, ThreadStatus, VmThread};
use std::sync::Arc;

/// A captured stack frame
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    /// Executing method
    pub method: MethodId,
    /// Bytecode offset at capture time
    pub bci: u32,
    /// Monitors this frame holds (empty unless requested)
    pub locked_monitors: Vec<MonitorId>,
}

/// A captured view of one thread
#[derive(Debug, Clone)]
pub struct ThreadSnapshot {
    /// Thread identity
    pub thread: ThreadId,
    /// Thread name at capture time
    pub name: String,
    /// Scheduling status at capture time
    pub status: ThreadStatus,
    /// Monitor the thread was blocked on, if any
    pub blocked_on_monitor: Option<MonitorId>,
    /// Internal lock the thread was blocked on, if any
    pub blocked_on_raw_lock: Option<u64>,
    /// Park blocker, if parked
    pub park_blocker: Option<ObjectId>,
    /// All monitors owned by the thread
    pub owned_monitors: Vec<MonitorId>,
    /// Stack frames, top first
    pub frames: Vec<FrameSnapshot>,
}

impl ThreadSnapshot {
    /// Stack depth captured
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

/// Capture stacks and lock state for every thread in `threads`.
///
/// `max_depth` limits frames per thread (0 = unlimited). Monitor ownership
/// per frame is only recorded when `with_monitors` is set; it requires a
/// registry scan per thread.
pub fn dump_stack_traces(
    threads: &[Arc<VmThread>],
    monitors: &MonitorRegistry,
    max_depth: usize,
    with_monitors: bool,
) -> Vec<ThreadSnapshot> {
    threads
        .iter()
        .map(|thread| {
            let frames = thread
                .frames_snapshot(max_depth)
                .into_iter()
                .map(|frame| FrameSnapshot {
                    method: frame.method,
                    bci: frame.bci,
                    locked_monitors: if with_monitors {
                        frame.monitors.clone()
                    } else {
                        Vec::new()
                    },
                })
                .collect();
            ThreadSnapshot {
                thread: thread.id(),
                name: thread.name().to_owned(),
                status: thread.status(),
                blocked_on_monitor: thread.blocked_on_monitor(),
                blocked_on_raw_lock: thread.blocked_on_raw_lock(),
                park_blocker: thread.park_blocker(),
                owned_monitors: if with_monitors {
                    monitors.owned_by(thread.id())
                } else {
                    Vec::new()
                },
                frames,
            }
        })
        .collect()
}
