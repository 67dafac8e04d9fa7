//! Integration tests for deadlock detection and thread dumps

use oryx_runtime::class::{ClassId, MethodId};
use oryx_runtime::diagnostics::{dump_stack_traces, find_deadlocks, DeadlockCycle};
use oryx_runtime::runtime::{RuntimeOptions, RuntimeState};
use oryx_runtime::safepoint::{SafepointWorld, VmOperation};
use oryx_runtime::threads::Frame;
use std::sync::Arc;
use std::time::Duration;

/// Detects deadlocks inside a VM operation, the way a management agent
/// would, so lock state cannot change mid-walk.
struct DeadlockScanOp {
    cycles: Vec<DeadlockCycle>,
}

impl VmOperation for DeadlockScanOp {
    fn name(&self) -> &'static str {
        "deadlock-scan"
    }

    fn doit(&mut self, world: &mut SafepointWorld<'_>) {
        self.cycles = find_deadlocks(world.threads(), world.runtime().monitors());
    }
}

#[test]
fn test_real_two_thread_deadlock_is_detected() {
    let runtime = Arc::new(RuntimeState::new(RuntimeOptions::default()));
    let requester = runtime.attach_thread("requester");

    let first = runtime.monitors().monitor_for(oryx_runtime::ObjectId::new());
    let second = runtime.monitors().monitor_for(oryx_runtime::ObjectId::new());

    // Classic lock-order inversion: each thread takes one monitor then
    // blocks forever on the other.
    let spawn_deadlocker = |name: &'static str,
                            mine: Arc<oryx_runtime::Monitor>,
                            theirs: Arc<oryx_runtime::Monitor>| {
        let runtime = runtime.clone();
        std::thread::spawn(move || {
            let me = runtime.attach_thread(name);
            mine.enter(&me);
            std::thread::sleep(Duration::from_millis(50));
            theirs.enter(&me); // never returns
        })
    };
    let _a = spawn_deadlocker("a", first.clone(), second.clone());
    let _b = spawn_deadlocker("b", second.clone(), first.clone());

    // Wait for both to block on their second monitor.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let list = runtime.threads().acquire_stable_list(&requester);
        let blocked = list
            .threads()
            .iter()
            .filter(|t| t.blocked_on_monitor().is_some())
            .count();
        drop(list);
        if blocked == 2 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "deadlock never formed");
        std::thread::yield_now();
    }

    let mut op = DeadlockScanOp { cycles: Vec::new() };
    assert!(runtime.executor().execute(&runtime, &requester, &mut op));

    assert_eq!(op.cycles.len(), 1);
    let mut names: Vec<_> = op.cycles[0]
        .threads()
        .iter()
        .map(|t| t.name().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

    // The deadlocked threads are parked forever; leak them rather than join.
}

#[test]
fn test_no_deadlock_reported_for_plain_contention() {
    let runtime = Arc::new(RuntimeState::new(RuntimeOptions::default()));
    let requester = runtime.attach_thread("requester");

    let monitor = runtime.monitors().monitor_for(oryx_runtime::ObjectId::new());
    monitor.enter(&requester);

    let waiter = {
        let runtime = runtime.clone();
        let monitor = monitor.clone();
        std::thread::spawn(move || {
            let me = runtime.attach_thread("waiter");
            monitor.enter(&me);
            monitor.exit(&me).unwrap();
            runtime.detach_thread(&me);
        })
    };
    // Let the waiter block.
    std::thread::sleep(Duration::from_millis(50));

    let mut op = DeadlockScanOp { cycles: Vec::new() };
    assert!(runtime.executor().execute(&runtime, &requester, &mut op));
    assert!(op.cycles.is_empty());

    monitor.exit(&requester).unwrap();
    waiter.join().unwrap();
}

struct ThreadDumpOp {
    snapshots: Vec<oryx_runtime::ThreadSnapshot>,
    max_depth: usize,
}

impl VmOperation for ThreadDumpOp {
    fn name(&self) -> &'static str {
        "thread-dump"
    }

    fn doit(&mut self, world: &mut SafepointWorld<'_>) {
        self.snapshots = dump_stack_traces(
            world.threads(),
            world.runtime().monitors(),
            self.max_depth,
            true,
        );
    }
}

#[test]
fn test_thread_dump_captures_frames_and_monitors() {
    let runtime = RuntimeState::new(RuntimeOptions::default());
    let requester = runtime.attach_thread("requester");

    let monitor = runtime.monitors().monitor_for(oryx_runtime::ObjectId::new());
    monitor.enter(&requester);
    requester.push_frame(Frame {
        method: MethodId {
            class: ClassId::new(),
            index: 3,
        },
        bci: 42,
        monitors: vec![monitor.id()],
        refs: Vec::new(),
    });

    let mut op = ThreadDumpOp {
        snapshots: Vec::new(),
        max_depth: runtime.options().max_dump_frame_depth,
    };
    assert!(runtime.executor().execute(&runtime, &requester, &mut op));

    assert_eq!(op.snapshots.len(), 1);
    let snap = &op.snapshots[0];
    assert_eq!(snap.name, "requester");
    assert_eq!(snap.frames.len(), 1);
    assert_eq!(snap.frames[0].bci, 42);
    assert_eq!(snap.frames[0].locked_monitors, vec![monitor.id()]);
    assert_eq!(snap.owned_monitors, vec![monitor.id()]);

    // The snapshot stays valid after the live thread moves on.
    requester.pop_frame();
    assert_eq!(snap.frames.len(), 1);
}
