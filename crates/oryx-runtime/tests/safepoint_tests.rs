//! Integration tests for safepoints and VM operations

use oryx_runtime::runtime::{RuntimeOptions, RuntimeState};
use oryx_runtime::safepoint::{SafepointWorld, VmOperation, MAX_NESTED_SAFEPOINT_DEPTH};
use oryx_runtime::threads::ThreadStatus;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct StopTheWorldOp {
    /// Number of threads observed parked at the safepoint during doit
    parked_seen: usize,
    all_stopped: bool,
}

impl VmOperation for StopTheWorldOp {
    fn name(&self) -> &'static str {
        "stop-check"
    }

    fn doit(&mut self, world: &mut SafepointWorld<'_>) {
        let runtime = world.runtime();
        self.parked_seen = runtime.safepoint().parked_count();
        self.all_stopped = world
            .threads()
            .iter()
            .filter(|t| t.status() == ThreadStatus::Runnable)
            .all(|t| t.name() == "requester");
    }
}

#[test]
fn test_operation_stops_all_mutators() {
    init_logging();
    let runtime = Arc::new(RuntimeState::new(RuntimeOptions::default()));
    let requester = runtime.attach_thread("requester");

    let stop = Arc::new(AtomicBool::new(false));
    let running = Arc::new(Barrier::new(5));

    let mut workers = Vec::new();
    for i in 0..4 {
        let runtime = runtime.clone();
        let stop = stop.clone();
        let running = running.clone();
        workers.push(std::thread::spawn(move || {
            let me = runtime.attach_thread(format!("worker-{i}"));
            running.wait();
            while !stop.load(Ordering::Acquire) {
                runtime.safepoint().poll(&me);
                std::hint::spin_loop();
            }
            runtime.detach_thread(&me);
        }));
    }
    running.wait();

    let mut op = StopTheWorldOp {
        parked_seen: 0,
        all_stopped: false,
    };
    assert!(runtime.executor().execute(&runtime, &requester, &mut op));
    assert_eq!(op.parked_seen, 4);
    assert!(op.all_stopped);

    stop.store(true, Ordering::Release);
    for w in workers {
        w.join().unwrap();
    }
}

struct NestingOp {
    remaining: usize,
    deepest: Arc<AtomicUsize>,
}

impl VmOperation for NestingOp {
    fn name(&self) -> &'static str {
        "nesting"
    }

    fn allows_nested(&self) -> bool {
        true
    }

    fn doit(&mut self, world: &mut SafepointWorld<'_>) {
        self.deepest.fetch_add(1, Ordering::SeqCst);
        if self.remaining == 0 {
            return;
        }
        let runtime = world.runtime();
        let requester = world
            .threads()
            .iter()
            .find(|t| t.name() == "requester")
            .unwrap()
            .clone();
        let mut inner = NestingOp {
            remaining: self.remaining - 1,
            deepest: self.deepest.clone(),
        };
        assert!(runtime.executor().execute(runtime, &requester, &mut inner));
    }
}

#[test]
fn test_nested_operations_run_inline_up_to_depth_limit() {
    let runtime = RuntimeState::new(RuntimeOptions::default());
    let requester = runtime.attach_thread("requester");

    let deepest = Arc::new(AtomicUsize::new(0));
    let mut op = NestingOp {
        remaining: MAX_NESTED_SAFEPOINT_DEPTH - 1,
        deepest: deepest.clone(),
    };
    assert!(runtime.executor().execute(&runtime, &requester, &mut op));
    assert_eq!(
        deepest.load(Ordering::SeqCst),
        MAX_NESTED_SAFEPOINT_DEPTH
    );
    // One world-stop served the whole nest.
    assert_eq!(runtime.safepoint().stats.total_safepoints(), 1);
}

#[test]
fn test_blocked_threads_do_not_delay_safepoint() {
    let runtime = Arc::new(RuntimeState::new(RuntimeOptions::default()));
    let requester = runtime.attach_thread("requester");

    // A thread blocked on a contended monitor marks itself safepoint-safe
    // and is not waited for.
    let object = oryx_runtime::object::ObjectId::new();
    let monitor = runtime.monitors().monitor_for(object);
    monitor.enter(&requester);

    let started = Arc::new(Barrier::new(2));
    let blocked = {
        let runtime = runtime.clone();
        let monitor = monitor.clone();
        let started = started.clone();
        std::thread::spawn(move || {
            let me = runtime.attach_thread("blocked");
            started.wait();
            monitor.enter(&me); // blocks until the requester exits
            monitor.exit(&me).unwrap();
            runtime.detach_thread(&me);
        })
    };
    started.wait();
    // Give the blocked thread time to actually park on the monitor.
    while monitor.owner() == Some(requester.id())
        && runtime
            .threads()
            .acquire_stable_list(&requester)
            .threads()
            .iter()
            .all(|t| t.status() != ThreadStatus::BlockedOnMonitor)
    {
        std::thread::yield_now();
    }

    let mut op = StopTheWorldOp {
        parked_seen: 0,
        all_stopped: false,
    };
    // Completes even though "blocked" never polls.
    assert!(runtime.executor().execute(&runtime, &requester, &mut op));

    monitor.exit(&requester).unwrap();
    blocked.join().unwrap();
}

struct SequencedOp {
    order: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    label: &'static str,
}

impl VmOperation for SequencedOp {
    fn name(&self) -> &'static str {
        "sequenced"
    }

    fn doit(&mut self, _world: &mut SafepointWorld<'_>) {
        self.order.lock().push(self.label);
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_concurrent_operations_are_serialized() {
    init_logging();
    let runtime = Arc::new(RuntimeState::new(RuntimeOptions::default()));
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let handles: Vec<_> = ["first", "second", "third"]
        .into_iter()
        .map(|label| {
            let runtime = runtime.clone();
            let order = order.clone();
            std::thread::spawn(move || {
                let me = runtime.attach_thread(format!("requester-{label}"));
                let mut op = SequencedOp { order, label };
                assert!(runtime.executor().execute(&runtime, &me, &mut op));
                runtime.detach_thread(&me);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(order.lock().len(), 3);
    assert_eq!(runtime.executor().executed_count(), 3);
}

#[test]
fn test_detach_during_pending_operation_does_not_stall_the_world() {
    init_logging();
    let runtime = Arc::new(RuntimeState::new(RuntimeOptions::default()));
    let requester = runtime.attach_thread("requester");

    let attached = Arc::new(Barrier::new(3));

    // A mutator that only reaches its poll after a delay keeps the pause
    // pending long enough for the detach below to race it.
    let late = {
        let runtime = runtime.clone();
        let attached = attached.clone();
        std::thread::spawn(move || {
            let me = runtime.attach_thread("late-poller");
            attached.wait();
            std::thread::sleep(Duration::from_millis(150));
            runtime.safepoint().poll(&me);
            runtime.detach_thread(&me);
        })
    };

    // A thread that detaches itself while the stop-the-world is pending.
    // The operation's own stable list keeps the old snapshot (which still
    // contains it) alive, so the detach must drain against a live pause.
    let detacher = {
        let runtime = runtime.clone();
        let attached = attached.clone();
        std::thread::spawn(move || {
            let me = runtime.attach_thread("detacher");
            attached.wait();
            std::thread::sleep(Duration::from_millis(50));
            runtime.detach_thread(&me);
        })
    };

    attached.wait();
    let mut op = StopTheWorldOp {
        parked_seen: 0,
        all_stopped: false,
    };
    assert!(runtime.executor().execute(&runtime, &requester, &mut op));

    late.join().unwrap();
    detacher.join().unwrap();
    assert_eq!(runtime.threads().live_count(), 1);
}
