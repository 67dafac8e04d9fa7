//! Top-level runtime state wiring the subsystems together

use crate::alloc::ObjectAllocator;
use crate::class::ClassRegistry;
use crate::heap::{Heap, SimpleHeap};
use crate::object::ObjectId;
use crate::safepoint::{SafepointCoordinator, VmOperationExecutor};
use crate::sync::MonitorRegistry;
use crate::threads::{ThreadRegistry, VmThread};
use parking_lot::Mutex;
use std::sync::Arc;

/// Construction-time runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Heap byte limit (0 = unlimited)
    pub max_heap_bytes: usize,
    /// Frame depth captured by thread dumps (0 = unlimited)
    pub max_dump_frame_depth: usize,
    /// Register finalizable objects at class-init time instead of per
    /// allocation
    pub register_finalizers_at_init: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_heap_bytes: 0,
            max_dump_frame_depth: 1024,
            register_finalizers_at_init: false,
        }
    }
}

/// Shared state of one runtime instance
pub struct RuntimeState {
    options: RuntimeOptions,
    classes: ClassRegistry,
    threads: ThreadRegistry,
    monitors: MonitorRegistry,
    heap: Arc<SimpleHeap>,
    allocator: ObjectAllocator,
    safepoint: SafepointCoordinator,
    executor: VmOperationExecutor,
    /// JNI-style global handles, dumped as roots
    globals: Mutex<Vec<ObjectId>>,
}

impl RuntimeState {
    /// Create a runtime with the given options
    pub fn new(options: RuntimeOptions) -> Self {
        let heap = Arc::new(SimpleHeap::with_limit(options.max_heap_bytes));
        let allocator = ObjectAllocator::new(heap.clone())
            .with_eager_finalizer_registration(options.register_finalizers_at_init);
        Self {
            options,
            classes: ClassRegistry::new(),
            threads: ThreadRegistry::new(),
            monitors: MonitorRegistry::new(),
            heap,
            allocator,
            safepoint: SafepointCoordinator::new(),
            executor: VmOperationExecutor::new(),
            globals: Mutex::new(Vec::new()),
        }
    }

    /// Runtime configuration
    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Loaded-class registry
    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    /// SMR-protected thread registry
    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    /// Monitor and lock-ownership registry
    pub fn monitors(&self) -> &MonitorRegistry {
        &self.monitors
    }

    /// The heap collaborator
    pub fn heap(&self) -> &Arc<SimpleHeap> {
        &self.heap
    }

    /// The heap as its trait object, for allocator-style consumers
    pub fn heap_dyn(&self) -> Arc<dyn Heap> {
        self.heap.clone()
    }

    /// Object allocator
    pub fn allocator(&self) -> &ObjectAllocator {
        &self.allocator
    }

    /// Safepoint coordinator
    pub fn safepoint(&self) -> &SafepointCoordinator {
        &self.safepoint
    }

    /// VM operation executor
    pub fn executor(&self) -> &VmOperationExecutor {
        &self.executor
    }

    /// Create a mutator thread and register it with the thread list
    pub fn attach_thread(&self, name: impl Into<String>) -> Arc<VmThread> {
        let thread = VmThread::new(name);
        self.threads.attach(&thread);
        self.threads.add_thread(&thread);
        thread
    }

    /// Unregister a mutator; blocks until no stable-list holder can still
    /// reach it
    pub fn detach_thread(&self, thread: &Arc<VmThread>) {
        self.threads.remove_thread(thread);
    }

    /// Publish a global handle (kept alive and dumped as a root)
    pub fn add_global(&self, object: ObjectId) {
        self.globals.lock().push(object);
    }

    /// Copy of the current global handles
    pub fn globals_snapshot(&self) -> Vec<ObjectId> {
        self.globals.lock().clone()
    }
}
