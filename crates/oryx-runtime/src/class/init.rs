//! Class initialization state machine
//!
//! States move monotonically:
//!
//! ```text
//! Allocated -> Loaded -> Linked -> BeingInitialized -> FullyInitialized
//!                                                   \-> InitializationError
//! ```
//!
//! Initialization is keyed to the *logical* initializing thread: a recursive
//! `initialize()` from the thread that is already running the class's
//! initializer returns immediately instead of deadlocking, while every other
//! thread blocks on the per-class init monitor in a wait-notify loop until
//! the state changes. Both failure states are sticky: once a class fails to
//! link or initialize it never retries, and every later caller observes the
//! same deterministic failure.

use crate::class::metadata::{ClassMetadata, ClassSupport};
use crate::class::ClassError;
use crate::threads::ThreadId;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

/// Initialization state of a class
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum InitState {
    /// Created by the loader, not yet in the class hierarchy
    Allocated = 0,
    /// Registered in the class hierarchy
    Loaded = 1,
    /// Verified, rewritten, dispatch tables built
    Linked = 2,
    /// A thread is currently running the initializer
    BeingInitialized = 3,
    /// Terminal success state
    FullyInitialized = 4,
    /// Terminal sticky failure state
    InitializationError = 5,
}

impl InitState {
    pub(crate) fn from_u8(raw: u8) -> InitState {
        match raw {
            0 => InitState::Allocated,
            1 => InitState::Loaded,
            2 => InitState::Linked,
            3 => InitState::BeingInitialized,
            4 => InitState::FullyInitialized,
            5 => InitState::InitializationError,
            _ => unreachable!("invalid init state {raw}"),
        }
    }
}

/// An exception thrown by a class initializer body.
///
/// `Error`-kinded exceptions propagate unwrapped; anything else is wrapped
/// in an `ExceptionInInitializer` for the triggering class.
#[derive(Debug, Clone)]
pub struct VmException {
    /// Whether the exception is an Error subtype
    pub is_error: bool,
    /// Human-readable message
    pub message: String,
}

impl VmException {
    /// A plain (non-Error) exception
    pub fn exception(message: impl Into<String>) -> Self {
        Self {
            is_error: false,
            message: message.into(),
        }
    }

    /// An Error-kinded exception
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            message: message.into(),
        }
    }
}

/// Per-class init monitor.
///
/// Held in an `Option` so the reference can be cleared once the class
/// reaches a terminal state; the fast path never touches it again.
#[derive(Debug, Default)]
pub struct InitMonitor {
    pub(crate) lock: Mutex<()>,
    pub(crate) cond: Condvar,
}

impl InitMonitor {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl ClassMetadata {
    /// Mark the class as inserted into the class hierarchy.
    ///
    /// Called by the loader/registry; `Allocated -> Loaded`.
    pub fn mark_loaded(&self) {
        debug_assert_eq!(self.init_state(), InitState::Allocated);
        self.init_state
            .store(InitState::Loaded as u8, Ordering::Release);
    }

    /// Link the class: verify, rewrite, and build dispatch tables.
    ///
    /// The superclass and all directly declared interfaces are linked first
    /// (supertypes are already loaded, so the recursion is cycle-free).
    /// Linking is idempotent, and a link failure is terminal for the class.
    pub fn link(self: &Arc<Self>, support: &dyn ClassSupport) -> Result<(), ClassError> {
        if self.init_state() >= InitState::Linked {
            return self.check_not_failed();
        }

        if let Some(s) = self.super_class() {
            s.link(support)?;
        }
        for iface in self.interfaces() {
            iface.link(support)?;
        }

        let monitor = match self.init_monitor_handle() {
            Some(m) => m,
            // Monitor already cleared means a terminal state was reached.
            None => return self.check_not_failed(),
        };
        let _guard = monitor.lock.lock();

        // Re-check under the lock; another thread may have linked us.
        match self.init_state() {
            InitState::Allocated => {
                return Err(ClassError::Linkage {
                    class: self.name().to_string(),
                    reason: "class is not loaded".to_string(),
                })
            }
            InitState::Loaded => {}
            InitState::InitializationError => {
                return Err(ClassError::NoClassDefFound {
                    class: self.name().to_string(),
                })
            }
            _ => return Ok(()),
        }

        if let Err(reason) = support.verify(self) {
            self.record_failure(format!("verification failed: {reason}"));
            self.init_state
                .store(InitState::InitializationError as u8, Ordering::Release);
            monitor.cond.notify_all();
            return Err(ClassError::Verify {
                class: self.name().to_string(),
                reason,
            });
        }

        // Rewriting runs exactly once even if linking is raced.
        if self.mark_rewritten_once() {
            support.rewrite_bytecode(self);
        }

        let layout = self.compute_layout();
        let vtable = support.build_vtable(self);
        let itable = support.build_itable(self);
        self.install_link_products(layout, vtable, itable);

        self.init_state
            .store(InitState::Linked as u8, Ordering::Release);
        Ok(())
    }

    /// Run the class initializer, observing the full state-machine contract.
    ///
    /// * Already `FullyInitialized`: returns immediately (lock-free fast
    ///   path; the acquire load pairs with the release that cleared the
    ///   init monitor).
    /// * Another thread is initializing: blocks on the init monitor until
    ///   the state changes, then re-evaluates.
    /// * The *same* thread is initializing (recursive trigger from the
    ///   initializer body): returns immediately.
    /// * Sticky failure: fails with a deterministic `NoClassDefFound`.
    ///
    /// The superclass and every superinterface declaring concrete instance
    /// methods are initialized depth-first before this class's own
    /// initializer body runs.
    pub fn initialize(
        self: &Arc<Self>,
        thread: ThreadId,
        support: &dyn ClassSupport,
    ) -> Result<(), ClassError> {
        // Fast path: the acquire load orders the state read before any
        // subsequent read of initialized statics.
        if self.init_state() == InitState::FullyInitialized {
            return Ok(());
        }

        self.link(support)?;

        let monitor = match self.init_monitor_handle() {
            Some(m) => m,
            None => return self.check_not_failed(),
        };

        {
            let mut guard = monitor.lock.lock();
            loop {
                match self.init_state() {
                    InitState::BeingInitialized => {
                        if self.initializing_thread() == thread.as_u64() {
                            // Recursive initialization from the owning
                            // thread; the body is already running above us.
                            return Ok(());
                        }
                        monitor.cond.wait(&mut guard);
                    }
                    InitState::FullyInitialized => return Ok(()),
                    InitState::InitializationError => {
                        return Err(ClassError::NoClassDefFound {
                            class: self.name().to_string(),
                        })
                    }
                    InitState::Linked => break,
                    state => unreachable!("initialize() saw {state:?} after link"),
                }
            }

            self.init_thread.store(thread.as_u64(), Ordering::Release);
            self.init_state
                .store(InitState::BeingInitialized as u8, Ordering::Release);
        }

        // Supertypes first, outside the monitor so unrelated waiters are not
        // blocked behind the whole supertype chain.
        if let Err(err) = self.initialize_supertypes(thread, support) {
            self.fail_initialization(&monitor, err.to_string());
            return Err(err);
        }

        let result = {
            let body = self.initializer.lock();
            match body.as_ref() {
                Some(body) => body(self),
                None => Ok(()),
            }
        };

        match result {
            Ok(()) => {
                {
                    let _guard = monitor.lock.lock();
                    self.init_thread.store(0, Ordering::Release);
                    self.init_state
                        .store(InitState::FullyInitialized as u8, Ordering::Release);
                    monitor.cond.notify_all();
                }
                // The store-store fence orders the terminal-state write
                // before the monitor clear, so no thread can observe a
                // cleared monitor paired with a non-terminal state.
                fence(Ordering::Release);
                *self.init_monitor.write() = None;
                Ok(())
            }
            Err(exc) => {
                let err = if exc.is_error {
                    ClassError::InitializerError {
                        class: self.name().to_string(),
                        message: exc.message,
                    }
                } else {
                    // Non-Error exceptions are wrapped for the triggering
                    // class only.
                    ClassError::ExceptionInInitializer {
                        class: self.name().to_string(),
                        message: exc.message,
                    }
                };
                self.fail_initialization(&monitor, err.to_string());
                Err(err)
            }
        }
    }

    /// Initialize the superclass and all superinterfaces that declare
    /// concrete instance methods, depth-first.
    fn initialize_supertypes(
        self: &Arc<Self>,
        thread: ThreadId,
        support: &dyn ClassSupport,
    ) -> Result<(), ClassError> {
        if let Some(s) = self.super_class() {
            if let Err(err) = s.initialize(thread, support) {
                return Err(ClassError::SupertypeFailed {
                    class: self.name().to_string(),
                    supertype: s.name().to_string(),
                    source: Box::new(err),
                });
            }
        }
        for iface in self.transitive_interfaces() {
            if iface.declares_concrete_instance_methods() {
                if let Err(err) = iface.initialize(thread, support) {
                    return Err(ClassError::SupertypeFailed {
                        class: self.name().to_string(),
                        supertype: iface.name().to_string(),
                        source: Box::new(err),
                    });
                }
            }
        }
        Ok(())
    }

    /// Record a terminal initialization failure and wake all waiters.
    fn fail_initialization(&self, monitor: &InitMonitor, reason: String) {
        self.record_failure(reason);
        let _guard = monitor.lock.lock();
        self.init_thread.store(0, Ordering::Release);
        self.init_state
            .store(InitState::InitializationError as u8, Ordering::Release);
        monitor.cond.notify_all();
    }

    fn record_failure(&self, reason: String) {
        let mut failure = self.init_failure.lock();
        if failure.is_none() {
            *failure = Some(reason);
        }
    }

    /// First recorded failure reason, for diagnostics.
    pub fn init_failure_reason(&self) -> Option<String> {
        self.init_failure.lock().clone()
    }

    fn check_not_failed(&self) -> Result<(), ClassError> {
        if self.init_state() == InitState::InitializationError {
            Err(ClassError::NoClassDefFound {
                class: self.name().to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Fetch the init monitor, pairing the read with the release fence that
    /// precedes the monitor clear on the success path.
    fn init_monitor_handle(&self) -> Option<Arc<InitMonitor>> {
        let handle = self.init_monitor.read().clone();
        fence(Ordering::Acquire);
        handle
    }
}
