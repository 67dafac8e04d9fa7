//! Synchronization primitives tracked for diagnostics

pub mod monitor;
pub mod registry;

pub use monitor::{Monitor, MonitorError, MonitorId};
pub use registry::MonitorRegistry;
