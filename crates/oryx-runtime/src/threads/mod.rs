//! Thread tracking and SMR-protected thread listing
//!
//! Any thread can enumerate "all live threads" without holding a global
//! lock, even while another thread is being destroyed; see
//! [`registry::ThreadRegistry`] for the hazard-pointer protocol.

pub mod list;
pub mod registry;
pub mod thread;

pub use list::ThreadSnapshotList;
pub use registry::{StableListHandle, ThreadRegistry};
pub use thread::{Frame, ThreadId, ThreadStatus, VmThread};
