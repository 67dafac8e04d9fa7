//! Object identity for heap-allocated values

use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identity of a heap object
///
/// Assigned once at allocation and stable for the object's lifetime; the
/// heap dump uses it as the object record key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Generate a new unique object ID
    pub fn new() -> Self {
        static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The null object identity
    pub const NULL: ObjectId = ObjectId(0);

    /// True for the null identity
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Raw numeric value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild an identity from its raw value (dump readers, test fixtures)
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}
