//! Class registry for managing runtime class metadata

use crate::class::metadata::{ClassId, ClassMetadata};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Registry of all loaded classes
///
/// Registration is the `Allocated -> Loaded` transition: inserting a class
/// makes it part of the class hierarchy and visible to diagnostics.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// Classes in registration order
    classes: Vec<Arc<ClassMetadata>>,
    /// Class ID to slot mapping
    by_id: FxHashMap<ClassId, usize>,
    /// Class name to slot mapping
    by_name: FxHashMap<String, usize>,
}

impl ClassRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class, moving it to the `Loaded` state.
    pub fn register(&self, class: Arc<ClassMetadata>) -> ClassId {
        let id = class.id();
        class.mark_loaded();
        let mut inner = self.inner.write();
        let slot = inner.classes.len();
        inner.by_id.insert(id, slot);
        inner.by_name.insert(class.name().to_string(), slot);
        inner.classes.push(class);
        id
    }

    /// Register a class that is already past `Allocated` (array classes,
    /// restored classes).
    pub fn register_loaded(&self, class: Arc<ClassMetadata>) -> ClassId {
        let id = class.id();
        let mut inner = self.inner.write();
        let slot = inner.classes.len();
        inner.by_id.insert(id, slot);
        inner.by_name.insert(class.name().to_string(), slot);
        inner.classes.push(class);
        id
    }

    /// Get a class by ID
    pub fn get(&self, id: ClassId) -> Option<Arc<ClassMetadata>> {
        let inner = self.inner.read();
        inner.by_id.get(&id).map(|&slot| inner.classes[slot].clone())
    }

    /// Get a class by name
    pub fn get_by_name(&self, name: &str) -> Option<Arc<ClassMetadata>> {
        let inner = self.inner.read();
        inner
            .by_name
            .get(name)
            .map(|&slot| inner.classes[slot].clone())
    }

    /// Number of registered classes
    pub fn len(&self) -> usize {
        self.inner.read().classes.len()
    }

    /// True when no classes are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all registered classes in registration order.
    ///
    /// Diagnostics take this snapshot at a safepoint so the set cannot
    /// change mid-walk.
    pub fn snapshot(&self) -> Vec<Arc<ClassMetadata>> {
        self.inner.read().classes.clone()
    }
}
