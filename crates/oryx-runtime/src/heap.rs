//! Heap collaborator interface
//!
//! The garbage-collected heap is an external collaborator: the runtime core
//! only needs to allocate raw storage for instances and arrays and to walk
//! every live object for diagnostics. [`SimpleHeap`] is a straightforward
//! reference implementation used by tests and the heap dump walk.

use crate::class::{ClassId, ClassMetadata, FieldKind};
use crate::object::ObjectId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Allocation failures reported by the heap collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    /// The heap could not satisfy the request
    #[error("Out of memory: requested {requested} bytes, {used} of {limit} in use")]
    OutOfMemory {
        /// Requested allocation size in bytes
        requested: usize,
        /// Bytes currently allocated
        used: usize,
        /// Configured heap limit in bytes
        limit: usize,
    },
}

/// Payload of a live heap object, as seen by diagnostics
#[derive(Debug, Clone)]
pub enum ObjectBody {
    /// A plain instance: one raw slot per declared field chain entry
    Instance {
        /// Raw field slot values; reference slots hold `ObjectId` values
        fields: Vec<u64>,
    },
    /// An array of references
    ObjArray {
        /// Element object identities
        elements: Vec<ObjectId>,
    },
    /// An array of primitives
    PrimArray {
        /// Element kind
        elem: FieldKind,
        /// Raw element bytes
        data: Vec<u8>,
    },
}

/// A live heap object
#[derive(Debug, Clone)]
pub struct HeapObject {
    /// Object identity
    pub id: ObjectId,
    /// Class of the object
    pub class: ClassId,
    /// Total size in bytes, including headers
    pub size: usize,
    /// Object payload
    pub body: ObjectBody,
}

/// External heap collaborator consumed by the allocator and diagnostics
pub trait Heap: Send + Sync {
    /// Allocate zeroed storage for an instance of `class`
    fn allocate_object(&self, class: &ClassMetadata, size: usize) -> Result<ObjectId, HeapError>;

    /// Allocate zeroed storage for an array of `length` elements
    fn allocate_array(
        &self,
        class: &ClassMetadata,
        elem: FieldKind,
        size: usize,
        length: usize,
    ) -> Result<ObjectId, HeapError>;

    /// Visit every live object.
    ///
    /// Callers must hold the world stopped (or an equivalent heap-quiescence
    /// guarantee) for the walk to be consistent.
    fn iterate_objects(&self, visitor: &mut dyn FnMut(&HeapObject));

    /// Total bytes currently allocated
    fn allocated_bytes(&self) -> usize;
}

/// Reference heap: an allocation list with byte accounting and an optional
/// size limit. No reclamation; collection is out of scope here.
#[derive(Debug, Default)]
pub struct SimpleHeap {
    objects: Mutex<Vec<HeapObject>>,
    allocated: AtomicUsize,
    max_bytes: usize,
}

impl SimpleHeap {
    /// Create an unbounded heap
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a heap with a byte limit (0 = unlimited)
    pub fn with_limit(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            ..Self::default()
        }
    }

    fn reserve(&self, size: usize) -> Result<(), HeapError> {
        let used = self.allocated.load(Ordering::Acquire);
        if self.max_bytes > 0 && used + size > self.max_bytes {
            return Err(HeapError::OutOfMemory {
                requested: size,
                used,
                limit: self.max_bytes,
            });
        }
        self.allocated.fetch_add(size, Ordering::AcqRel);
        Ok(())
    }

    /// Number of live objects
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Store a raw field slot value (test fixture support)
    pub fn set_field(&self, obj: ObjectId, index: usize, value: u64) {
        let mut objects = self.objects.lock();
        if let Some(o) = objects.iter_mut().find(|o| o.id == obj) {
            if let ObjectBody::Instance { fields } = &mut o.body {
                if index < fields.len() {
                    fields[index] = value;
                }
            }
        }
    }

    /// Store a reference array element (test fixture support)
    pub fn set_element(&self, obj: ObjectId, index: usize, value: ObjectId) {
        let mut objects = self.objects.lock();
        if let Some(o) = objects.iter_mut().find(|o| o.id == obj) {
            if let ObjectBody::ObjArray { elements } = &mut o.body {
                if index < elements.len() {
                    elements[index] = value;
                }
            }
        }
    }
}

impl Heap for SimpleHeap {
    fn allocate_object(&self, class: &ClassMetadata, size: usize) -> Result<ObjectId, HeapError> {
        self.reserve(size)?;
        let id = ObjectId::new();
        let slots = total_field_slots(class);
        self.objects.lock().push(HeapObject {
            id,
            class: class.id(),
            size,
            body: ObjectBody::Instance {
                fields: vec![0; slots],
            },
        });
        Ok(id)
    }

    fn allocate_array(
        &self,
        class: &ClassMetadata,
        elem: FieldKind,
        size: usize,
        length: usize,
    ) -> Result<ObjectId, HeapError> {
        self.reserve(size)?;
        let id = ObjectId::new();
        let body = match elem {
            FieldKind::Reference => ObjectBody::ObjArray {
                elements: vec![ObjectId::NULL; length],
            },
            kind => ObjectBody::PrimArray {
                elem: kind,
                data: vec![0; kind.size() * length],
            },
        };
        self.objects.lock().push(HeapObject {
            id,
            class: class.id(),
            size,
            body,
        });
        Ok(id)
    }

    fn iterate_objects(&self, visitor: &mut dyn FnMut(&HeapObject)) {
        let objects = self.objects.lock();
        for obj in objects.iter() {
            visitor(obj);
        }
    }

    fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }
}

/// Number of field slots in the full superclass chain of `class`.
fn total_field_slots(class: &ClassMetadata) -> usize {
    let own = class.fields().len();
    match class.super_class() {
        Some(s) => own + total_field_slots(s),
        None => own,
    }
}

/// External finalizer-queue collaborator.
///
/// Objects of finalizable classes are registered *after* allocation so the
/// queue never observes a half-constructed object.
pub trait FinalizerQueue: Send + Sync {
    /// Register a freshly allocated finalizable object
    fn register(&self, obj: ObjectId, class: &ClassMetadata);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{DefaultClassSupport, FieldDescriptor};

    fn linked_class(name: &str, fields: Vec<FieldDescriptor>) -> std::sync::Arc<ClassMetadata> {
        let c = ClassMetadata::simple(name, fields);
        c.mark_loaded();
        c.link(&DefaultClassSupport).unwrap();
        c
    }

    #[test]
    fn test_allocate_tracks_bytes() {
        let heap = SimpleHeap::new();
        let class = linked_class("T", Vec::new());
        heap.allocate_object(&class, 32).unwrap();
        assert_eq!(heap.allocated_bytes(), 32);
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn test_limit_enforced() {
        let heap = SimpleHeap::with_limit(64);
        let class = linked_class("U", Vec::new());
        heap.allocate_object(&class, 48).unwrap();
        let err = heap.allocate_object(&class, 48).unwrap_err();
        assert!(matches!(err, HeapError::OutOfMemory { .. }));
    }

    #[test]
    fn test_iterate_visits_all() {
        let heap = SimpleHeap::new();
        let class = linked_class("V", Vec::new());
        let a = heap.allocate_object(&class, 16).unwrap();
        let b = heap
            .allocate_array(&class, FieldKind::Int, 40, 4)
            .unwrap();
        let mut seen = Vec::new();
        heap.iterate_objects(&mut |o| seen.push(o.id));
        assert_eq!(seen, vec![a, b]);
    }
}
