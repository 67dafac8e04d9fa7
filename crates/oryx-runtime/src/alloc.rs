//! Object and array allocation
//!
//! The allocator computes sizes from class metadata and delegates raw
//! storage to the external [`Heap`] collaborator. Every rejection reason is
//! a distinct error, never a generic failure.

use crate::class::layout::{compute_array_size, ARRAY_HEADER_BYTES};
use crate::class::{ClassMetadata, FieldKind, InitState};
use crate::heap::{FinalizerQueue, Heap, HeapError};
use crate::object::ObjectId;
use std::sync::Arc;

/// Largest element count accepted for any array.
///
/// Bounded by the 32-bit length field of the object model; the byte-size
/// bound derived from the address space is checked separately.
pub const MAX_ARRAY_LENGTH: i64 = i32::MAX as i64;

/// Allocation failures
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// Abstract classes and interfaces cannot be instantiated
    #[error("Cannot instantiate abstract or interface class {class}")]
    Instantiation {
        /// Name of the rejected class
        class: String,
    },

    /// The metaclass-of-classes is only instantiable through the mirror path
    #[error("Cannot instantiate the metaclass {class} directly")]
    MetaclassInstantiation {
        /// Name of the metaclass
        class: String,
    },

    /// Negative array length
    #[error("Negative array length: {length}")]
    NegativeArrayLength {
        /// The rejected length
        length: i64,
    },

    /// Array length exceeds the element-count or address-space bound
    #[error("Requested array length {length} exceeds the maximum of {max}")]
    ArrayTooLarge {
        /// The rejected length
        length: i64,
        /// Maximum permitted length for this element kind
        max: i64,
    },

    /// The class must be linked before its instances can be sized
    #[error("Class {class} is not linked")]
    NotLinked {
        /// Name of the unlinked class
        class: String,
    },

    /// The heap collaborator could not satisfy the request
    #[error(transparent)]
    Heap(#[from] HeapError),
}

/// Allocates instances and arrays against the heap collaborator
pub struct ObjectAllocator {
    heap: Arc<dyn Heap>,
    finalizers: Option<Arc<dyn FinalizerQueue>>,
    /// When true, finalizable objects are registered by the interpreter at
    /// constructor time instead of here.
    register_finalizers_at_init: bool,
}

impl ObjectAllocator {
    /// Create an allocator over the given heap
    pub fn new(heap: Arc<dyn Heap>) -> Self {
        Self {
            heap,
            finalizers: None,
            register_finalizers_at_init: false,
        }
    }

    /// Attach a finalizer queue collaborator
    pub fn with_finalizer_queue(mut self, queue: Arc<dyn FinalizerQueue>) -> Self {
        self.finalizers = Some(queue);
        self
    }

    /// Defer finalizer registration to constructor time
    pub fn with_eager_finalizer_registration(mut self, eager: bool) -> Self {
        self.register_finalizers_at_init = eager;
        self
    }

    /// The underlying heap collaborator
    pub fn heap(&self) -> &Arc<dyn Heap> {
        &self.heap
    }

    /// Allocate an instance of `class`.
    ///
    /// Rejects abstract classes, interfaces, and the metaclass-of-classes,
    /// each with its own error. Finalizable instances are registered with
    /// the finalizer queue after allocation, never before, so the queue
    /// cannot observe a half-constructed object.
    pub fn allocate_instance(&self, class: &Arc<ClassMetadata>) -> Result<ObjectId, AllocError> {
        let flags = class.flags();
        if flags.is_metaclass {
            return Err(AllocError::MetaclassInstantiation {
                class: class.name().to_string(),
            });
        }
        if flags.is_abstract || flags.is_interface {
            return Err(AllocError::Instantiation {
                class: class.name().to_string(),
            });
        }
        if class.init_state() < InitState::Linked {
            return Err(AllocError::NotLinked {
                class: class.name().to_string(),
            });
        }

        let obj = self.heap.allocate_object(class, class.instance_size())?;

        if flags.has_finalizer && !self.register_finalizers_at_init {
            if let Some(queue) = &self.finalizers {
                queue.register(obj, class);
            }
        }
        Ok(obj)
    }

    /// Allocate a mirror instance of the metaclass for `mirrored`.
    ///
    /// Mirrors are variable-sized: the mirrored class's static-field block
    /// is stored inline after the metaclass layout.
    pub fn allocate_mirror(
        &self,
        metaclass: &Arc<ClassMetadata>,
        mirrored: &Arc<ClassMetadata>,
    ) -> Result<ObjectId, AllocError> {
        debug_assert!(metaclass.flags().is_metaclass);
        if metaclass.init_state() < InitState::Linked {
            return Err(AllocError::NotLinked {
                class: metaclass.name().to_string(),
            });
        }
        let size = metaclass.instance_size() + mirrored.static_block_size();
        Ok(self.heap.allocate_object(metaclass, size)?)
    }

    /// Allocate an array of `length` references to `element_class`.
    pub fn allocate_array(
        &self,
        element_class: &Arc<ClassMetadata>,
        length: i64,
    ) -> Result<ObjectId, AllocError> {
        let array_class = element_class.array_class();
        self.allocate_array_of(&array_class, FieldKind::Reference, length)
    }

    /// Allocate a primitive array with elements of `elem`.
    pub fn allocate_primitive_array(
        &self,
        array_class: &Arc<ClassMetadata>,
        elem: FieldKind,
        length: i64,
    ) -> Result<ObjectId, AllocError> {
        debug_assert_ne!(elem, FieldKind::Reference);
        self.allocate_array_of(array_class, elem, length)
    }

    fn allocate_array_of(
        &self,
        array_class: &Arc<ClassMetadata>,
        elem: FieldKind,
        length: i64,
    ) -> Result<ObjectId, AllocError> {
        if length < 0 {
            return Err(AllocError::NegativeArrayLength { length });
        }
        let max = max_array_length(elem);
        if length > max {
            return Err(AllocError::ArrayTooLarge { length, max });
        }
        let size = compute_array_size(elem, length as usize);
        Ok(self
            .heap
            .allocate_array(array_class, elem, size, length as usize)?)
    }
}

/// Maximum array length for elements of `elem`, derived from the 32-bit
/// element-count bound and the address-space byte bound.
pub fn max_array_length(elem: FieldKind) -> i64 {
    let byte_bound = ((isize::MAX as usize - ARRAY_HEADER_BYTES) / elem.size()) as i64;
    MAX_ARRAY_LENGTH.min(byte_bound)
}
