//! Runtime class descriptors
//!
//! `ClassMetadata` is created by the (external) class loader in the
//! `Allocated` state and moves through the initialization state machine in
//! [`crate::class::init`]. The field/method tables and the vtable/itable are
//! built once at link time and are immutable afterwards.

use crate::class::init::{InitMonitor, InitState, VmException};
use crate::class::layout::{
    compute_instance_layout, compute_static_block_size, FieldKind, InstanceLayout,
    OBJECT_HEADER_BYTES,
};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Unique identifier for a loaded class
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(u64);

impl ClassId {
    /// Create a new unique class ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value (used by the heap dump format)
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for ClassId {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifier of a defining class loader (opaque to the runtime core)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct LoaderId(pub u64);

/// Identity of a method: defining class plus method-table index
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MethodId {
    /// Class that declares the method
    pub class: ClassId,
    /// Index into that class's method table
    pub index: u16,
}

/// A declared field
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    /// Field name
    pub name: String,
    /// Field kind (primitive or reference)
    pub kind: FieldKind,
}

/// A declared method
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    /// Method name
    pub name: String,
    /// Static methods never appear in the vtable
    pub is_static: bool,
    /// Abstract methods have no body
    pub is_abstract: bool,
}

impl MethodDescriptor {
    /// True for instance methods with a body
    pub fn is_concrete_instance(&self) -> bool {
        !self.is_static && !self.is_abstract
    }
}

/// Virtual method table built at link time
#[derive(Debug, Clone, Default)]
pub struct VTable {
    /// Resolved method per vtable slot
    pub methods: Vec<MethodId>,
}

impl VTable {
    /// Number of vtable slots
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// True when the table has no slots
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Per-interface dispatch table entry
#[derive(Debug, Clone)]
pub struct ITableEntry {
    /// The interface this entry dispatches for
    pub interface: ClassId,
    /// Resolved method per interface-method slot
    pub methods: Vec<MethodId>,
}

/// Interface dispatch table built at link time
#[derive(Debug, Clone, Default)]
pub struct ITable {
    /// One entry per transitively implemented interface
    pub entries: Vec<ITableEntry>,
}

/// Boolean attributes of a class
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassFlags {
    /// Interfaces cannot be instantiated
    pub is_interface: bool,
    /// Abstract classes cannot be instantiated
    pub is_abstract: bool,
    /// The metaclass-of-classes; instantiable only through the mirror path
    pub is_metaclass: bool,
    /// Mirror instances carry their class's static fields inline
    pub is_mirror: bool,
    /// Instances must be registered with the finalizer queue
    pub has_finalizer: bool,
}

/// Class initializer body, injected by the (external) loader.
///
/// Bytecode execution is outside the runtime core, so the `<clinit>`
/// equivalent is an opaque callback.
pub type ClassInitFn = Box<dyn Fn(&ClassMetadata) -> Result<(), VmException> + Send + Sync>;

/// External collaborator that performs verification, bytecode rewriting and
/// dispatch-table construction during linking.
pub trait ClassSupport: Send + Sync {
    /// Verify the class's bytecode; an `Err` fails linking terminally
    fn verify(&self, class: &ClassMetadata) -> Result<(), String>;

    /// Rewrite bytecode in place; called at most once per class
    fn rewrite_bytecode(&self, class: &ClassMetadata);

    /// Resolve overrides and build the virtual dispatch table
    fn build_vtable(&self, class: &ClassMetadata) -> VTable;

    /// Resolve interface (including default) methods and build the itable
    fn build_itable(&self, class: &ClassMetadata) -> ITable;
}

/// Permissive [`ClassSupport`] that accepts every class and builds dispatch
/// tables from the declared method lists.
#[derive(Debug, Default)]
pub struct DefaultClassSupport;

impl ClassSupport for DefaultClassSupport {
    fn verify(&self, _class: &ClassMetadata) -> Result<(), String> {
        Ok(())
    }

    fn rewrite_bytecode(&self, _class: &ClassMetadata) {}

    fn build_vtable(&self, class: &ClassMetadata) -> VTable {
        let mut methods = match class.super_class() {
            Some(s) => s.vtable().methods.clone(),
            None => Vec::new(),
        };
        for (index, m) in class.methods().iter().enumerate() {
            if !m.is_static {
                methods.push(MethodId {
                    class: class.id(),
                    index: index as u16,
                });
            }
        }
        VTable { methods }
    }

    fn build_itable(&self, class: &ClassMetadata) -> ITable {
        let entries = class
            .transitive_interfaces()
            .iter()
            .map(|iface| ITableEntry {
                interface: iface.id(),
                methods: iface
                    .methods()
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| !m.is_static)
                    .map(|(index, _)| MethodId {
                        class: iface.id(),
                        index: index as u16,
                    })
                    .collect(),
            })
            .collect();
        ITable { entries }
    }
}

/// Runtime descriptor of a loaded class
pub struct ClassMetadata {
    id: ClassId,
    name: String,
    loader: LoaderId,
    super_class: Option<Arc<ClassMetadata>>,
    interfaces: Vec<Arc<ClassMetadata>>,
    flags: ClassFlags,

    /// Declared instance fields (inherited fields live in the super layout)
    fields: Vec<FieldDescriptor>,
    /// Declared static fields (stored inline in the class's mirror instance)
    static_fields: Vec<FieldDescriptor>,
    methods: Vec<MethodDescriptor>,

    // Link products, written exactly once while linking.
    layout: OnceCell<InstanceLayout>,
    vtable: OnceCell<VTable>,
    itable: OnceCell<ITable>,
    transitive_interfaces: OnceCell<Vec<Arc<ClassMetadata>>>,
    rewritten: AtomicBool,

    // Initialization state machine (see class::init).
    pub(crate) init_state: AtomicU8,
    pub(crate) init_thread: AtomicU64,
    pub(crate) init_monitor: RwLock<Option<Arc<InitMonitor>>>,
    pub(crate) init_failure: Mutex<Option<String>>,
    pub(crate) initializer: Mutex<Option<ClassInitFn>>,

    /// Lazily created one-dimensional array class for this element class
    array_class: OnceCell<Arc<ClassMetadata>>,
    /// For array classes: the element class (None for primitive arrays)
    element_class: Option<Arc<ClassMetadata>>,
    /// For array classes: the element kind
    element_kind: Option<FieldKind>,
}

impl std::fmt::Debug for ClassMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassMetadata")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.init_state())
            .finish()
    }
}

impl ClassMetadata {
    /// Create a new class descriptor in the `Allocated` state.
    pub fn new(
        name: impl Into<String>,
        loader: LoaderId,
        super_class: Option<Arc<ClassMetadata>>,
        interfaces: Vec<Arc<ClassMetadata>>,
        flags: ClassFlags,
        fields: Vec<FieldDescriptor>,
        static_fields: Vec<FieldDescriptor>,
        methods: Vec<MethodDescriptor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ClassId::new(),
            name: name.into(),
            loader,
            super_class,
            interfaces,
            flags,
            fields,
            static_fields,
            methods,
            layout: OnceCell::new(),
            vtable: OnceCell::new(),
            itable: OnceCell::new(),
            transitive_interfaces: OnceCell::new(),
            rewritten: AtomicBool::new(false),
            init_state: AtomicU8::new(InitState::Allocated as u8),
            init_thread: AtomicU64::new(0),
            init_monitor: RwLock::new(Some(Arc::new(InitMonitor::new()))),
            init_failure: Mutex::new(None),
            initializer: Mutex::new(None),
            array_class: OnceCell::new(),
            element_class: None,
            element_kind: None,
        })
    }

    /// Shorthand for a plain concrete class with no supertypes.
    pub fn simple(name: impl Into<String>, fields: Vec<FieldDescriptor>) -> Arc<Self> {
        Self::new(
            name,
            LoaderId::default(),
            None,
            Vec::new(),
            ClassFlags::default(),
            fields,
            Vec::new(),
            Vec::new(),
        )
    }

    /// Unique class ID
    pub fn id(&self) -> ClassId {
        self.id
    }

    /// Class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Defining loader
    pub fn loader(&self) -> LoaderId {
        self.loader
    }

    /// Direct superclass, None for the root class
    pub fn super_class(&self) -> Option<&Arc<ClassMetadata>> {
        self.super_class.as_ref()
    }

    /// Directly declared interfaces
    pub fn interfaces(&self) -> &[Arc<ClassMetadata>] {
        &self.interfaces
    }

    /// Class flags
    pub fn flags(&self) -> ClassFlags {
        self.flags
    }

    /// Declared instance fields
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Declared static fields
    pub fn static_fields(&self) -> &[FieldDescriptor] {
        &self.static_fields
    }

    /// Declared methods
    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    /// True when this class declares at least one concrete instance method.
    ///
    /// Interfaces with concrete (default) instance methods must be
    /// initialized before their implementors.
    pub fn declares_concrete_instance_methods(&self) -> bool {
        self.methods.iter().any(|m| m.is_concrete_instance())
    }

    /// True for array classes
    pub fn is_array(&self) -> bool {
        self.element_kind.is_some()
    }

    /// Element class of an array class (None for primitive arrays)
    pub fn element_class(&self) -> Option<&Arc<ClassMetadata>> {
        self.element_class.as_ref()
    }

    /// Element kind of an array class
    pub fn element_kind(&self) -> Option<FieldKind> {
        self.element_kind
    }

    /// Register the class initializer body (the `<clinit>` equivalent).
    pub fn set_initializer(&self, body: ClassInitFn) {
        *self.initializer.lock() = Some(body);
    }

    /// Current initialization state
    pub fn init_state(&self) -> InitState {
        InitState::from_u8(self.init_state.load(Ordering::Acquire))
    }

    /// Thread currently running the initializer, 0 when none
    pub(crate) fn initializing_thread(&self) -> u64 {
        self.init_thread.load(Ordering::Acquire)
    }

    /// Instance layout; only valid once the class is linked
    pub fn layout(&self) -> &InstanceLayout {
        debug_assert!(self.init_state() >= InitState::Linked);
        self.layout.get_or_init(InstanceLayout::empty)
    }

    /// Total instance size in bytes.
    ///
    /// Mirror instances are variable-sized: they append the mirrored class's
    /// static-field block to the metaclass layout.
    pub fn instance_size(&self) -> usize {
        self.layout().size
    }

    /// Extra inline bytes a mirror of this class needs for its statics.
    pub fn static_block_size(&self) -> usize {
        compute_static_block_size(
            &self
                .static_fields
                .iter()
                .map(|f| f.kind)
                .collect::<Vec<_>>(),
        )
    }

    /// Virtual dispatch table; empty until linked
    pub fn vtable(&self) -> &VTable {
        self.vtable.get_or_init(VTable::default)
    }

    /// Interface dispatch table; empty until linked
    pub fn itable(&self) -> &ITable {
        self.itable.get_or_init(ITable::default)
    }

    /// All transitively implemented interfaces, deduplicated.
    pub fn transitive_interfaces(&self) -> &[Arc<ClassMetadata>] {
        self.transitive_interfaces.get_or_init(|| {
            let mut seen = rustc_hash::FxHashSet::default();
            let mut out: Vec<Arc<ClassMetadata>> = Vec::new();
            let mut stack: Vec<Arc<ClassMetadata>> = self.interfaces.clone();
            if let Some(s) = &self.super_class {
                stack.extend(s.transitive_interfaces().iter().cloned());
            }
            while let Some(iface) = stack.pop() {
                if seen.insert(iface.id()) {
                    stack.extend(iface.interfaces.iter().cloned());
                    out.push(iface);
                }
            }
            out
        })
    }

    /// Subtype walk over the superclass chain and transitive interfaces.
    pub fn is_subtype_of(&self, other: &ClassMetadata) -> bool {
        if self.id == other.id {
            return true;
        }
        if self
            .transitive_interfaces()
            .iter()
            .any(|i| i.id() == other.id())
        {
            return true;
        }
        match &self.super_class {
            Some(s) => s.is_subtype_of(other),
            None => false,
        }
    }

    /// Lazily create and cache the one-dimensional array class for this
    /// element class.
    ///
    /// `OnceCell` gives the double-checked contract the cache needs: an
    /// acquire-load fast path, and a lock around creation so concurrent
    /// callers never produce duplicate descriptors.
    pub fn array_class(self: &Arc<Self>) -> Arc<ClassMetadata> {
        self.array_class
            .get_or_init(|| {
                let array = Arc::new(ClassMetadata {
                    id: ClassId::new(),
                    name: format!("{}[]", self.name),
                    loader: self.loader,
                    super_class: None,
                    interfaces: Vec::new(),
                    flags: ClassFlags::default(),
                    fields: Vec::new(),
                    static_fields: Vec::new(),
                    methods: Vec::new(),
                    layout: OnceCell::new(),
                    vtable: OnceCell::new(),
                    itable: OnceCell::new(),
                    transitive_interfaces: OnceCell::new(),
                    rewritten: AtomicBool::new(true),
                    // Array classes have no initializer; they are born linked.
                    init_state: AtomicU8::new(InitState::FullyInitialized as u8),
                    init_thread: AtomicU64::new(0),
                    init_monitor: RwLock::new(None),
                    init_failure: Mutex::new(None),
                    initializer: Mutex::new(None),
                    array_class: OnceCell::new(),
                    element_class: Some(self.clone()),
                    element_kind: Some(FieldKind::Reference),
                });
                let _ = array.layout.set(InstanceLayout::empty());
                array
            })
            .clone()
    }

    /// True once bytecode rewriting ran (it is idempotent and guarded)
    pub fn is_rewritten(&self) -> bool {
        self.rewritten.load(Ordering::Acquire)
    }

    pub(crate) fn mark_rewritten_once(&self) -> bool {
        self.rewritten
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn install_link_products(&self, layout: InstanceLayout, vtable: VTable, itable: ITable) {
        let _ = self.layout.set(layout);
        let _ = self.vtable.set(vtable);
        let _ = self.itable.set(itable);
    }

    pub(crate) fn compute_layout(&self) -> InstanceLayout {
        let super_size = match &self.super_class {
            Some(s) => s.layout().size,
            None => OBJECT_HEADER_BYTES,
        };
        let kinds: Vec<FieldKind> = self.fields.iter().map(|f| f.kind).collect();
        compute_instance_layout(super_size, &kinds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_ids_unique() {
        let a = ClassMetadata::simple("A", Vec::new());
        let b = ClassMetadata::simple("B", Vec::new());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_new_class_is_allocated() {
        let c = ClassMetadata::simple("Fresh", Vec::new());
        assert_eq!(c.init_state(), InitState::Allocated);
    }

    #[test]
    fn test_array_class_cached() {
        let elem = ClassMetadata::simple("Elem", Vec::new());
        let a1 = elem.array_class();
        let a2 = elem.array_class();
        assert_eq!(a1.id(), a2.id());
        assert_eq!(a1.name(), "Elem[]");
        assert!(a1.is_array());
        assert_eq!(a1.element_class().map(|c| c.id()), Some(elem.id()));
    }

    #[test]
    fn test_subtype_walk() {
        let root = ClassMetadata::simple("Root", Vec::new());
        let mid = ClassMetadata::new(
            "Mid",
            LoaderId::default(),
            Some(root.clone()),
            Vec::new(),
            ClassFlags::default(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );
        let leaf = ClassMetadata::new(
            "Leaf",
            LoaderId::default(),
            Some(mid.clone()),
            Vec::new(),
            ClassFlags::default(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );
        assert!(leaf.is_subtype_of(&root));
        assert!(leaf.is_subtype_of(&mid));
        assert!(!root.is_subtype_of(&leaf));
    }

    #[test]
    fn test_transitive_interfaces() {
        let i1 = ClassMetadata::new(
            "I1",
            LoaderId::default(),
            None,
            Vec::new(),
            ClassFlags {
                is_interface: true,
                ..Default::default()
            },
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );
        let i2 = ClassMetadata::new(
            "I2",
            LoaderId::default(),
            None,
            vec![i1.clone()],
            ClassFlags {
                is_interface: true,
                ..Default::default()
            },
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );
        let c = ClassMetadata::new(
            "C",
            LoaderId::default(),
            None,
            vec![i2.clone()],
            ClassFlags::default(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );
        let ids: Vec<ClassId> = c.transitive_interfaces().iter().map(|i| i.id()).collect();
        assert!(ids.contains(&i1.id()));
        assert!(ids.contains(&i2.id()));
        assert_eq!(ids.len(), 2);
    }
}
