//! Instance field layout computation
//!
//! Field offsets are assigned once at link time and are immutable afterwards.
//! Superclass fields always come first so a subclass instance can be viewed
//! through its superclass layout.

/// Size of the object header in bytes (mark word + class word).
pub const OBJECT_HEADER_BYTES: usize = 16;

/// Size of the array header in bytes (object header + length word).
pub const ARRAY_HEADER_BYTES: usize = OBJECT_HEADER_BYTES + 8;

/// Size of a heap reference in bytes.
pub const REFERENCE_BYTES: usize = 8;

/// Objects are always aligned to this many bytes.
pub const OBJECT_ALIGNMENT: usize = 8;

/// Primitive and reference field kinds
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldKind {
    /// 1-byte boolean
    Boolean = 0,
    /// 1-byte signed integer
    Byte = 1,
    /// 2-byte unsigned character
    Char = 2,
    /// 2-byte signed integer
    Short = 3,
    /// 4-byte signed integer
    Int = 4,
    /// 8-byte signed integer
    Long = 5,
    /// 4-byte IEEE float
    Float = 6,
    /// 8-byte IEEE double
    Double = 7,
    /// Heap reference
    Reference = 8,
}

impl FieldKind {
    /// Size of a field of this kind in bytes
    pub fn size(self) -> usize {
        match self {
            FieldKind::Boolean | FieldKind::Byte => 1,
            FieldKind::Char | FieldKind::Short => 2,
            FieldKind::Int | FieldKind::Float => 4,
            FieldKind::Long | FieldKind::Double => 8,
            FieldKind::Reference => REFERENCE_BYTES,
        }
    }

    /// Required alignment of a field of this kind in bytes
    pub fn alignment(self) -> usize {
        self.size()
    }

    /// Stable tag byte used by the heap dump format
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Inverse of [`FieldKind::tag`]
    pub fn from_tag(tag: u8) -> Option<FieldKind> {
        match tag {
            0 => Some(FieldKind::Boolean),
            1 => Some(FieldKind::Byte),
            2 => Some(FieldKind::Char),
            3 => Some(FieldKind::Short),
            4 => Some(FieldKind::Int),
            5 => Some(FieldKind::Long),
            6 => Some(FieldKind::Float),
            7 => Some(FieldKind::Double),
            8 => Some(FieldKind::Reference),
            _ => None,
        }
    }
}

/// Computed instance layout for a class
///
/// Built once at link time from the superclass layout plus the class's own
/// declared instance fields.
#[derive(Debug, Clone)]
pub struct InstanceLayout {
    /// Total instance size in bytes, including the object header,
    /// rounded up to [`OBJECT_ALIGNMENT`]
    pub size: usize,
    /// Byte offset of each declared instance field, in declaration order
    pub offsets: Vec<u32>,
}

impl InstanceLayout {
    /// Layout of a fieldless instance (header only)
    pub fn empty() -> Self {
        Self {
            size: OBJECT_HEADER_BYTES,
            offsets: Vec::new(),
        }
    }
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Compute the instance layout for a class.
///
/// `super_size` is the total instance size of the superclass (or
/// [`OBJECT_HEADER_BYTES`] for a root class); new fields are packed after it
/// in declaration order, aligned to their natural alignment.
pub fn compute_instance_layout(super_size: usize, fields: &[FieldKind]) -> InstanceLayout {
    debug_assert!(super_size >= OBJECT_HEADER_BYTES);

    let mut offset = super_size;
    let mut offsets = Vec::with_capacity(fields.len());
    for kind in fields {
        offset = align_up(offset, kind.alignment());
        offsets.push(offset as u32);
        offset += kind.size();
    }

    InstanceLayout {
        size: align_up(offset, OBJECT_ALIGNMENT),
        offsets,
    }
}

/// Compute the total byte size of the inline static-field block of a mirror
/// instance.
pub fn compute_static_block_size(fields: &[FieldKind]) -> usize {
    let mut offset = 0usize;
    for kind in fields {
        offset = align_up(offset, kind.alignment());
        offset += kind.size();
    }
    align_up(offset, OBJECT_ALIGNMENT)
}

/// Compute the byte size of an array with `length` elements of `elem`.
pub fn compute_array_size(elem: FieldKind, length: usize) -> usize {
    align_up(ARRAY_HEADER_BYTES + elem.size() * length, OBJECT_ALIGNMENT)
}
