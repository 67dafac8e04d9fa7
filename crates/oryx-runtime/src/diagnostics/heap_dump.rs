//! Binary heap dump writer
//!
//! Produces a self-describing little-endian snapshot of every loaded class
//! and live heap object, followed by the root set that keeps otherwise
//! unreachable objects alive (thread stacks, global handles, sticky
//! classes). The dump runs inside a VM operation so the object graph cannot
//! mutate mid-walk.
//!
//! Layout: a fixed header (magic, version), a sequence of records, and a
//! CRC32 trailer over everything before it. Every record and heap
//! sub-record is framed as `tag: u8, length: u32, payload`; records whose
//! payload would overflow the 32-bit length field are truncated with a
//! logged warning rather than failing the dump.

use crate::class::ClassMetadata;
use crate::heap::{Heap, ObjectBody};
use crate::safepoint::{SafepointWorld, VmOperation};
use rustc_hash::{FxHashMap, FxHashSet};
use std::io::{self, Write};
use std::sync::Arc;

/// Identifies a dump stream ("ORYXHDUP")
pub const DUMP_MAGIC: u64 = 0x4F52_5958_4844_5550;
/// Current format version
pub const DUMP_VERSION: u32 = 1;

/// Largest payload a single record or sub-record may carry
const MAX_RECORD_PAYLOAD: usize = u32::MAX as usize;

/// Top-level record tags
pub mod tag {
    /// Interned UTF-8 string
    pub const STRING_UTF8: u8 = 0x01;
    /// Class load event (one per loaded class, supers first)
    pub const LOAD_CLASS: u8 = 0x02;
    /// Per-thread stack trace
    pub const STACK_TRACE: u8 = 0x05;
    /// Container for heap sub-records
    pub const HEAP_DUMP_SEGMENT: u8 = 0x0C;
    /// End of dump
    pub const HEAP_DUMP_END: u8 = 0x2C;
}

/// Sub-record tags within a heap dump segment
pub mod subtag {
    /// Class structure (fields, sizes)
    pub const CLASS_DUMP: u8 = 0x20;
    /// Ordinary instance with raw field slots
    pub const INSTANCE_DUMP: u8 = 0x21;
    /// Array of object references
    pub const OBJECT_ARRAY_DUMP: u8 = 0x22;
    /// Array of primitives
    pub const PRIMITIVE_ARRAY_DUMP: u8 = 0x23;
    /// Global handle root
    pub const ROOT_GLOBAL: u8 = 0x30;
    /// Sticky (system) class root
    pub const ROOT_STICKY_CLASS: u8 = 0x31;
    /// Reference held by a thread stack frame
    pub const ROOT_THREAD_STACK: u8 = 0x32;
}

/// Counters reported after a completed dump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapDumpSummary {
    /// Classes described
    pub classes: usize,
    /// Heap objects dumped
    pub objects: usize,
    /// Root records emitted
    pub roots: usize,
    /// Records truncated to fit the 32-bit length field
    pub truncated: usize,
}

/// `io::Write` adapter that feeds a CRC32 alongside the inner writer
struct CrcWriter<W: Write> {
    inner: W,
    hasher: crc32fast::Hasher,
}

impl<W: Write> CrcWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
        }
    }

    fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct DumpWriter<W: Write> {
    out: CrcWriter<W>,
    strings: FxHashMap<String, u64>,
    next_string: u64,
    segment: Vec<u8>,
    summary: HeapDumpSummary,
}

impl<W: Write> DumpWriter<W> {
    fn new(out: W) -> io::Result<Self> {
        let mut out = CrcWriter::new(out);
        out.write_all(&DUMP_MAGIC.to_le_bytes())?;
        out.write_all(&DUMP_VERSION.to_le_bytes())?;
        Ok(Self {
            out,
            strings: FxHashMap::default(),
            next_string: 1,
            segment: Vec::new(),
            summary: HeapDumpSummary::default(),
        })
    }

    fn write_record(&mut self, tag: u8, payload: &[u8]) -> io::Result<()> {
        debug_assert!(payload.len() <= MAX_RECORD_PAYLOAD);
        self.out.write_all(&[tag])?;
        self.out.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.out.write_all(payload)
    }

    /// Intern `s`, emitting its string record the first time.
    ///
    /// Must not be called while a heap dump segment is open: string records
    /// are top-level.
    fn intern(&mut self, s: &str) -> io::Result<u64> {
        debug_assert!(self.segment.is_empty());
        if let Some(&id) = self.strings.get(s) {
            return Ok(id);
        }
        let id = self.next_string;
        self.next_string += 1;
        self.strings.insert(s.to_owned(), id);

        let bytes = s.as_bytes();
        let cut = if 8 + bytes.len() > MAX_RECORD_PAYLOAD {
            log::warn!("heap dump: truncating oversized string record");
            self.summary.truncated += 1;
            MAX_RECORD_PAYLOAD - 8
        } else {
            bytes.len()
        };
        let mut payload = Vec::with_capacity(8 + cut);
        payload.extend_from_slice(&id.to_le_bytes());
        payload.extend_from_slice(&bytes[..cut]);
        self.write_record(tag::STRING_UTF8, &payload)?;
        Ok(id)
    }

    /// Append a sub-record to the open segment, flushing first when the
    /// segment would overflow its own length field.
    fn push_sub(&mut self, sub: u8, payload: &[u8]) -> io::Result<()> {
        let framed = 1 + 4 + payload.len();
        if self.segment.len() + framed > MAX_RECORD_PAYLOAD {
            self.flush_segment()?;
        }
        self.segment.push(sub);
        self.segment
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.segment.extend_from_slice(payload);
        Ok(())
    }

    fn flush_segment(&mut self) -> io::Result<()> {
        if self.segment.is_empty() {
            return Ok(());
        }
        let segment = std::mem::take(&mut self.segment);
        self.write_record(tag::HEAP_DUMP_SEGMENT, &segment)
    }

    fn finish(mut self) -> io::Result<HeapDumpSummary> {
        self.flush_segment()?;
        self.write_record(tag::HEAP_DUMP_END, &[])?;
        let checksum = self.out.checksum();
        self.out.inner.write_all(&checksum.to_le_bytes())?;
        self.out.inner.flush()?;
        Ok(self.summary)
    }
}

/// Emit load-class records depth first so a class's supertypes (and, for
/// array classes, the element class) always precede it.
fn emit_load_class<W: Write>(
    w: &mut DumpWriter<W>,
    class: &Arc<ClassMetadata>,
    visited: &mut FxHashSet<u64>,
) -> io::Result<()> {
    if !visited.insert(class.id().as_u64()) {
        return Ok(());
    }
    if let Some(superclass) = class.super_class() {
        emit_load_class(w, superclass, visited)?;
    }
    if let Some(element) = class.element_class() {
        emit_load_class(w, element, visited)?;
    }

    let name_id = w.intern(class.name())?;
    // Field names are referenced later by the class dump; intern them now
    // while string records can still be emitted.
    for field in class.fields() {
        w.intern(&field.name)?;
    }

    let mut payload = Vec::with_capacity(24);
    payload.extend_from_slice(&class.id().as_u64().to_le_bytes());
    payload.extend_from_slice(&name_id.to_le_bytes());
    let super_id = class.super_class().map(|c| c.id().as_u64()).unwrap_or(0);
    payload.extend_from_slice(&super_id.to_le_bytes());
    w.write_record(tag::LOAD_CLASS, &payload)?;
    w.summary.classes += 1;
    Ok(())
}

fn emit_class_dump<W: Write>(
    w: &mut DumpWriter<W>,
    class: &Arc<ClassMetadata>,
    visited: &mut FxHashSet<u64>,
) -> io::Result<()> {
    if !visited.insert(class.id().as_u64()) {
        return Ok(());
    }
    if let Some(superclass) = class.super_class() {
        emit_class_dump(w, superclass, visited)?;
    }
    if let Some(element) = class.element_class() {
        emit_class_dump(w, element, visited)?;
    }

    let mut payload = Vec::new();
    payload.extend_from_slice(&class.id().as_u64().to_le_bytes());
    let super_id = class.super_class().map(|c| c.id().as_u64()).unwrap_or(0);
    payload.extend_from_slice(&super_id.to_le_bytes());
    payload.extend_from_slice(&(class.instance_size() as u32).to_le_bytes());
    payload.extend_from_slice(&(class.static_block_size() as u32).to_le_bytes());
    payload.extend_from_slice(&(class.fields().len() as u16).to_le_bytes());
    for field in class.fields() {
        let name_id = w.strings.get(&field.name).copied().unwrap_or(0);
        payload.extend_from_slice(&name_id.to_le_bytes());
        payload.push(field.kind.tag());
    }
    w.push_sub(subtag::CLASS_DUMP, &payload)
}

/// Write a full heap dump to `out`.
///
/// Caller must guarantee heap quiescence; normally this is invoked through
/// [`HeapDumpOperation`] so the guarantee comes from the safepoint.
pub fn dump_heap<W: Write>(world: &SafepointWorld<'_>, out: W) -> io::Result<HeapDumpSummary> {
    let runtime = world.runtime();
    let classes: Vec<Arc<ClassMetadata>> = runtime.classes().snapshot();

    let mut w = DumpWriter::new(out)?;

    let mut visited = FxHashSet::default();
    for class in &classes {
        emit_load_class(&mut w, class, &mut visited)?;
    }

    for thread in world.threads() {
        let frames = thread.frames_snapshot(0);
        let mut payload = Vec::with_capacity(12 + frames.len() * 14);
        payload.extend_from_slice(&thread.id().as_u64().to_le_bytes());
        payload.extend_from_slice(&(frames.len() as u32).to_le_bytes());
        for frame in &frames {
            payload.extend_from_slice(&frame.method.class.as_u64().to_le_bytes());
            payload.extend_from_slice(&frame.method.index.to_le_bytes());
            payload.extend_from_slice(&frame.bci.to_le_bytes());
        }
        w.write_record(tag::STACK_TRACE, &payload)?;
    }

    let mut dumped = FxHashSet::default();
    for class in &classes {
        emit_class_dump(&mut w, class, &mut dumped)?;
    }

    let mut objects = 0usize;
    let mut io_error: Option<io::Error> = None;
    runtime.heap().iterate_objects(&mut |object| {
        if io_error.is_some() {
            return;
        }
        let result = match &object.body {
            ObjectBody::Instance { fields } => {
                let mut payload = Vec::with_capacity(20 + fields.len() * 8);
                payload.extend_from_slice(&object.id.as_u64().to_le_bytes());
                payload.extend_from_slice(&object.class.as_u64().to_le_bytes());
                let max_slots = (MAX_RECORD_PAYLOAD - 20) / 8;
                let count = if fields.len() > max_slots {
                    log::warn!(
                        "heap dump: truncating instance {:?} to {max_slots} field slots",
                        object.id
                    );
                    w.summary.truncated += 1;
                    max_slots
                } else {
                    fields.len()
                };
                payload.extend_from_slice(&(count as u32).to_le_bytes());
                for slot in &fields[..count] {
                    payload.extend_from_slice(&slot.to_le_bytes());
                }
                w.push_sub(subtag::INSTANCE_DUMP, &payload)
            }
            ObjectBody::ObjArray { elements } => {
                let mut payload = Vec::with_capacity(20 + elements.len() * 8);
                payload.extend_from_slice(&object.id.as_u64().to_le_bytes());
                payload.extend_from_slice(&object.class.as_u64().to_le_bytes());
                let max_elements = (MAX_RECORD_PAYLOAD - 20) / 8;
                let count = if elements.len() > max_elements {
                    log::warn!(
                        "heap dump: truncating object array {:?} to {max_elements} elements",
                        object.id
                    );
                    w.summary.truncated += 1;
                    max_elements
                } else {
                    elements.len()
                };
                payload.extend_from_slice(&(count as u32).to_le_bytes());
                for element in &elements[..count] {
                    payload.extend_from_slice(&element.as_u64().to_le_bytes());
                }
                w.push_sub(subtag::OBJECT_ARRAY_DUMP, &payload)
            }
            ObjectBody::PrimArray { elem, data } => {
                let mut payload = Vec::with_capacity(13 + data.len());
                payload.extend_from_slice(&object.id.as_u64().to_le_bytes());
                payload.push(elem.tag());
                let max_bytes = MAX_RECORD_PAYLOAD - 13;
                let cut = if data.len() > max_bytes {
                    log::warn!(
                        "heap dump: truncating primitive array {:?} to {max_bytes} bytes",
                        object.id
                    );
                    w.summary.truncated += 1;
                    max_bytes
                } else {
                    data.len()
                };
                payload.extend_from_slice(&(cut as u32).to_le_bytes());
                payload.extend_from_slice(&data[..cut]);
                w.push_sub(subtag::PRIMITIVE_ARRAY_DUMP, &payload)
            }
        };
        match result {
            Ok(()) => objects += 1,
            Err(e) => io_error = Some(e),
        }
    });
    if let Some(e) = io_error {
        return Err(e);
    }
    w.summary.objects = objects;

    for class in &classes {
        let mut payload = [0u8; 8];
        payload.copy_from_slice(&class.id().as_u64().to_le_bytes());
        w.push_sub(subtag::ROOT_STICKY_CLASS, &payload)?;
        w.summary.roots += 1;
    }

    for global in runtime.globals_snapshot() {
        let mut payload = [0u8; 8];
        payload.copy_from_slice(&global.as_u64().to_le_bytes());
        w.push_sub(subtag::ROOT_GLOBAL, &payload)?;
        w.summary.roots += 1;
    }

    for thread in world.threads() {
        for (frame_index, frame) in thread.frames_snapshot(0).iter().enumerate() {
            for reference in &frame.refs {
                let mut payload = Vec::with_capacity(20);
                payload.extend_from_slice(&reference.as_u64().to_le_bytes());
                payload.extend_from_slice(&thread.id().as_u64().to_le_bytes());
                payload.extend_from_slice(&(frame_index as u32).to_le_bytes());
                w.push_sub(subtag::ROOT_THREAD_STACK, &payload)?;
                w.summary.roots += 1;
            }
        }
    }

    w.finish()
}

/// VM operation wrapping [`dump_heap`]
pub struct HeapDumpOperation<W: Write> {
    out: Option<W>,
    result: Option<io::Result<HeapDumpSummary>>,
}

impl<W: Write> HeapDumpOperation<W> {
    /// Dump into `out` when executed
    pub fn new(out: W) -> Self {
        Self {
            out: Some(out),
            result: None,
        }
    }

    /// Outcome of the dump; `None` if the operation never ran
    pub fn take_result(&mut self) -> Option<io::Result<HeapDumpSummary>> {
        self.result.take()
    }
}

impl<W: Write> VmOperation for HeapDumpOperation<W> {
    fn name(&self) -> &'static str {
        "heap-dump"
    }

    fn doit(&mut self, world: &mut SafepointWorld<'_>) {
        if let Some(out) = self.out.take() {
            self.result = Some(dump_heap(world, out));
        }
    }
}

/// Structural reader used to validate dumps
#[derive(Debug, Default)]
pub struct DumpStats {
    /// Interned strings
    pub strings: usize,
    /// Load-class records
    pub load_classes: usize,
    /// Stack-trace records
    pub stack_traces: usize,
    /// Class dump sub-records
    pub class_dumps: usize,
    /// Instance dump sub-records
    pub instances: usize,
    /// Object array sub-records
    pub object_arrays: usize,
    /// Primitive array sub-records
    pub primitive_arrays: usize,
    /// Root sub-records of all kinds
    pub roots: usize,
    /// Load-class order: class id appears after its super's id
    pub load_order: Vec<u64>,
}

/// Length-checked little-endian reads used by the reader.
fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

/// Parse and validate a dump produced by [`dump_heap`].
///
/// Checks the magic, version and CRC trailer and that every record and
/// sub-record is well framed.
pub fn read_dump(bytes: &[u8]) -> io::Result<DumpStats> {
    let bad = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_owned());

    if bytes.len() < 16 {
        return Err(bad("dump too short"));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    if crc32fast::hash(body) != read_u32(trailer) {
        return Err(bad("checksum mismatch"));
    }

    if read_u64(&body[0..8]) != DUMP_MAGIC {
        return Err(bad("bad magic"));
    }
    if read_u32(&body[8..12]) != DUMP_VERSION {
        return Err(bad("unsupported version"));
    }

    let mut stats = DumpStats::default();
    let mut offset = 12;
    let mut saw_end = false;
    while offset < body.len() {
        if saw_end {
            return Err(bad("record after end marker"));
        }
        if offset + 5 > body.len() {
            return Err(bad("truncated record header"));
        }
        let record_tag = body[offset];
        let len = read_u32(&body[offset + 1..offset + 5]) as usize;
        offset += 5;
        if offset + len > body.len() {
            return Err(bad("record payload past end of dump"));
        }
        let payload = &body[offset..offset + len];
        offset += len;

        match record_tag {
            tag::STRING_UTF8 => stats.strings += 1,
            tag::LOAD_CLASS => {
                if len != 24 {
                    return Err(bad("malformed load-class record"));
                }
                stats.load_classes += 1;
                stats.load_order.push(read_u64(&payload[0..8]));
            }
            tag::STACK_TRACE => stats.stack_traces += 1,
            tag::HEAP_DUMP_SEGMENT => read_segment(payload, &mut stats)?,
            tag::HEAP_DUMP_END => saw_end = true,
            other => return Err(bad(&format!("unknown record tag {other:#x}"))),
        }
    }
    if !saw_end {
        return Err(bad("missing end marker"));
    }
    Ok(stats)
}

fn read_segment(mut payload: &[u8], stats: &mut DumpStats) -> io::Result<()> {
    let bad = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_owned());
    while !payload.is_empty() {
        if payload.len() < 5 {
            return Err(bad("truncated sub-record header"));
        }
        let sub = payload[0];
        let len = read_u32(&payload[1..5]) as usize;
        if payload.len() < 5 + len {
            return Err(bad("sub-record payload past end of segment"));
        }
        payload = &payload[5 + len..];

        match sub {
            subtag::CLASS_DUMP => stats.class_dumps += 1,
            subtag::INSTANCE_DUMP => stats.instances += 1,
            subtag::OBJECT_ARRAY_DUMP => stats.object_arrays += 1,
            subtag::PRIMITIVE_ARRAY_DUMP => stats.primitive_arrays += 1,
            subtag::ROOT_GLOBAL | subtag::ROOT_STICKY_CLASS | subtag::ROOT_THREAD_STACK => {
                stats.roots += 1
            }
            other => return Err(bad(&format!("unknown sub-record tag {other:#x}"))),
        }
    }
    Ok(())
}
