//! Wire encoding of the data model: escape-coded sizes, strings, type
//! descriptors, values (whole and change-masked), bit sets and statuses.
//!
//! Everything is written through [`SerSink`] and read through
//! [`DeserSource`] so the same code paths serve the framing codec (which
//! may segment and split messages under the encoder) and plain in-memory
//! buffers in tests.

use crate::data::bitset::BitSet;
use crate::data::status::{Status, StatusKind};
use crate::data::value::{Field, PVField, PVStructure, ScalarKind, Structure};
use crate::net::buffer::ByteBuffer;
use crate::net::shared::{NetError, NetResult};
use std::sync::Arc;

/// Largest block requested from a source/sink in one `ensure` call. Matches
/// the codec's per-call ceiling so long payloads stream in pieces.
pub const ENSURE_CHUNK: usize = 512;

/// Nesting ceiling for inbound type descriptors.
const MAX_FIELD_DEPTH: usize = 20;

const SIZE_ESCAPE: u8 = 254;
const SIZE_NULL: u8 = 255;

const TAG_SCALAR: u8 = 0x00;
const TAG_ARRAY: u8 = 0x10;
const TAG_STRUCTURE: u8 = 0x80;
const TAG_NULL: u8 = 0xFF;

pub trait SerSink {
    fn buffer(&mut self) -> &mut ByteBuffer;
    /// Makes room for `count` more bytes, flushing/segmenting as needed.
    fn ensure(&mut self, count: usize) -> NetResult<()>;
    /// Large-block bypass. Returns true when the sink consumed `src`
    /// directly and nothing more must be written for it.
    fn direct(&mut self, _src: &[u8]) -> NetResult<bool> {
        Ok(false)
    }
}

pub trait DeserSource {
    fn buffer(&mut self) -> &mut ByteBuffer;
    /// Makes `count` bytes readable, pulling further segments if the
    /// logical payload continues in another wire message.
    fn ensure(&mut self, count: usize) -> NetResult<()>;
}

/// Adapter exposing a plain buffer as both sink and source.
pub struct BufferIo<'a>(pub &'a mut ByteBuffer);

impl<'a> SerSink for BufferIo<'a> {
    #[inline]
    fn buffer(&mut self) -> &mut ByteBuffer {
        self.0
    }

    #[inline]
    fn ensure(&mut self, count: usize) -> NetResult<()> {
        self.0.ensure_capacity(count)
    }
}

impl<'a> DeserSource for BufferIo<'a> {
    #[inline]
    fn buffer(&mut self) -> &mut ByteBuffer {
        self.0
    }

    #[inline]
    fn ensure(&mut self, count: usize) -> NetResult<()> {
        if self.0.remaining() < count {
            return Err(NetError::InvalidStream("payload exhausted"));
        }
        Ok(())
    }
}

pub fn write_size<S: SerSink + ?Sized>(sink: &mut S, size: usize) -> NetResult<()> {
    if size < SIZE_ESCAPE as usize {
        sink.ensure(1)?;
        sink.buffer().put_u8(size as u8);
    } else {
        sink.ensure(5)?;
        sink.buffer().put_u8(SIZE_ESCAPE);
        sink.buffer().put_u32(size as u32);
    }
    Ok(())
}

pub fn write_null_size<S: SerSink + ?Sized>(sink: &mut S) -> NetResult<()> {
    sink.ensure(1)?;
    sink.buffer().put_u8(SIZE_NULL);
    Ok(())
}

pub fn read_size<D: DeserSource + ?Sized>(src: &mut D) -> NetResult<Option<usize>> {
    src.ensure(1)?;
    let first = src.buffer().get_u8();
    match first {
        SIZE_NULL => Ok(None),
        SIZE_ESCAPE => {
            src.ensure(4)?;
            Ok(Some(src.buffer().get_u32() as usize))
        }
        size => Ok(Some(size as usize)),
    }
}

pub fn write_string<S: SerSink + ?Sized>(sink: &mut S, value: &str) -> NetResult<()> {
    write_size(sink, value.len())?;
    write_bytes(sink, value.as_bytes())
}

pub fn read_string<D: DeserSource + ?Sized>(src: &mut D) -> NetResult<String> {
    let size = match read_size(src)? {
        Some(size) => size,
        None => return Ok(String::new()),
    };
    let bytes = read_bytes(src, size)?;
    String::from_utf8(bytes).map_err(|_| NetError::InvalidStream("string is not utf-8"))
}

fn write_bytes<S: SerSink + ?Sized>(sink: &mut S, mut src: &[u8]) -> NetResult<()> {
    while !src.is_empty() {
        let chunk = src.len().min(ENSURE_CHUNK);
        sink.ensure(chunk)?;
        sink.buffer().put_slice(&src[..chunk]);
        src = &src[chunk..];
    }
    Ok(())
}

fn read_bytes<D: DeserSource + ?Sized>(src: &mut D, size: usize) -> NetResult<Vec<u8>> {
    let mut out = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let chunk = (size - filled).min(ENSURE_CHUNK);
        src.ensure(chunk)?;
        src.buffer().get_slice(&mut out[filled..filled + chunk]);
        filled += chunk;
    }
    Ok(out)
}

pub fn write_field_desc<S: SerSink + ?Sized>(sink: &mut S, field: &Field) -> NetResult<()> {
    match field {
        Field::Scalar(kind) => {
            sink.ensure(1)?;
            sink.buffer().put_u8(TAG_SCALAR | kind.code());
        }
        Field::ScalarArray(kind) => {
            sink.ensure(1)?;
            sink.buffer().put_u8(TAG_ARRAY | kind.code());
        }
        Field::Structure(structure) => {
            sink.ensure(1)?;
            sink.buffer().put_u8(TAG_STRUCTURE);
            write_string(sink, structure.id())?;
            write_size(sink, structure.len())?;
            for (name, nested) in structure.fields() {
                write_string(sink, name)?;
                write_field_desc(sink, nested)?;
            }
        }
    }
    Ok(())
}

pub fn write_opt_field_desc<S: SerSink + ?Sized>(sink: &mut S, field: Option<&Field>) -> NetResult<()> {
    match field {
        Some(field) => write_field_desc(sink, field),
        None => {
            sink.ensure(1)?;
            sink.buffer().put_u8(TAG_NULL);
            Ok(())
        }
    }
}

pub fn read_field_desc<D: DeserSource + ?Sized>(src: &mut D) -> NetResult<Field> {
    read_field_desc_depth(src, 0)
}

pub fn read_opt_field_desc<D: DeserSource + ?Sized>(src: &mut D) -> NetResult<Option<Field>> {
    src.ensure(1)?;
    let tag = src.buffer().get_u8();
    if tag == TAG_NULL {
        return Ok(None);
    }
    decode_field_tag(src, tag, 0).map(Some)
}

fn read_field_desc_depth<D: DeserSource + ?Sized>(src: &mut D, depth: usize) -> NetResult<Field> {
    src.ensure(1)?;
    let tag = src.buffer().get_u8();
    decode_field_tag(src, tag, depth)
}

fn decode_field_tag<D: DeserSource + ?Sized>(src: &mut D, tag: u8, depth: usize) -> NetResult<Field> {
    if depth > MAX_FIELD_DEPTH {
        return Err(NetError::InvalidStream("type descriptor nested too deeply"));
    }
    if tag == TAG_STRUCTURE {
        let id = read_string(src)?;
        let count = read_size(src)?.ok_or(NetError::InvalidStream("null structure field count"))?;
        let mut fields = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let name = read_string(src)?;
            let field = read_field_desc_depth(src, depth + 1)?;
            fields.push((name, field));
        }
        return Ok(Field::Structure(Structure::new(id, fields)));
    }
    let kind = ScalarKind::from_code(tag & 0x0F).ok_or(NetError::InvalidStream("unknown scalar kind"))?;
    match tag & 0xF0 {
        TAG_SCALAR => Ok(Field::Scalar(kind)),
        TAG_ARRAY => Ok(Field::ScalarArray(kind)),
        _ => Err(NetError::InvalidStream("unknown field tag")),
    }
}

macro_rules! write_elements {
    ($sink:expr, $items:expr, $size:expr, $put:ident) => {{
        write_size($sink, $items.len())?;
        for item in $items.iter() {
            $sink.ensure($size)?;
            $sink.buffer().$put(*item);
        }
    }};
}

macro_rules! read_elements {
    ($src:expr, $size:expr, $get:ident) => {{
        let count = read_size($src)?.ok_or(NetError::InvalidStream("null array size"))?;
        let mut items = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            $src.ensure($size)?;
            items.push($src.buffer().$get());
        }
        items
    }};
}

pub fn write_value<S: SerSink + ?Sized>(sink: &mut S, value: &PVField) -> NetResult<()> {
    match value {
        PVField::Boolean(v) => {
            sink.ensure(1)?;
            sink.buffer().put_u8(*v as u8);
        }
        PVField::Byte(v) => {
            sink.ensure(1)?;
            sink.buffer().put_i8(*v);
        }
        PVField::Short(v) => {
            sink.ensure(2)?;
            sink.buffer().put_i16(*v);
        }
        PVField::Int(v) => {
            sink.ensure(4)?;
            sink.buffer().put_i32(*v);
        }
        PVField::Long(v) => {
            sink.ensure(8)?;
            sink.buffer().put_i64(*v);
        }
        PVField::UByte(v) => {
            sink.ensure(1)?;
            sink.buffer().put_u8(*v);
        }
        PVField::UShort(v) => {
            sink.ensure(2)?;
            sink.buffer().put_u16(*v);
        }
        PVField::UInt(v) => {
            sink.ensure(4)?;
            sink.buffer().put_u32(*v);
        }
        PVField::ULong(v) => {
            sink.ensure(8)?;
            sink.buffer().put_u64(*v);
        }
        PVField::Float(v) => {
            sink.ensure(4)?;
            sink.buffer().put_f32(*v);
        }
        PVField::Double(v) => {
            sink.ensure(8)?;
            sink.buffer().put_f64(*v);
        }
        PVField::Str(v) => write_string(sink, v)?,
        PVField::BooleanArray(items) => {
            write_size(sink, items.len())?;
            for item in items {
                sink.ensure(1)?;
                sink.buffer().put_u8(*item as u8);
            }
        }
        PVField::ByteArray(items) => {
            write_size(sink, items.len())?;
            // i8 and u8 share a byte layout
            let raw: &[u8] = unsafe { std::slice::from_raw_parts(items.as_ptr() as *const u8, items.len()) };
            if !sink.direct(raw)? {
                write_bytes(sink, raw)?;
            }
        }
        PVField::UByteArray(items) => {
            write_size(sink, items.len())?;
            if !sink.direct(items)? {
                write_bytes(sink, items)?;
            }
        }
        PVField::ShortArray(items) => write_elements!(sink, items, 2, put_i16),
        PVField::IntArray(items) => write_elements!(sink, items, 4, put_i32),
        PVField::LongArray(items) => write_elements!(sink, items, 8, put_i64),
        PVField::UShortArray(items) => write_elements!(sink, items, 2, put_u16),
        PVField::UIntArray(items) => write_elements!(sink, items, 4, put_u32),
        PVField::ULongArray(items) => write_elements!(sink, items, 8, put_u64),
        PVField::FloatArray(items) => write_elements!(sink, items, 4, put_f32),
        PVField::DoubleArray(items) => write_elements!(sink, items, 8, put_f64),
        PVField::StrArray(items) => {
            write_size(sink, items.len())?;
            for item in items {
                write_string(sink, item)?;
            }
        }
        PVField::Structure(nested) => write_structure(sink, nested)?,
    }
    Ok(())
}

pub fn read_value<D: DeserSource + ?Sized>(src: &mut D, field: &Field) -> NetResult<PVField> {
    let value = match field {
        Field::Scalar(kind) => match kind {
            ScalarKind::Boolean => {
                src.ensure(1)?;
                PVField::Boolean(src.buffer().get_u8() != 0)
            }
            ScalarKind::Byte => {
                src.ensure(1)?;
                PVField::Byte(src.buffer().get_i8())
            }
            ScalarKind::Short => {
                src.ensure(2)?;
                PVField::Short(src.buffer().get_i16())
            }
            ScalarKind::Int => {
                src.ensure(4)?;
                PVField::Int(src.buffer().get_i32())
            }
            ScalarKind::Long => {
                src.ensure(8)?;
                PVField::Long(src.buffer().get_i64())
            }
            ScalarKind::UByte => {
                src.ensure(1)?;
                PVField::UByte(src.buffer().get_u8())
            }
            ScalarKind::UShort => {
                src.ensure(2)?;
                PVField::UShort(src.buffer().get_u16())
            }
            ScalarKind::UInt => {
                src.ensure(4)?;
                PVField::UInt(src.buffer().get_u32())
            }
            ScalarKind::ULong => {
                src.ensure(8)?;
                PVField::ULong(src.buffer().get_u64())
            }
            ScalarKind::Float => {
                src.ensure(4)?;
                PVField::Float(src.buffer().get_f32())
            }
            ScalarKind::Double => {
                src.ensure(8)?;
                PVField::Double(src.buffer().get_f64())
            }
            ScalarKind::Str => PVField::Str(read_string(src)?),
        },
        Field::ScalarArray(kind) => match kind {
            ScalarKind::Boolean => {
                let count = read_size(src)?.ok_or(NetError::InvalidStream("null array size"))?;
                let mut items = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    src.ensure(1)?;
                    items.push(src.buffer().get_u8() != 0);
                }
                PVField::BooleanArray(items)
            }
            ScalarKind::Byte => {
                let count = read_size(src)?.ok_or(NetError::InvalidStream("null array size"))?;
                let raw = read_bytes(src, count)?;
                PVField::ByteArray(raw.into_iter().map(|b| b as i8).collect())
            }
            ScalarKind::UByte => {
                let count = read_size(src)?.ok_or(NetError::InvalidStream("null array size"))?;
                PVField::UByteArray(read_bytes(src, count)?)
            }
            ScalarKind::Short => PVField::ShortArray(read_elements!(src, 2, get_i16)),
            ScalarKind::Int => PVField::IntArray(read_elements!(src, 4, get_i32)),
            ScalarKind::Long => PVField::LongArray(read_elements!(src, 8, get_i64)),
            ScalarKind::UShort => PVField::UShortArray(read_elements!(src, 2, get_u16)),
            ScalarKind::UInt => PVField::UIntArray(read_elements!(src, 4, get_u32)),
            ScalarKind::ULong => PVField::ULongArray(read_elements!(src, 8, get_u64)),
            ScalarKind::Float => PVField::FloatArray(read_elements!(src, 4, get_f32)),
            ScalarKind::Double => PVField::DoubleArray(read_elements!(src, 8, get_f64)),
            ScalarKind::Str => {
                let count = read_size(src)?.ok_or(NetError::InvalidStream("null array size"))?;
                let mut items = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    items.push(read_string(src)?);
                }
                PVField::StrArray(items)
            }
        },
        Field::Structure(nested) => PVField::Structure(read_structure(src, nested)?),
    };
    Ok(value)
}

pub fn write_structure<S: SerSink + ?Sized>(sink: &mut S, value: &PVStructure) -> NetResult<()> {
    for index in 0..value.len() {
        write_value(sink, value.field(index))?;
    }
    Ok(())
}

pub fn read_structure<D: DeserSource + ?Sized>(src: &mut D, structure: &Arc<Structure>) -> NetResult<PVStructure> {
    let mut fields = Vec::with_capacity(structure.len());
    for (_, field) in structure.fields() {
        fields.push(read_value(src, field)?);
    }
    Ok(PVStructure::from_parts(structure.clone(), fields))
}

/// Serializes the nodes of `value` raised in `mask`, depth first. A raised
/// structure bit covers its whole subtree; bit 0 covers everything.
pub fn write_masked<S: SerSink + ?Sized>(sink: &mut S, value: &PVStructure, mask: &BitSet) -> NetResult<()> {
    if mask.get(0) {
        return write_structure(sink, value);
    }
    write_masked_inner(sink, value, mask, 0)
}

fn write_masked_inner<S: SerSink + ?Sized>(
    sink: &mut S,
    value: &PVStructure,
    mask: &BitSet,
    base: usize,
) -> NetResult<()> {
    let structure = value.structure().clone();
    for index in 0..structure.len() {
        let offset = base + structure.offset(index);
        if mask.get(offset) {
            write_value(sink, value.field(index))?;
        } else if let PVField::Structure(nested) = value.field(index) {
            write_masked_inner(sink, nested, mask, offset)?;
        }
    }
    Ok(())
}

/// Inverse of [`write_masked`]: reads the raised nodes into `value`.
pub fn read_masked<D: DeserSource + ?Sized>(
    src: &mut D,
    value: &mut PVStructure,
    mask: &BitSet,
) -> NetResult<()> {
    if mask.get(0) {
        let fresh = read_structure(src, &value.structure().clone())?;
        *value = fresh;
        return Ok(());
    }
    read_masked_inner(src, value, mask, 0)
}

fn read_masked_inner<D: DeserSource + ?Sized>(
    src: &mut D,
    value: &mut PVStructure,
    mask: &BitSet,
    base: usize,
) -> NetResult<()> {
    let structure = value.structure().clone();
    for index in 0..structure.len() {
        let offset = base + structure.offset(index);
        if mask.get(offset) {
            let field = &structure.fields()[index].1;
            *value.field_mut(index) = read_value(src, field)?;
        } else if let PVField::Structure(nested) = value.field_mut(index) {
            read_masked_inner(src, nested, mask, offset)?;
        }
    }
    Ok(())
}

/// Type descriptor followed by the full value, or a single null tag.
pub fn write_full<S: SerSink + ?Sized>(sink: &mut S, value: Option<&PVStructure>) -> NetResult<()> {
    match value {
        Some(value) => {
            write_field_desc(sink, &Field::Structure(value.structure().clone()))?;
            write_structure(sink, value)
        }
        None => write_opt_field_desc(sink, None),
    }
}

pub fn read_full<D: DeserSource + ?Sized>(src: &mut D) -> NetResult<Option<PVStructure>> {
    let field = match read_opt_field_desc(src)? {
        Some(field) => field,
        None => return Ok(None),
    };
    match field {
        Field::Structure(structure) => read_structure(src, &structure).map(Some),
        _ => Err(NetError::InvalidStream("expected a structure descriptor")),
    }
}

pub fn write_bitset<S: SerSink + ?Sized>(sink: &mut S, set: &BitSet) -> NetResult<()> {
    let len = set.byte_len();
    write_size(sink, len)?;
    for index in 0..len {
        sink.ensure(1)?;
        sink.buffer().put_u8(set.byte(index));
    }
    Ok(())
}

pub fn read_bitset<D: DeserSource + ?Sized>(src: &mut D) -> NetResult<BitSet> {
    let len = read_size(src)?.ok_or(NetError::InvalidStream("null bitset size"))?;
    let mut set = BitSet::new();
    for index in 0..len {
        src.ensure(1)?;
        set.set_byte(index, src.buffer().get_u8());
    }
    Ok(set)
}

pub fn write_status<S: SerSink + ?Sized>(sink: &mut S, status: &Status) -> NetResult<()> {
    if status.is_ok() && status.message.is_empty() && status.call_tree.is_empty() {
        sink.ensure(1)?;
        sink.buffer().put_u8(0xFF);
        return Ok(());
    }
    sink.ensure(1)?;
    sink.buffer().put_u8(status.kind.code());
    write_string(sink, &status.message)?;
    write_string(sink, &status.call_tree)
}

pub fn read_status<D: DeserSource + ?Sized>(src: &mut D) -> NetResult<Status> {
    src.ensure(1)?;
    let code = src.buffer().get_u8();
    if code == 0xFF {
        return Ok(Status::ok());
    }
    let kind = StatusKind::from_code(code).ok_or(NetError::InvalidStream("unknown status kind"))?;
    let message = read_string(src)?;
    let call_tree = read_string(src)?;
    Ok(Status {
        kind,
        message,
        call_tree,
    })
}
