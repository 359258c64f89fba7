//! Structure type descriptions and the value storage matching them.
//!
//! Every node of a structure owns one change bit, assigned depth-first:
//! bit 0 is the structure itself, followed by each field and, for nested
//! structures, their children. The offsets are computed once when the type
//! is built so masked copies and subset mappers can be table driven.

use crate::data::bitset::BitSet;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScalarKind {
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    UByte,
    UShort,
    UInt,
    ULong,
    Float,
    Double,
    Str,
}

impl ScalarKind {
    pub const ALL: [ScalarKind; 12] = [
        ScalarKind::Boolean,
        ScalarKind::Byte,
        ScalarKind::Short,
        ScalarKind::Int,
        ScalarKind::Long,
        ScalarKind::UByte,
        ScalarKind::UShort,
        ScalarKind::UInt,
        ScalarKind::ULong,
        ScalarKind::Float,
        ScalarKind::Double,
        ScalarKind::Str,
    ];

    #[inline]
    pub fn code(self) -> u8 {
        match self {
            ScalarKind::Boolean => 0,
            ScalarKind::Byte => 1,
            ScalarKind::Short => 2,
            ScalarKind::Int => 3,
            ScalarKind::Long => 4,
            ScalarKind::UByte => 5,
            ScalarKind::UShort => 6,
            ScalarKind::UInt => 7,
            ScalarKind::ULong => 8,
            ScalarKind::Float => 9,
            ScalarKind::Double => 10,
            ScalarKind::Str => 11,
        }
    }

    #[inline]
    pub fn from_code(code: u8) -> Option<ScalarKind> {
        ScalarKind::ALL.get(code as usize).copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    Scalar(ScalarKind),
    ScalarArray(ScalarKind),
    Structure(Arc<Structure>),
}

impl Field {
    /// Bits this node occupies, itself included.
    #[inline]
    pub fn bit_count(&self) -> usize {
        match self {
            Field::Scalar(_) | Field::ScalarArray(_) => 1,
            Field::Structure(s) => s.bit_count(),
        }
    }
}

/// An ordered, named collection of fields with an optional type id.
#[derive(Debug, PartialEq)]
pub struct Structure {
    id: String,
    fields: Vec<(String, Field)>,
    /// Bit offset of each field relative to the structure's own bit.
    offsets: Vec<usize>,
    bit_count: usize,
}

impl Structure {
    pub fn new<I: Into<String>>(id: I, fields: Vec<(String, Field)>) -> Arc<Structure> {
        let mut offsets = Vec::with_capacity(fields.len());
        let mut next = 1;
        for (_, field) in &fields {
            offsets.push(next);
            next += field.bit_count();
        }
        Arc::new(Structure {
            id: id.into(),
            fields,
            offsets,
            bit_count: next,
        })
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn fields(&self) -> &[(String, Field)] {
        &self.fields
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Total bits occupied by this structure and everything below it.
    #[inline]
    pub fn bit_count(&self) -> usize {
        self.bit_count
    }

    /// Bit offset of field `index` relative to the structure's own bit.
    #[inline]
    pub fn offset(&self, index: usize) -> usize {
        self.offsets[index]
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(field_name, _)| field_name == name)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.index_of(name).map(|index| &self.fields[index].1)
    }

    /// Resolves a dotted path to `(field index path, bit offset)`.
    pub fn resolve(&self, path: &[String]) -> Option<(Vec<usize>, usize)> {
        let mut indices = Vec::with_capacity(path.len());
        let mut offset = 0;
        let mut current = self;
        for (depth, name) in path.iter().enumerate() {
            let index = current.index_of(name)?;
            offset += current.offset(index);
            indices.push(index);
            if depth + 1 < path.len() {
                match &current.fields[index].1 {
                    Field::Structure(nested) => current = &**nested,
                    _ => return None,
                }
            }
        }
        Some((indices, offset))
    }
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "structure")?;
        if !self.id.is_empty() {
            write!(f, " {}", self.id)?;
        }
        write!(f, " {{")?;
        for (index, (name, field)) in self.fields.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            match field {
                Field::Scalar(kind) => write!(f, "{}: {:?}", name, kind)?,
                Field::ScalarArray(kind) => write!(f, "{}: {:?}[]", name, kind)?,
                Field::Structure(nested) => write!(f, "{}: {}", name, nested)?,
            }
        }
        write!(f, "}}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PVField {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    UByte(u8),
    UShort(u16),
    UInt(u32),
    ULong(u64),
    Float(f32),
    Double(f64),
    Str(String),
    BooleanArray(Vec<bool>),
    ByteArray(Vec<i8>),
    ShortArray(Vec<i16>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    UByteArray(Vec<u8>),
    UShortArray(Vec<u16>),
    UIntArray(Vec<u32>),
    ULongArray(Vec<u64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    StrArray(Vec<String>),
    Structure(PVStructure),
}

impl PVField {
    pub fn default_for(field: &Field) -> PVField {
        match field {
            Field::Scalar(kind) => match kind {
                ScalarKind::Boolean => PVField::Boolean(false),
                ScalarKind::Byte => PVField::Byte(0),
                ScalarKind::Short => PVField::Short(0),
                ScalarKind::Int => PVField::Int(0),
                ScalarKind::Long => PVField::Long(0),
                ScalarKind::UByte => PVField::UByte(0),
                ScalarKind::UShort => PVField::UShort(0),
                ScalarKind::UInt => PVField::UInt(0),
                ScalarKind::ULong => PVField::ULong(0),
                ScalarKind::Float => PVField::Float(0.0),
                ScalarKind::Double => PVField::Double(0.0),
                ScalarKind::Str => PVField::Str(String::new()),
            },
            Field::ScalarArray(kind) => match kind {
                ScalarKind::Boolean => PVField::BooleanArray(Vec::new()),
                ScalarKind::Byte => PVField::ByteArray(Vec::new()),
                ScalarKind::Short => PVField::ShortArray(Vec::new()),
                ScalarKind::Int => PVField::IntArray(Vec::new()),
                ScalarKind::Long => PVField::LongArray(Vec::new()),
                ScalarKind::UByte => PVField::UByteArray(Vec::new()),
                ScalarKind::UShort => PVField::UShortArray(Vec::new()),
                ScalarKind::UInt => PVField::UIntArray(Vec::new()),
                ScalarKind::ULong => PVField::ULongArray(Vec::new()),
                ScalarKind::Float => PVField::FloatArray(Vec::new()),
                ScalarKind::Double => PVField::DoubleArray(Vec::new()),
                ScalarKind::Str => PVField::StrArray(Vec::new()),
            },
            Field::Structure(nested) => PVField::Structure(PVStructure::new_default(nested.clone())),
        }
    }

    #[inline]
    pub fn as_int(&self) -> Option<i32> {
        match self {
            PVField::Int(value) => Some(*value),
            _ => None,
        }
    }

    #[inline]
    pub fn as_double(&self) -> Option<f64> {
        match self {
            PVField::Double(value) => Some(*value),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PVField::Str(value) => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub fn as_ubyte_array(&self) -> Option<&[u8]> {
        match self {
            PVField::UByteArray(value) => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub fn as_structure(&self) -> Option<&PVStructure> {
        match self {
            PVField::Structure(value) => Some(value),
            _ => None,
        }
    }
}

/// A value whose shape is described by a [`Structure`]. Field storage is in
/// declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct PVStructure {
    structure: Arc<Structure>,
    fields: Vec<PVField>,
}

impl PVStructure {
    /// Allocates a value of `structure` with every field at its default.
    pub fn new_default(structure: Arc<Structure>) -> PVStructure {
        let fields = structure
            .fields()
            .iter()
            .map(|(_, field)| PVField::default_for(field))
            .collect();
        PVStructure { structure, fields }
    }

    pub(crate) fn from_parts(structure: Arc<Structure>, fields: Vec<PVField>) -> PVStructure {
        debug_assert_eq!(structure.len(), fields.len());
        PVStructure { structure, fields }
    }

    #[inline]
    pub fn structure(&self) -> &Arc<Structure> {
        &self.structure
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn field(&self, index: usize) -> &PVField {
        &self.fields[index]
    }

    #[inline]
    pub fn field_mut(&mut self, index: usize) -> &mut PVField {
        &mut self.fields[index]
    }

    pub fn get(&self, name: &str) -> Option<&PVField> {
        self.structure.index_of(name).map(move |index| &self.fields[index])
    }

    /// Replaces the named top-level field. The replacement must match the
    /// declared shape.
    pub fn set(&mut self, name: &str, value: PVField) -> Result<(), String> {
        let index = match self.structure.index_of(name) {
            Some(index) => index,
            None => return Err(format!("no field named {}", name)),
        };
        if std::mem::discriminant(&self.fields[index]) != std::mem::discriminant(&value) {
            return Err(format!("field {} shape mismatch", name));
        }
        self.fields[index] = value;
        Ok(())
    }

    pub fn get_path(&self, path: &[usize]) -> &PVField {
        let mut current = self;
        for (depth, &index) in path.iter().enumerate() {
            if depth + 1 == path.len() {
                return &current.fields[index];
            }
            current = match &current.fields[index] {
                PVField::Structure(nested) => nested,
                _ => panic!("path does not address a structure"),
            };
        }
        unreachable!("empty field path")
    }

    pub fn get_path_mut(&mut self, path: &[usize]) -> &mut PVField {
        let mut current = self;
        for (depth, &index) in path.iter().enumerate() {
            if depth + 1 == path.len() {
                return &mut current.fields[index];
            }
            current = match &mut current.fields[index] {
                PVField::Structure(nested) => nested,
                _ => panic!("path does not address a structure"),
            };
        }
        unreachable!("empty field path")
    }

    /// Copies the fields marked in `mask` from `src`. Bit 0 selects the
    /// whole structure. Both values must share one type; this is checked by
    /// the callers that accept external input.
    pub fn copy_from_masked(&mut self, src: &PVStructure, mask: &BitSet) {
        debug_assert_eq!(self.structure, src.structure);
        if mask.get(0) {
            self.fields.clone_from(&src.fields);
            return;
        }
        copy_masked_inner(self, src, mask, 0);
    }
}

fn copy_masked_inner(dst: &mut PVStructure, src: &PVStructure, mask: &BitSet, base: usize) {
    let structure = dst.structure.clone();
    for index in 0..structure.len() {
        let offset = base + structure.offset(index);
        if mask.get(offset) {
            dst.fields[index] = src.fields[index].clone();
            continue;
        }
        if let (PVField::Structure(dst_nested), PVField::Structure(src_nested)) =
            (&mut dst.fields[index], &src.fields[index])
        {
            copy_masked_inner(dst_nested, src_nested, mask, offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested_type() -> Arc<Structure> {
        Structure::new(
            "test:rec",
            vec![
                ("value".to_owned(), Field::Scalar(ScalarKind::Int)),
                (
                    "alarm".to_owned(),
                    Field::Structure(Structure::new(
                        "",
                        vec![
                            ("severity".to_owned(), Field::Scalar(ScalarKind::Int)),
                            ("message".to_owned(), Field::Scalar(ScalarKind::Str)),
                        ],
                    )),
                ),
                ("data".to_owned(), Field::ScalarArray(ScalarKind::UByte)),
            ],
        )
    }

    #[test]
    fn test_bit_offsets() {
        let t = nested_type();

        // self=0, value=1, alarm=2, alarm.severity=3, alarm.message=4, data=5
        assert_eq!(t.bit_count(), 6);
        assert_eq!(t.offset(0), 1);
        assert_eq!(t.offset(1), 2);
        assert_eq!(t.offset(2), 5);

        let (path, offset) = t.resolve(&["alarm".to_owned(), "message".to_owned()]).unwrap();
        assert_eq!(path, vec![1, 1]);
        assert_eq!(offset, 4);
    }

    #[test]
    fn test_resolve_non_structure_path() {
        let t = nested_type();
        assert!(t.resolve(&["value".to_owned(), "x".to_owned()]).is_none());
        assert!(t.resolve(&["nope".to_owned()]).is_none());
    }

    #[test]
    fn test_default_value() {
        let value = PVStructure::new_default(nested_type());
        assert_eq!(value.get("value").unwrap().as_int(), Some(0));
        let alarm = value.get("alarm").unwrap().as_structure().unwrap();
        assert_eq!(alarm.get("message").unwrap().as_str(), Some(""));
    }

    #[test]
    fn test_set_type_checked() {
        let mut value = PVStructure::new_default(nested_type());
        value.set("value", PVField::Int(7)).unwrap();
        assert!(value.set("value", PVField::Double(1.0)).is_err());
        assert!(value.set("missing", PVField::Int(1)).is_err());
    }

    #[test]
    fn test_masked_copy_leaf() {
        let t = nested_type();
        let mut dst = PVStructure::new_default(t.clone());
        let mut src = PVStructure::new_default(t);
        src.set("value", PVField::Int(42)).unwrap();
        src.set("data", PVField::UByteArray(vec![1, 2, 3])).unwrap();

        dst.copy_from_masked(&src, &BitSet::of(1));
        assert_eq!(dst.get("value").unwrap().as_int(), Some(42));
        // data bit (5) not raised
        assert_eq!(dst.get("data").unwrap().as_ubyte_array(), Some(&[][..]));
    }

    #[test]
    fn test_masked_copy_nested_and_whole() {
        let t = nested_type();
        let mut dst = PVStructure::new_default(t.clone());
        let mut src = PVStructure::new_default(t);
        if let PVField::Structure(alarm) = src.field_mut(1) {
            alarm.set("severity", PVField::Int(2)).unwrap();
            alarm.set("message", PVField::Str("HIGH".to_owned())).unwrap();
        }

        // bit 3 = alarm.severity only
        dst.copy_from_masked(&src, &BitSet::of(3));
        let alarm = dst.get("alarm").unwrap().as_structure().unwrap();
        assert_eq!(alarm.get("severity").unwrap().as_int(), Some(2));
        assert_eq!(alarm.get("message").unwrap().as_str(), Some(""));

        // bit 0 = everything
        dst.copy_from_masked(&src, &BitSet::of(0));
        let alarm = dst.get("alarm").unwrap().as_structure().unwrap();
        assert_eq!(alarm.get("message").unwrap().as_str(), Some("HIGH"));
    }
}
