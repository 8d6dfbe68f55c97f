//! Annotation values.
//!
//! DEX stores annotation elements as `encoded_value` items: a header byte
//! carrying the value kind and a size argument, followed by a little-endian
//! payload. [`DecodedValue`] is the fully resolved form of those items, with
//! string, type, field and method indices already replaced by names.

use indexmap::IndexMap;

use super::parser::{ByteReader, Pools};
use super::{DexError, DexResult};

const VALUE_BYTE: u8 = 0x00;
const VALUE_SHORT: u8 = 0x02;
const VALUE_CHAR: u8 = 0x03;
const VALUE_INT: u8 = 0x04;
const VALUE_LONG: u8 = 0x06;
const VALUE_FLOAT: u8 = 0x10;
const VALUE_DOUBLE: u8 = 0x11;
const VALUE_METHOD_TYPE: u8 = 0x15;
const VALUE_METHOD_HANDLE: u8 = 0x16;
const VALUE_STRING: u8 = 0x17;
const VALUE_TYPE: u8 = 0x18;
const VALUE_FIELD: u8 = 0x19;
const VALUE_METHOD: u8 = 0x1a;
const VALUE_ENUM: u8 = 0x1b;
const VALUE_ARRAY: u8 = 0x1c;
const VALUE_ANNOTATION: u8 = 0x1d;
const VALUE_NULL: u8 = 0x1e;
const VALUE_BOOLEAN: u8 = 0x1f;

/// Nesting limit for arrays and annotations inside annotation values.
const MAX_DEPTH: usize = 32;

/// A decoded annotation: its dotted type name and its element values.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    /// Dotted annotation type, e.g. `org.junit.runner.RunWith`.
    pub name: String,

    /// Element name to value, in the order they appear in the binary.
    pub values: IndexMap<String, DecodedValue>,
}

impl Annotation {
    /// Creates an annotation with no elements.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: IndexMap::new(),
        }
    }

    /// Adds an element value.
    pub fn with_value(mut self, name: impl Into<String>, value: DecodedValue) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    /// Returns the class names of all top-level `Type` element values.
    pub fn type_values(&self) -> impl Iterator<Item = &str> {
        self.values.values().filter_map(|value| match value {
            DecodedValue::Type(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

/// Every kind of value an annotation element can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    Byte(i8),
    Short(i16),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// Index into `proto_ids`.
    MethodType(u32),
    /// Index into `method_handles`.
    MethodHandle(u32),
    String(String),
    /// Dotted class name (or primitive/array descriptor).
    Type(String),
    /// `Class.field`
    Field(String),
    /// `Class#method`
    Method(String),
    /// `Class.CONSTANT`
    Enum(String),
    Array(Vec<DecodedValue>),
    Annotation(Annotation),
    Null,
    Boolean(bool),
}

/// Reads an `encoded_annotation` at the reader's position.
pub(crate) fn read_encoded_annotation(
    reader: &mut ByteReader<'_>,
    pools: &Pools,
) -> DexResult<Annotation> {
    read_annotation_at_depth(reader, pools, 0)
}

fn read_annotation_at_depth(
    reader: &mut ByteReader<'_>,
    pools: &Pools,
    depth: usize,
) -> DexResult<Annotation> {
    let type_idx = reader.uleb128()?;
    let name = pools.type_name(type_idx)?;
    let size = reader.uleb128()?;

    let mut values = IndexMap::new();
    for _ in 0..size {
        let name_idx = reader.uleb128()?;
        let element = pools.string(name_idx)?.to_string();
        let value = read_value_at_depth(reader, pools, depth + 1)?;
        values.insert(element, value);
    }

    Ok(Annotation { name, values })
}

fn read_value_at_depth(
    reader: &mut ByteReader<'_>,
    pools: &Pools,
    depth: usize,
) -> DexResult<DecodedValue> {
    if depth > MAX_DEPTH {
        return Err(DexError::Malformed(
            "annotation values nested too deeply".to_string(),
        ));
    }

    let header = reader.u8()?;
    let kind = header & 0x1f;
    let arg = (header >> 5) as usize;

    let value = match kind {
        VALUE_BYTE => DecodedValue::Byte(read_signed(reader, kind, arg, 1)? as i8),
        VALUE_SHORT => DecodedValue::Short(read_signed(reader, kind, arg, 2)? as i16),
        VALUE_CHAR => DecodedValue::Char(read_unsigned(reader, kind, arg, 2)? as u16),
        VALUE_INT => DecodedValue::Int(read_signed(reader, kind, arg, 4)? as i32),
        VALUE_LONG => DecodedValue::Long(read_signed(reader, kind, arg, 8)?),
        VALUE_FLOAT => {
            let bits = read_right_extended(reader, kind, arg, 4)?;
            DecodedValue::Float(f32::from_bits(bits as u32))
        }
        VALUE_DOUBLE => {
            let bits = read_right_extended(reader, kind, arg, 8)?;
            DecodedValue::Double(f64::from_bits(bits))
        }
        VALUE_METHOD_TYPE => DecodedValue::MethodType(read_index(reader, kind, arg)?),
        VALUE_METHOD_HANDLE => DecodedValue::MethodHandle(read_index(reader, kind, arg)?),
        VALUE_STRING => {
            let idx = read_index(reader, kind, arg)?;
            DecodedValue::String(pools.string(idx)?.to_string())
        }
        VALUE_TYPE => DecodedValue::Type(pools.type_name(read_index(reader, kind, arg)?)?),
        VALUE_FIELD => DecodedValue::Field(pools.field_name(read_index(reader, kind, arg)?)?),
        VALUE_METHOD => {
            DecodedValue::Method(pools.method_name(read_index(reader, kind, arg)?)?)
        }
        VALUE_ENUM => DecodedValue::Enum(pools.field_name(read_index(reader, kind, arg)?)?),
        VALUE_ARRAY => {
            expect_arg(kind, arg, 0)?;
            let size = reader.uleb128()?;
            let mut items = Vec::new();
            for _ in 0..size {
                items.push(read_value_at_depth(reader, pools, depth + 1)?);
            }
            DecodedValue::Array(items)
        }
        VALUE_ANNOTATION => {
            expect_arg(kind, arg, 0)?;
            DecodedValue::Annotation(read_annotation_at_depth(reader, pools, depth + 1)?)
        }
        VALUE_NULL => {
            expect_arg(kind, arg, 0)?;
            DecodedValue::Null
        }
        VALUE_BOOLEAN => match arg {
            0 => DecodedValue::Boolean(false),
            1 => DecodedValue::Boolean(true),
            _ => return Err(bad_arg(kind, arg)),
        },
        other => {
            return Err(DexError::Malformed(format!(
                "unknown encoded value type {other:#04x}"
            )));
        }
    };

    Ok(value)
}

fn bad_arg(kind: u8, arg: usize) -> DexError {
    DexError::Malformed(format!(
        "invalid size argument {arg} for encoded value type {kind:#04x}"
    ))
}

fn expect_arg(kind: u8, arg: usize, expected: usize) -> DexResult<()> {
    if arg == expected {
        Ok(())
    } else {
        Err(bad_arg(kind, arg))
    }
}

/// Reads `arg + 1` little-endian bytes, zero-extended.
fn read_unsigned(
    reader: &mut ByteReader<'_>,
    kind: u8,
    arg: usize,
    width: usize,
) -> DexResult<u64> {
    let size = arg + 1;
    if size > width {
        return Err(bad_arg(kind, arg));
    }
    let bytes = reader.bytes(size)?;
    Ok(bytes
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | (u64::from(*b) << (8 * i))))
}

/// Reads `arg + 1` little-endian bytes, sign-extended to 64 bits.
fn read_signed(reader: &mut ByteReader<'_>, kind: u8, arg: usize, width: usize) -> DexResult<i64> {
    let raw = read_unsigned(reader, kind, arg, width)?;
    let shift = 64 - 8 * (arg + 1) as u32;
    Ok(((raw << shift) as i64) >> shift)
}

/// Reads `arg + 1` bytes that hold the high-order bytes of a `width`-byte value.
fn read_right_extended(
    reader: &mut ByteReader<'_>,
    kind: u8,
    arg: usize,
    width: usize,
) -> DexResult<u64> {
    let raw = read_unsigned(reader, kind, arg, width)?;
    Ok(raw << (8 * (width - (arg + 1))))
}

fn read_index(reader: &mut ByteReader<'_>, kind: u8, arg: usize) -> DexResult<u32> {
    Ok(read_unsigned(reader, kind, arg, 4)? as u32)
}
