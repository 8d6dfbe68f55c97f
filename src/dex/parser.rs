//! DEX container parsing.
//!
//! Decodes the header, the id pools and every class definition of a single
//! `classes*.dex` image. Offsets and counts read from the file are never
//! trusted: every access is bounds-checked and reported as
//! [`DexError::Truncated`] or [`DexError::InvalidIndex`].

use std::collections::HashMap;

use super::value::{Annotation, read_encoded_annotation};
use super::{ClassDef, DexError, DexResult, MethodDef, descriptor_to_class_name};

const HEADER_SIZE: usize = 0x70;
const ENDIAN_CONSTANT: u32 = 0x1234_5678;
const NO_INDEX: u32 = 0xffff_ffff;
const VISIBILITY_SYSTEM: u8 = 0x02;

/// Little-endian cursor over a byte slice.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Creates a reader positioned at `offset`.
    pub(crate) fn at(data: &'a [u8], offset: usize) -> DexResult<Self> {
        if offset > data.len() {
            return Err(DexError::Truncated { offset, needed: 0 });
        }
        Ok(Self { data, pos: offset })
    }

    pub(crate) fn bytes(&mut self, len: usize) -> DexResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(DexError::Truncated {
                offset: self.pos,
                needed: len,
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> DexResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> DexResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> DexResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads an unsigned LEB128 value of at most five bytes.
    pub(crate) fn uleb128(&mut self) -> DexResult<u32> {
        let mut result = 0u32;
        for i in 0..5 {
            let byte = self.u8()?;
            result |= u32::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(DexError::Malformed("uleb128 value longer than 5 bytes".into()))
    }
}

#[derive(Debug, Clone, Copy)]
struct Section {
    size: u32,
    offset: u32,
}

impl Section {
    /// Returns a reader at the start of the section after checking that
    /// `size * item_size` bytes are actually present.
    fn reader<'a>(&self, data: &'a [u8], item_size: usize) -> DexResult<ByteReader<'a>> {
        let offset = self.offset as usize;
        let needed = (self.size as usize).saturating_mul(item_size);
        if offset.saturating_add(needed) > data.len() {
            return Err(DexError::Truncated { offset, needed });
        }
        ByteReader::at(data, offset)
    }
}

struct Header {
    version: String,
    string_ids: Section,
    type_ids: Section,
    proto_ids: Section,
    field_ids: Section,
    method_ids: Section,
    class_defs: Section,
}

fn parse_header(data: &[u8]) -> DexResult<Header> {
    if data.len() < 8 || &data[..4] != b"dex\n" || data[7] != 0 {
        return Err(DexError::BadMagic(data[..data.len().min(8)].to_vec()));
    }
    if data.len() < HEADER_SIZE {
        return Err(DexError::Truncated {
            offset: 0,
            needed: HEADER_SIZE,
        });
    }
    let version = String::from_utf8_lossy(&data[4..7]).into_owned();

    let mut reader = ByteReader::at(data, 40)?;
    let endian_tag = reader.u32()?;
    if endian_tag != ENDIAN_CONSTANT {
        return Err(DexError::Malformed(format!(
            "unsupported endian tag {endian_tag:#010x}"
        )));
    }

    let mut reader = ByteReader::at(data, 56)?;
    let mut section = || -> DexResult<Section> {
        Ok(Section {
            size: reader.u32()?,
            offset: reader.u32()?,
        })
    };

    Ok(Header {
        version,
        string_ids: section()?,
        type_ids: section()?,
        proto_ids: section()?,
        field_ids: section()?,
        method_ids: section()?,
        class_defs: section()?,
    })
}

struct Proto {
    return_type: u32,
    parameters: Vec<u32>,
}

struct MemberId {
    class_idx: u32,
    name_idx: u32,
}

struct MethodId {
    member: MemberId,
    proto_idx: u32,
}

/// The decoded id pools of one DEX image.
pub(crate) struct Pools {
    strings: Vec<String>,
    types: Vec<u32>,
    protos: Vec<Proto>,
    fields: Vec<MemberId>,
    methods: Vec<MethodId>,
}

impl Pools {
    fn parse(data: &[u8], header: &Header) -> DexResult<Self> {
        let mut reader = header.string_ids.reader(data, 4)?;
        let mut strings = Vec::with_capacity(header.string_ids.size as usize);
        for _ in 0..header.string_ids.size {
            let offset = reader.u32()? as usize;
            strings.push(read_string_data(data, offset)?);
        }

        let mut reader = header.type_ids.reader(data, 4)?;
        let mut types = Vec::with_capacity(header.type_ids.size as usize);
        for _ in 0..header.type_ids.size {
            types.push(reader.u32()?);
        }

        let mut reader = header.proto_ids.reader(data, 12)?;
        let mut protos = Vec::with_capacity(header.proto_ids.size as usize);
        for _ in 0..header.proto_ids.size {
            let _shorty_idx = reader.u32()?;
            let return_type = reader.u32()?;
            let parameters_off = reader.u32()? as usize;
            let parameters = if parameters_off == 0 {
                Vec::new()
            } else {
                read_type_list(data, parameters_off)?
            };
            protos.push(Proto {
                return_type,
                parameters,
            });
        }

        let mut reader = header.field_ids.reader(data, 8)?;
        let mut fields = Vec::with_capacity(header.field_ids.size as usize);
        for _ in 0..header.field_ids.size {
            let class_idx = u32::from(reader.u16()?);
            let _type_idx = reader.u16()?;
            let name_idx = reader.u32()?;
            fields.push(MemberId {
                class_idx,
                name_idx,
            });
        }

        let mut reader = header.method_ids.reader(data, 8)?;
        let mut methods = Vec::with_capacity(header.method_ids.size as usize);
        for _ in 0..header.method_ids.size {
            let class_idx = u32::from(reader.u16()?);
            let proto_idx = u32::from(reader.u16()?);
            let name_idx = reader.u32()?;
            methods.push(MethodId {
                member: MemberId {
                    class_idx,
                    name_idx,
                },
                proto_idx,
            });
        }

        Ok(Self {
            strings,
            types,
            protos,
            fields,
            methods,
        })
    }

    pub(crate) fn string(&self, idx: u32) -> DexResult<&str> {
        self.strings
            .get(idx as usize)
            .map(String::as_str)
            .ok_or(DexError::InvalidIndex { kind: "string", index: idx })
    }

    /// Returns the dotted name of a type id.
    pub(crate) fn type_name(&self, idx: u32) -> DexResult<String> {
        let descriptor_idx = *self
            .types
            .get(idx as usize)
            .ok_or(DexError::InvalidIndex { kind: "type", index: idx })?;
        Ok(descriptor_to_class_name(self.string(descriptor_idx)?))
    }

    /// Returns `Class.field` for a field id.
    pub(crate) fn field_name(&self, idx: u32) -> DexResult<String> {
        let field = self
            .fields
            .get(idx as usize)
            .ok_or(DexError::InvalidIndex { kind: "field", index: idx })?;
        Ok(format!(
            "{}.{}",
            self.type_name(field.class_idx)?,
            self.string(field.name_idx)?
        ))
    }

    /// Returns `Class#method` for a method id.
    pub(crate) fn method_name(&self, idx: u32) -> DexResult<String> {
        let method = self.method(idx)?;
        Ok(format!(
            "{}#{}",
            self.type_name(method.member.class_idx)?,
            self.string(method.member.name_idx)?
        ))
    }

    fn method(&self, idx: u32) -> DexResult<&MethodId> {
        self.methods
            .get(idx as usize)
            .ok_or(DexError::InvalidIndex { kind: "method", index: idx })
    }

    fn proto(&self, idx: u32) -> DexResult<&Proto> {
        self.protos
            .get(idx as usize)
            .ok_or(DexError::InvalidIndex { kind: "proto", index: idx })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(strings: Vec<String>, types: Vec<u32>) -> Self {
        Self {
            strings,
            types,
            protos: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }
}

fn read_string_data(data: &[u8], offset: usize) -> DexResult<String> {
    let mut reader = ByteReader::at(data, offset)?;
    let _utf16_len = reader.uleb128()?;
    let start = reader.pos;
    let len = data[start..]
        .iter()
        .position(|b| *b == 0)
        .ok_or(DexError::Truncated {
            offset: start,
            needed: 1,
        })?;
    decode_mutf8(&data[start..start + len])
}

/// Decodes Modified UTF-8 as used by DEX string data.
///
/// Supplementary characters are stored as two encoded surrogates, and NUL as
/// the two-byte form `c0 80`, so decoding goes through UTF-16 code units.
pub(crate) fn decode_mutf8(bytes: &[u8]) -> DexResult<String> {
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    let continuation = |idx: usize| -> DexResult<u16> {
        match bytes.get(idx) {
            Some(b) if b & 0xc0 == 0x80 => Ok(u16::from(b & 0x3f)),
            _ => Err(DexError::Malformed(format!(
                "invalid MUTF-8 sequence at byte {idx}"
            ))),
        }
    };

    while i < bytes.len() {
        let b = bytes[i];
        if b & 0x80 == 0 {
            units.push(u16::from(b));
            i += 1;
        } else if b & 0xe0 == 0xc0 {
            units.push((u16::from(b & 0x1f) << 6) | continuation(i + 1)?);
            i += 2;
        } else if b & 0xf0 == 0xe0 {
            units.push(
                (u16::from(b & 0x0f) << 12) | (continuation(i + 1)? << 6) | continuation(i + 2)?,
            );
            i += 3;
        } else {
            return Err(DexError::Malformed(format!(
                "invalid MUTF-8 lead byte {b:#04x} at byte {i}"
            )));
        }
    }

    Ok(String::from_utf16_lossy(&units))
}

fn read_type_list(data: &[u8], offset: usize) -> DexResult<Vec<u32>> {
    let mut reader = ByteReader::at(data, offset)?;
    let size = reader.u32()? as usize;
    let mut items = ByteReader::new(reader.bytes(size.saturating_mul(2))?);
    (0..size).map(|_| Ok(u32::from(items.u16()?))).collect()
}

fn read_annotation_set(data: &[u8], offset: usize, pools: &Pools) -> DexResult<Vec<Annotation>> {
    let mut reader = ByteReader::at(data, offset)?;
    let size = reader.u32()? as usize;
    let mut entries = ByteReader::new(reader.bytes(size.saturating_mul(4))?);

    let mut annotations = Vec::with_capacity(size);
    for _ in 0..size {
        let item_offset = entries.u32()? as usize;
        let mut item = ByteReader::at(data, item_offset)?;
        let visibility = item.u8()?;
        let annotation = read_encoded_annotation(&mut item, pools)?;
        // dalvik.annotation.* bookkeeping, not source annotations
        if visibility != VISIBILITY_SYSTEM {
            annotations.push(annotation);
        }
    }
    Ok(annotations)
}

#[derive(Default)]
struct AnnotationsDirectory {
    class: Vec<Annotation>,
    methods: HashMap<u32, Vec<Annotation>>,
}

fn read_annotations_directory(
    data: &[u8],
    offset: usize,
    pools: &Pools,
) -> DexResult<AnnotationsDirectory> {
    let mut reader = ByteReader::at(data, offset)?;
    let class_annotations_off = reader.u32()? as usize;
    let fields_size = reader.u32()? as usize;
    let methods_size = reader.u32()? as usize;
    let _parameters_size = reader.u32()?;

    let class = if class_annotations_off == 0 {
        Vec::new()
    } else {
        read_annotation_set(data, class_annotations_off, pools)?
    };

    reader.bytes(fields_size.saturating_mul(8))?;

    let mut methods = HashMap::new();
    for _ in 0..methods_size {
        let method_idx = reader.u32()?;
        let annotations_off = reader.u32()? as usize;
        methods.insert(method_idx, read_annotation_set(data, annotations_off, pools)?);
    }

    Ok(AnnotationsDirectory { class, methods })
}

fn read_class_methods(
    data: &[u8],
    offset: usize,
    pools: &Pools,
    method_annotations: &mut HashMap<u32, Vec<Annotation>>,
) -> DexResult<Vec<MethodDef>> {
    let mut reader = ByteReader::at(data, offset)?;
    let static_fields = reader.uleb128()?;
    let instance_fields = reader.uleb128()?;
    let direct_methods = reader.uleb128()?;
    let virtual_methods = reader.uleb128()?;

    for _ in 0..u64::from(static_fields) + u64::from(instance_fields) {
        reader.uleb128()?; // field_idx_diff
        reader.uleb128()?; // access_flags
    }

    let mut methods = Vec::new();
    for count in [direct_methods, virtual_methods] {
        // method_idx_diff restarts for each list
        let mut method_idx = 0u32;
        for _ in 0..count {
            method_idx = method_idx
                .checked_add(reader.uleb128()?)
                .ok_or_else(|| DexError::Malformed("method index overflow".into()))?;
            let access_flags = reader.uleb128()?;
            let _code_off = reader.uleb128()?;

            let id = pools.method(method_idx)?;
            let proto = pools.proto(id.proto_idx)?;
            methods.push(MethodDef {
                name: pools.string(id.member.name_idx)?.to_string(),
                access_flags,
                return_type: pools.type_name(proto.return_type)?,
                parameters: proto
                    .parameters
                    .iter()
                    .map(|idx| pools.type_name(*idx))
                    .collect::<DexResult<_>>()?,
                annotations: method_annotations.remove(&method_idx).unwrap_or_default(),
            });
        }
    }

    Ok(methods)
}

/// One decoded `classes*.dex` image.
#[derive(Debug, Clone, PartialEq)]
pub struct DexFile {
    /// Format version from the magic, e.g. `035`.
    pub version: String,

    /// Class definitions in file order.
    pub classes: Vec<ClassDef>,
}

impl DexFile {
    /// Decodes a complete DEX image.
    ///
    /// # Errors
    ///
    /// Returns a [`DexError`] if the magic is wrong or any structure points
    /// outside the image or at an invalid index.
    pub fn parse(data: &[u8]) -> DexResult<Self> {
        let header = parse_header(data)?;
        let pools = Pools::parse(data, &header)?;

        let mut reader = header.class_defs.reader(data, 32)?;
        let mut classes = Vec::with_capacity(header.class_defs.size as usize);
        for _ in 0..header.class_defs.size {
            let class_idx = reader.u32()?;
            let access_flags = reader.u32()?;
            let superclass_idx = reader.u32()?;
            let _interfaces_off = reader.u32()?;
            let _source_file_idx = reader.u32()?;
            let annotations_off = reader.u32()? as usize;
            let class_data_off = reader.u32()? as usize;
            let _static_values_off = reader.u32()?;

            let mut directory = if annotations_off == 0 {
                AnnotationsDirectory::default()
            } else {
                read_annotations_directory(data, annotations_off, &pools)?
            };

            let methods = if class_data_off == 0 {
                Vec::new()
            } else {
                read_class_methods(data, class_data_off, &pools, &mut directory.methods)?
            };

            classes.push(ClassDef {
                name: pools.type_name(class_idx)?,
                superclass: match superclass_idx {
                    NO_INDEX => None,
                    idx => Some(pools.type_name(idx)?),
                },
                access_flags,
                annotations: directory.class,
                methods,
            });
        }

        Ok(Self {
            version: header.version,
            classes,
        })
    }
}
