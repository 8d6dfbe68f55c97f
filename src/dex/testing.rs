//! In-memory DEX and APK writers used by unit tests.
//!
//! The writer lays out a minimal but well-formed image: sorted id pools, one
//! data section and no map list. Only the annotation value kinds that test
//! fixtures need are supported.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use super::{ACC_CONSTRUCTOR, ACC_PUBLIC, ACC_STATIC, Annotation, DecodedValue};

const ACC_PRIVATE: u32 = 0x2;
const NO_INDEX: u32 = 0xffff_ffff;
const VISIBILITY_RUNTIME: u8 = 0x01;
const VISIBILITY_SYSTEM: u8 = 0x02;

pub(crate) struct MethodSpec {
    name: String,
    access: u32,
    return_type: String,
    params: Vec<String>,
    annotations: Vec<Annotation>,
}

impl MethodSpec {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            access: ACC_PUBLIC,
            return_type: "V".to_string(),
            params: Vec::new(),
            annotations: Vec::new(),
        }
    }

    /// A public `void name()` annotated with `org.junit.Test`.
    pub(crate) fn test(name: &str) -> Self {
        Self::new(name).annotation(Annotation::new("org.junit.Test"))
    }

    pub(crate) fn access(mut self, access: u32) -> Self {
        self.access = access;
        self
    }

    pub(crate) fn returns(mut self, return_type: &str) -> Self {
        self.return_type = return_type.to_string();
        self
    }

    pub(crate) fn params(mut self, params: &[&str]) -> Self {
        self.params = params.iter().map(|p| p.to_string()).collect();
        self
    }

    pub(crate) fn annotation(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }
}

pub(crate) struct ClassSpec {
    name: String,
    superclass: Option<String>,
    access: u32,
    annotations: Vec<(u8, Annotation)>,
    methods: Vec<MethodSpec>,
}

impl ClassSpec {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            superclass: Some("java.lang.Object".to_string()),
            access: ACC_PUBLIC,
            annotations: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub(crate) fn superclass(mut self, superclass: &str) -> Self {
        self.superclass = Some(superclass.to_string());
        self
    }

    pub(crate) fn access(mut self, access: u32) -> Self {
        self.access = access;
        self
    }

    pub(crate) fn annotation(mut self, annotation: Annotation) -> Self {
        self.annotations.push((VISIBILITY_RUNTIME, annotation));
        self
    }

    pub(crate) fn system_annotation(mut self, annotation: Annotation) -> Self {
        self.annotations.push((VISIBILITY_SYSTEM, annotation));
        self
    }

    pub(crate) fn method(mut self, method: MethodSpec) -> Self {
        self.methods.push(method);
        self
    }
}

/// A `(return descriptor, parameter descriptors)` pair.
type ProtoKey = (String, Vec<String>);

#[derive(Default)]
pub(crate) struct DexBuilder {
    classes: Vec<ClassSpec>,
}

fn descriptor(name: &str) -> String {
    let primitive = name.len() == 1 && "VZBSCIJFD".contains(name);
    if primitive || name.starts_with('[') {
        name.to_string()
    } else {
        format!("L{};", name.replace('.', "/"))
    }
}

fn shorty_char(descriptor: &str) -> char {
    match descriptor.chars().next() {
        Some('L') | Some('[') => 'L',
        Some(c) => c,
        None => 'V',
    }
}

fn push_uleb128(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn push_mutf8(out: &mut Vec<u8>, s: &str) {
    for unit in s.encode_utf16() {
        match unit {
            0x01..=0x7f => out.push(unit as u8),
            0x00 | 0x80..=0x7ff => {
                out.push(0xc0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                out.push(0xe0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
}

struct Indices {
    strings: BTreeMap<String, u32>,
    types: BTreeMap<String, u32>,
    protos: BTreeMap<ProtoKey, u32>,
    methods: BTreeMap<(String, String, ProtoKey), u32>,
}

impl Indices {
    fn string(&self, s: &str) -> u32 {
        self.strings[s]
    }

    fn type_idx(&self, name: &str) -> u32 {
        self.types[&descriptor(name)]
    }

    fn method(&self, class: &str, method: &MethodSpec) -> u32 {
        self.methods[&(
            descriptor(class),
            method.name.clone(),
            proto_key(method),
        )]
    }
}

fn proto_key(method: &MethodSpec) -> ProtoKey {
    (
        descriptor(&method.return_type),
        method.params.iter().map(|p| descriptor(p)).collect(),
    )
}

fn shorty(key: &ProtoKey) -> String {
    std::iter::once(shorty_char(&key.0))
        .chain(key.1.iter().map(|p| shorty_char(p)))
        .collect()
}

fn collect_annotation(annotation: &Annotation, strings: &mut BTreeSet<String>, types: &mut BTreeSet<String>) {
    types.insert(descriptor(&annotation.name));
    for (name, value) in &annotation.values {
        strings.insert(name.clone());
        collect_value(value, strings, types);
    }
}

fn collect_value(value: &DecodedValue, strings: &mut BTreeSet<String>, types: &mut BTreeSet<String>) {
    match value {
        DecodedValue::Type(t) => {
            types.insert(descriptor(t));
        }
        DecodedValue::String(s) => {
            strings.insert(s.clone());
        }
        DecodedValue::Array(items) => {
            for item in items {
                collect_value(item, strings, types);
            }
        }
        DecodedValue::Annotation(a) => collect_annotation(a, strings, types),
        DecodedValue::Int(_) | DecodedValue::Boolean(_) | DecodedValue::Null => {}
        other => panic!("test DEX writer does not support {other:?}"),
    }
}

fn write_annotation(out: &mut Vec<u8>, annotation: &Annotation, idx: &Indices) {
    push_uleb128(out, idx.type_idx(&annotation.name));
    push_uleb128(out, annotation.values.len() as u32);
    for (name, value) in &annotation.values {
        push_uleb128(out, idx.string(name));
        write_value(out, value, idx);
    }
}

fn write_value(out: &mut Vec<u8>, value: &DecodedValue, idx: &Indices) {
    match value {
        DecodedValue::Type(t) => {
            out.push(0x18 | (3 << 5));
            out.extend_from_slice(&idx.type_idx(t).to_le_bytes());
        }
        DecodedValue::String(s) => {
            out.push(0x17 | (3 << 5));
            out.extend_from_slice(&idx.string(s).to_le_bytes());
        }
        DecodedValue::Int(i) => {
            out.push(0x04 | (3 << 5));
            out.extend_from_slice(&i.to_le_bytes());
        }
        DecodedValue::Boolean(b) => out.push(0x1f | (u8::from(*b) << 5)),
        DecodedValue::Null => out.push(0x1e),
        DecodedValue::Array(items) => {
            out.push(0x1c);
            push_uleb128(out, items.len() as u32);
            for item in items {
                write_value(out, item, idx);
            }
        }
        DecodedValue::Annotation(a) => {
            out.push(0x1d);
            write_annotation(out, a, idx);
        }
        other => panic!("test DEX writer does not support {other:?}"),
    }
}

/// Data section under construction; offsets are absolute file offsets.
struct Data {
    base: usize,
    bytes: Vec<u8>,
}

impl Data {
    fn offset(&self) -> u32 {
        (self.base + self.bytes.len()) as u32
    }

    fn align4(&mut self) {
        while (self.base + self.bytes.len()) % 4 != 0 {
            self.bytes.push(0);
        }
    }

    fn annotation_set(&mut self, annotations: &[(u8, &Annotation)], idx: &Indices) -> u32 {
        let items: Vec<u32> = annotations
            .iter()
            .map(|(visibility, annotation)| {
                let offset = self.offset();
                self.bytes.push(*visibility);
                write_annotation(&mut self.bytes, annotation, idx);
                offset
            })
            .collect();

        self.align4();
        let offset = self.offset();
        self.bytes.extend_from_slice(&(items.len() as u32).to_le_bytes());
        for item in items {
            self.bytes.extend_from_slice(&item.to_le_bytes());
        }
        offset
    }
}

impl DexBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn class(mut self, class: ClassSpec) -> Self {
        self.classes.push(class);
        self
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let mut strings = BTreeSet::new();
        let mut types = BTreeSet::new();
        let mut protos = BTreeSet::new();

        for class in &self.classes {
            types.insert(descriptor(&class.name));
            if let Some(superclass) = &class.superclass {
                types.insert(descriptor(superclass));
            }
            for (_, annotation) in &class.annotations {
                collect_annotation(annotation, &mut strings, &mut types);
            }
            for method in &class.methods {
                strings.insert(method.name.clone());
                let key = proto_key(method);
                types.insert(key.0.clone());
                types.extend(key.1.iter().cloned());
                strings.insert(shorty(&key));
                protos.insert(key);
                for annotation in &method.annotations {
                    collect_annotation(annotation, &mut strings, &mut types);
                }
            }
        }
        strings.extend(types.iter().cloned());

        let string_index: BTreeMap<String, u32> = strings
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32))
            .collect();
        // Descriptors are strings, so sorting by string index is plain string order.
        let type_index: BTreeMap<String, u32> = types
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();

        let mut proto_list: Vec<ProtoKey> = protos.into_iter().collect();
        proto_list.sort_by_key(|(ret, params)| {
            (
                type_index[ret],
                params.iter().map(|p| type_index[p]).collect::<Vec<_>>(),
            )
        });
        let proto_index: BTreeMap<ProtoKey, u32> = proto_list
            .iter()
            .enumerate()
            .map(|(i, p)| (p.clone(), i as u32))
            .collect();

        let mut method_list: Vec<(String, String, ProtoKey)> = self
            .classes
            .iter()
            .flat_map(|class| {
                class
                    .methods
                    .iter()
                    .map(|m| (descriptor(&class.name), m.name.clone(), proto_key(m)))
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        method_list.sort_by_key(|(class, name, proto)| {
            (type_index[class], string_index[name], proto_index[proto])
        });
        let method_index: BTreeMap<(String, String, ProtoKey), u32> = method_list
            .iter()
            .enumerate()
            .map(|(i, m)| (m.clone(), i as u32))
            .collect();

        let idx = Indices {
            strings: string_index,
            types: type_index,
            protos: proto_index,
            methods: method_index,
        };

        let string_ids_off = 0x70;
        let type_ids_off = string_ids_off + 4 * strings.len();
        let proto_ids_off = type_ids_off + 4 * types.len();
        let method_ids_off = proto_ids_off + 12 * proto_list.len();
        let class_defs_off = method_ids_off + 8 * method_list.len();
        let data_off = class_defs_off + 32 * self.classes.len();

        let mut data = Data {
            base: data_off,
            bytes: Vec::new(),
        };

        let mut string_offsets = Vec::with_capacity(strings.len());
        for s in &strings {
            string_offsets.push(data.offset());
            push_uleb128(&mut data.bytes, s.encode_utf16().count() as u32);
            push_mutf8(&mut data.bytes, s);
            data.bytes.push(0);
        }

        let mut parameter_offsets = Vec::with_capacity(proto_list.len());
        for (_, params) in &proto_list {
            if params.is_empty() {
                parameter_offsets.push(0);
                continue;
            }
            data.align4();
            parameter_offsets.push(data.offset());
            data.bytes
                .extend_from_slice(&(params.len() as u32).to_le_bytes());
            for p in params {
                data.bytes
                    .extend_from_slice(&(idx.types[p] as u16).to_le_bytes());
            }
        }

        let mut class_defs = Vec::with_capacity(self.classes.len());
        for class in &self.classes {
            let class_set = if class.annotations.is_empty() {
                0
            } else {
                let annotations: Vec<(u8, &Annotation)> =
                    class.annotations.iter().map(|(v, a)| (*v, a)).collect();
                data.annotation_set(&annotations, &idx)
            };

            let mut method_sets: Vec<(u32, u32)> = class
                .methods
                .iter()
                .filter(|m| !m.annotations.is_empty())
                .map(|m| {
                    let annotations: Vec<(u8, &Annotation)> = m
                        .annotations
                        .iter()
                        .map(|a| (VISIBILITY_RUNTIME, a))
                        .collect();
                    (
                        idx.method(&class.name, m),
                        data.annotation_set(&annotations, &idx),
                    )
                })
                .collect();
            method_sets.sort();

            let annotations_off = if class_set == 0 && method_sets.is_empty() {
                0
            } else {
                data.align4();
                let offset = data.offset();
                for word in [class_set, 0, method_sets.len() as u32, 0] {
                    data.bytes.extend_from_slice(&word.to_le_bytes());
                }
                for (method_idx, set_off) in &method_sets {
                    data.bytes.extend_from_slice(&method_idx.to_le_bytes());
                    data.bytes.extend_from_slice(&set_off.to_le_bytes());
                }
                offset
            };

            let class_data_off = if class.methods.is_empty() {
                0
            } else {
                let is_direct =
                    |m: &MethodSpec| m.access & (ACC_STATIC | ACC_PRIVATE | ACC_CONSTRUCTOR) != 0;
                let mut direct: Vec<(u32, u32)> = Vec::new();
                let mut virtuals: Vec<(u32, u32)> = Vec::new();
                for m in &class.methods {
                    let entry = (idx.method(&class.name, m), m.access);
                    if is_direct(m) {
                        direct.push(entry);
                    } else {
                        virtuals.push(entry);
                    }
                }
                direct.sort();
                virtuals.sort();

                let offset = data.offset();
                for count in [0, 0, direct.len() as u32, virtuals.len() as u32] {
                    push_uleb128(&mut data.bytes, count);
                }
                for list in [&direct, &virtuals] {
                    let mut previous = 0;
                    for (method_idx, access) in list.iter() {
                        push_uleb128(&mut data.bytes, method_idx - previous);
                        push_uleb128(&mut data.bytes, *access);
                        push_uleb128(&mut data.bytes, 0);
                        previous = *method_idx;
                    }
                }
                offset
            };

            class_defs.push([
                idx.type_idx(&class.name),
                class.access,
                class
                    .superclass
                    .as_deref()
                    .map_or(NO_INDEX, |s| idx.type_idx(s)),
                0,
                NO_INDEX,
                annotations_off,
                class_data_off,
                0,
            ]);
        }
        data.align4();

        let file_size = data_off + data.bytes.len();
        let mut out = Vec::with_capacity(file_size);
        out.extend_from_slice(b"dex\n035\0");
        out.extend_from_slice(&[0u8; 4 + 20]); // checksum, signature
        for word in [
            file_size as u32,
            0x70,
            0x1234_5678,
            0,
            0,
            0,
            strings.len() as u32,
            string_ids_off as u32,
            types.len() as u32,
            type_ids_off as u32,
            proto_list.len() as u32,
            proto_ids_off as u32,
            0,
            0,
            method_list.len() as u32,
            method_ids_off as u32,
            self.classes.len() as u32,
            class_defs_off as u32,
            data.bytes.len() as u32,
            data_off as u32,
        ] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        debug_assert_eq!(out.len(), 0x70);

        for offset in &string_offsets {
            out.extend_from_slice(&offset.to_le_bytes());
        }
        for t in &types {
            out.extend_from_slice(&idx.strings[t].to_le_bytes());
        }
        for (key, parameters_off) in proto_list.iter().zip(&parameter_offsets) {
            for word in [idx.strings[&shorty(key)], idx.types[&key.0], *parameters_off] {
                out.extend_from_slice(&word.to_le_bytes());
            }
        }
        for (class, name, proto) in &method_list {
            out.extend_from_slice(&(idx.types[class] as u16).to_le_bytes());
            out.extend_from_slice(&(idx.protos[proto] as u16).to_le_bytes());
            out.extend_from_slice(&idx.strings[name].to_le_bytes());
        }
        for class_def in &class_defs {
            for word in class_def {
                out.extend_from_slice(&word.to_le_bytes());
            }
        }
        debug_assert_eq!(out.len(), data_off);

        out.extend_from_slice(&data.bytes);
        out
    }
}

/// Packs the given entries into an in-memory zip archive.
pub(crate) fn apk_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in entries {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Writes an APK containing a single `classes.dex` and returns its path.
pub(crate) fn write_apk(dir: &Path, file_name: &str, dex: &DexBuilder) -> PathBuf {
    let path = dir.join(file_name);
    std::fs::write(&path, apk_bytes(&[("classes.dex", &dex.build()[..])])).unwrap();
    path
}
