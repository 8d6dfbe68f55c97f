//! Dalvik executable decoding.
//!
//! This module reads compiled Android test binaries and decodes the parts
//! needed for test discovery: class definitions, their methods and the
//! annotations attached to both. Everything is decoded eagerly into owned
//! values so later stages never touch raw bytes again.
//!
//! # Layout
//!
//! ```text
//!   APK (zip) ──► classes.dex, classes2.dex, ...   (apk)
//!                        │
//!                        ▼
//!                  DexFile::parse                  (parser)
//!                        │
//!                        ▼
//!     Vec<ClassDef> ─► MethodDef ─► Annotation ─► DecodedValue   (value)
//! ```
//!
//! A raw `.dex` file is accepted in place of an APK.

pub mod apk;
pub mod parser;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;

pub use apk::{read_dex_files, read_dex_files_until};
pub use parser::DexFile;
pub use value::{Annotation, DecodedValue};

/// Class or member is `public`.
pub const ACC_PUBLIC: u32 = 0x1;
/// Member is `static`.
pub const ACC_STATIC: u32 = 0x8;
/// Class is an interface.
pub const ACC_INTERFACE: u32 = 0x200;
/// Class or method is `abstract`.
pub const ACC_ABSTRACT: u32 = 0x400;
/// Class is an annotation type.
pub const ACC_ANNOTATION: u32 = 0x2000;
/// Method is a constructor.
pub const ACC_CONSTRUCTOR: u32 = 0x10000;

/// Result type for DEX decoding.
pub type DexResult<T> = Result<T, DexError>;

/// Errors produced while reading a test binary.
///
/// Every variant is fatal for the binary being read: a corrupt or unreadable
/// file never yields a partial class list.
#[derive(Debug, thiserror::Error)]
pub enum DexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid APK archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("No classes*.dex entries found in {}", .0.display())]
    NoDexEntries(PathBuf),

    #[error("Not a DEX file (magic {0:02x?})")]
    BadMagic(Vec<u8>),

    #[error("Unexpected end of data: need {needed} bytes at offset {offset:#x}")]
    Truncated { offset: usize, needed: usize },

    #[error("Invalid {kind} index {index}")]
    InvalidIndex { kind: &'static str, index: u32 },

    #[error("Malformed DEX: {0}")]
    Malformed(String),

    #[error("Reading was cancelled")]
    Cancelled,
}

/// A decoded class definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDef {
    /// Dotted class name, e.g. `com.example.LoginTest`.
    pub name: String,

    /// Dotted superclass name; `None` only for `java.lang.Object`.
    pub superclass: Option<String>,

    /// Raw `access_flags` of the class definition.
    pub access_flags: u32,

    /// Class-level annotations (runtime and build visibility).
    pub annotations: Vec<Annotation>,

    /// Direct methods followed by virtual methods, each in method-id order.
    pub methods: Vec<MethodDef>,
}

impl ClassDef {
    /// Returns `true` if this class can be instantiated by a test runner.
    pub fn is_concrete(&self) -> bool {
        self.access_flags & (ACC_ABSTRACT | ACC_INTERFACE | ACC_ANNOTATION) == 0
    }
}

/// A decoded method declared on a class.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    pub name: String,
    pub access_flags: u32,
    /// Return type as a dotted name or primitive descriptor (`V`, `I`, ...).
    pub return_type: String,
    pub parameters: Vec<String>,
    pub annotations: Vec<Annotation>,
}

impl MethodDef {
    pub fn has_annotation(&self, name: &str) -> bool {
        self.annotations.iter().any(|a| a.name == name)
    }

    pub fn is_public(&self) -> bool {
        self.access_flags & ACC_PUBLIC != 0
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub fn is_constructor(&self) -> bool {
        self.access_flags & ACC_CONSTRUCTOR != 0
    }
}

/// Converts a type descriptor into the dotted form used everywhere else.
///
/// `Lcom/example/Foo$Bar;` becomes `com.example.Foo$Bar`. Primitive and array
/// descriptors are returned unchanged.
pub fn descriptor_to_class_name(descriptor: &str) -> String {
    match descriptor
        .strip_prefix('L')
        .and_then(|rest| rest.strip_suffix(';'))
    {
        Some(inner) => inner.replace('/', "."),
        None => descriptor.to_string(),
    }
}
