//! Reading DEX images out of test binaries.

use std::io::{Cursor, Read};
use std::path::Path;

use tracing::debug;

use super::{DexError, DexFile, DexResult};

/// Largest buffer reserved up front from a declared entry size.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Returns the multidex ordinal of a top-level `classes*.dex` entry.
///
/// `classes.dex` is 1, `classes2.dex` is 2, and so on. Anything else,
/// including entries in subdirectories, yields `None`.
fn dex_ordinal(entry_name: &str) -> Option<u32> {
    let middle = entry_name.strip_prefix("classes")?.strip_suffix(".dex")?;
    if middle.is_empty() {
        Some(1)
    } else if middle.bytes().all(|b| b.is_ascii_digit()) && !middle.starts_with('0') {
        middle.parse().ok()
    } else {
        None
    }
}

/// Reads every DEX image from a test binary.
///
/// The binary may be an APK (a zip archive holding `classes.dex`,
/// `classes2.dex`, ...) or a bare DEX file. Images are returned in multidex
/// order.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is neither a zip archive nor a
/// DEX file, contains no DEX entries, or any image is malformed.
pub fn read_dex_files(path: &Path) -> DexResult<Vec<DexFile>> {
    read_dex_files_until(path, || false)
}

/// Like [`read_dex_files`], but checks `cancelled` before each image and
/// stops with [`DexError::Cancelled`] once it returns `true`.
pub fn read_dex_files_until(
    path: &Path,
    cancelled: impl Fn() -> bool,
) -> DexResult<Vec<DexFile>> {
    let bytes = std::fs::read(path)?;

    if bytes.starts_with(b"dex\n") {
        debug!("Reading {} as a bare DEX file", path.display());
        if cancelled() {
            return Err(DexError::Cancelled);
        }
        return Ok(vec![DexFile::parse(&bytes)?]);
    }

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut entries: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| dex_ordinal(name).map(|ordinal| (ordinal, name.to_string())))
        .collect();
    entries.sort();

    if entries.is_empty() {
        return Err(DexError::NoDexEntries(path.to_path_buf()));
    }

    debug!(
        "Reading {} DEX image(s) from {}",
        entries.len(),
        path.display()
    );

    entries
        .iter()
        .map(|(_, name)| {
            if cancelled() {
                return Err(DexError::Cancelled);
            }
            let mut entry = archive.by_name(name)?;
            let mut contents = Vec::with_capacity(entry.size().min(MAX_PREALLOCATION) as usize);
            entry.read_to_end(&mut contents)?;
            DexFile::parse(&contents)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::testing::{ClassSpec, DexBuilder, MethodSpec, apk_bytes};
    use tempfile::TempDir;

    fn single_class_dex(name: &str) -> Vec<u8> {
        DexBuilder::new()
            .class(ClassSpec::new(name).method(MethodSpec::test("t1")))
            .build()
    }

    #[test]
    fn test_dex_ordinal() {
        assert_eq!(dex_ordinal("classes.dex"), Some(1));
        assert_eq!(dex_ordinal("classes2.dex"), Some(2));
        assert_eq!(dex_ordinal("classes12.dex"), Some(12));
        assert_eq!(dex_ordinal("classes02.dex"), None);
        assert_eq!(dex_ordinal("lib/classes.dex"), None);
        assert_eq!(dex_ordinal("classes.jar"), None);
        assert_eq!(dex_ordinal("AndroidManifest.xml"), None);
    }

    #[test]
    fn test_read_multidex_apk_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app-test.apk");
        let first = single_class_dex("com.example.First");
        let second = single_class_dex("com.example.Second");
        let tenth = single_class_dex("com.example.Tenth");
        std::fs::write(
            &path,
            apk_bytes(&[
                ("classes10.dex", &tenth[..]),
                ("AndroidManifest.xml", &b"<manifest/>"[..]),
                ("classes2.dex", &second[..]),
                ("classes.dex", &first[..]),
            ]),
        )
        .unwrap();

        let files = read_dex_files(&path).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.classes[0].name.as_str()).collect();
        assert_eq!(
            names,
            vec!["com.example.First", "com.example.Second", "com.example.Tenth"]
        );
    }

    #[test]
    fn test_read_bare_dex() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("classes.dex");
        std::fs::write(&path, single_class_dex("com.example.Only")).unwrap();

        let files = read_dex_files(&path).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].classes[0].name, "com.example.Only");
    }

    #[test]
    fn test_apk_without_dex_entries() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("resources.apk");
        std::fs::write(&path, apk_bytes(&[("res/values.xml", &b"<resources/>"[..])])).unwrap();

        assert!(matches!(
            read_dex_files(&path),
            Err(DexError::NoDexEntries(_))
        ));
    }

    #[test]
    fn test_garbage_file_is_an_archive_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.apk");
        std::fs::write(&path, b"definitely not a zip archive").unwrap();

        assert!(matches!(read_dex_files(&path), Err(DexError::Archive(_))));
    }

    #[test]
    fn test_forged_entry_size_does_not_abort() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("forged.apk");
        let mut bytes = apk_bytes(&[("classes.dex", &single_class_dex("com.example.A")[..])]);
        let central = bytes
            .windows(4)
            .position(|w| w == b"PK\x01\x02")
            .unwrap();
        // Uncompressed size field of the central directory record.
        bytes[central + 24..central + 28].copy_from_slice(&0xffff_fff0_u32.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        if let Ok(files) = read_dex_files(&path) {
            assert_eq!(files[0].classes[0].name, "com.example.A");
        }
    }

    #[test]
    fn test_cancelled_between_images() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app-test.apk");
        let first = single_class_dex("com.example.First");
        let second = single_class_dex("com.example.Second");
        std::fs::write(
            &path,
            apk_bytes(&[("classes.dex", &first[..]), ("classes2.dex", &second[..])]),
        )
        .unwrap();

        let checks = std::cell::Cell::new(0);
        let result = read_dex_files_until(&path, || {
            checks.set(checks.get() + 1);
            checks.get() > 1
        });
        assert!(matches!(result, Err(DexError::Cancelled)));
        assert_eq!(checks.get(), 2);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            read_dex_files(Path::new("/nonexistent/app-test.apk")),
            Err(DexError::Io(_))
        ));
    }
}
