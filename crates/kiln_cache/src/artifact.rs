//! Integrity-checked storage of compiled assembly images.
//!
//! Images live at `<cache_dir>/assemblies/<name>.asm`, each prefixed with a
//! length-delimited bincode header carrying magic bytes, the format version,
//! and a checksum of the payload.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use kiln_common::ContentHash;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Magic bytes identifying a Kiln assembly image.
const ASSEMBLY_MAGIC: [u8; 4] = *b"KILN";

/// Current image format version. Increment on breaking changes to the
/// header or payload format.
const ASSEMBLY_FORMAT_VERSION: u32 = 1;

const ASSEMBLY_SUBDIR: &str = "assemblies";
const ASSEMBLY_EXT: &str = "asm";

/// Suffix of in-progress writes; anything carrying it is garbage once no
/// writer holds the compilation lock.
pub(crate) const TEMP_EXT: &str = "tmp";

/// Header prepended to every stored image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyHeader {
    /// Magic bytes: must be `b"KILN"`.
    pub magic: [u8; 4],
    /// Image format version.
    pub format_version: u32,
    /// Kiln version that wrote the image.
    pub kiln_version: String,
    /// Content hash of the payload.
    pub checksum: ContentHash,
}

/// Writes `bytes` to `path` through a uniquely named temp file and a rename.
///
/// A failure at any point removes the temp file, so `path` is either the
/// previous content or the complete new content, never a truncated mix.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let file_name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(
        "{file_name}.{}.{n}.{TEMP_EXT}",
        std::process::id()
    ));

    let result = std::fs::write(&tmp, bytes).and_then(|()| std::fs::rename(&tmp, path));
    if let Err(source) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(CacheError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

/// Removes every `*.tmp` file directly inside `dir`. Returns how many.
pub(crate) fn remove_temp_files(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(TEMP_EXT))
        .filter(|p| std::fs::remove_file(p).is_ok())
        .count()
}

/// Store of compiled assembly images keyed by assembly name.
pub struct AssemblyStore {
    dir: PathBuf,
}

impl AssemblyStore {
    /// Creates a store under `cache_dir`.
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            dir: cache_dir.join(ASSEMBLY_SUBDIR),
        }
    }

    /// The directory holding the images.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ensures the image directory exists.
    pub fn ensure_dir(&self) -> Result<(), CacheError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| CacheError::Io {
            path: self.dir.clone(),
            source: e,
        })
    }

    /// Returns the file path for the image named `name`.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{ASSEMBLY_EXT}"))
    }

    /// Returns `true` if an image named `name` is stored.
    pub fn contains(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    /// Writes an image, replacing any previous image of the same name.
    pub fn write(&self, name: &str, image: &[u8]) -> Result<(), CacheError> {
        self.ensure_dir()?;
        let path = self.path(name);

        let header = AssemblyHeader {
            magic: ASSEMBLY_MAGIC,
            format_version: ASSEMBLY_FORMAT_VERSION,
            kiln_version: env!("CARGO_PKG_VERSION").to_string(),
            checksum: ContentHash::from_bytes(image),
        };
        let header_bytes = bincode::serde::encode_to_vec(&header, bincode::config::standard())
            .map_err(|e| CacheError::Serialization {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        // 4-byte header length (little-endian) + header + payload
        let header_len = header_bytes.len() as u32;
        let mut output = Vec::with_capacity(4 + header_bytes.len() + image.len());
        output.extend_from_slice(&header_len.to_le_bytes());
        output.extend_from_slice(&header_bytes);
        output.extend_from_slice(image);

        write_atomic(&path, &output)
    }

    /// Reads and validates an image.
    pub fn read(&self, name: &str) -> Result<Vec<u8>, CacheError> {
        let path = self.path(name);
        let raw = std::fs::read(&path).map_err(|e| CacheError::Io {
            path: path.clone(),
            source: e,
        })?;
        let invalid = |reason: &str| CacheError::InvalidHeader {
            path: path.clone(),
            reason: reason.to_string(),
        };

        let len_bytes: [u8; 4] = raw
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| invalid("file shorter than the header length prefix"))?;
        let header_len = u32::from_le_bytes(len_bytes) as usize;
        let header_bytes = raw
            .get(4..4 + header_len)
            .ok_or_else(|| invalid("truncated header"))?;

        let (header, _): (AssemblyHeader, usize) =
            bincode::serde::decode_from_slice(header_bytes, bincode::config::standard())
                .map_err(|e| invalid(&e.to_string()))?;

        if header.magic != ASSEMBLY_MAGIC {
            return Err(invalid("bad magic bytes"));
        }
        if header.format_version != ASSEMBLY_FORMAT_VERSION {
            return Err(CacheError::VersionMismatch {
                path,
                expected: ASSEMBLY_FORMAT_VERSION,
                actual: header.format_version,
            });
        }

        let payload = &raw[4 + header_len..];
        let actual = ContentHash::from_bytes(payload);
        if actual != header.checksum {
            return Err(CacheError::ChecksumMismatch {
                path,
                expected: header.checksum.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(payload.to_vec())
    }

    /// Deletes an image. Missing images are not an error.
    pub fn remove(&self, name: &str) -> Result<(), CacheError> {
        let path = self.path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    /// Lists the names of every stored image.
    pub fn names(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(ASSEMBLY_EXT))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        names.sort();
        names
    }

    /// Removes images whose name is not in `live`. Returns how many.
    pub fn gc(&self, live: &[&str]) -> Result<usize, CacheError> {
        let mut removed = 0;
        for name in self.names() {
            if !live.contains(&name.as_str()) {
                self.remove(&name)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Deletes every image and leftover temp file.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let names = self.names();
        for name in &names {
            self.remove(name)?;
        }
        remove_temp_files(&self.dir);
        Ok(names.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, AssemblyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = AssemblyStore::new(dir.path());
        (dir, store)
    }

    fn write_raw(store: &AssemblyStore, name: &str, header: &AssemblyHeader, payload: &[u8]) {
        store.ensure_dir().unwrap();
        let header_bytes =
            bincode::serde::encode_to_vec(header, bincode::config::standard()).unwrap();
        let mut output = Vec::new();
        output.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        output.extend_from_slice(&header_bytes);
        output.extend_from_slice(payload);
        std::fs::write(store.path(name), output).unwrap();
    }

    #[test]
    fn write_and_read_roundtrip() {
        let (_dir, store) = make_store();
        store.write("App_Web_abc", b"image bytes").unwrap();
        assert!(store.contains("App_Web_abc"));
        assert_eq!(store.read("App_Web_abc").unwrap(), b"image bytes");
    }

    #[test]
    fn overwrite_replaces_image() {
        let (_dir, store) = make_store();
        store.write("App_Code", b"v1").unwrap();
        store.write("App_Code", b"v2").unwrap();
        assert_eq!(store.read("App_Code").unwrap(), b"v2");
        assert_eq!(store.names(), vec!["App_Code"]);
    }

    #[test]
    fn read_missing_is_io_error() {
        let (_dir, store) = make_store();
        assert!(matches!(store.read("nope"), Err(CacheError::Io { .. })));
    }

    #[test]
    fn read_garbage_is_invalid_header() {
        let (_dir, store) = make_store();
        store.ensure_dir().unwrap();
        std::fs::write(store.path("junk"), b"AB").unwrap();
        assert!(matches!(
            store.read("junk"),
            Err(CacheError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn read_wrong_magic() {
        let (_dir, store) = make_store();
        let header = AssemblyHeader {
            magic: *b"BAAD",
            format_version: ASSEMBLY_FORMAT_VERSION,
            kiln_version: "0.1.0".to_string(),
            checksum: ContentHash::from_bytes(b"data"),
        };
        write_raw(&store, "bad", &header, b"data");
        assert!(matches!(
            store.read("bad"),
            Err(CacheError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn read_wrong_version() {
        let (_dir, store) = make_store();
        let header = AssemblyHeader {
            magic: ASSEMBLY_MAGIC,
            format_version: 999,
            kiln_version: "0.1.0".to_string(),
            checksum: ContentHash::from_bytes(b"data"),
        };
        write_raw(&store, "old", &header, b"data");
        assert!(matches!(
            store.read("old"),
            Err(CacheError::VersionMismatch { actual: 999, .. })
        ));
    }

    #[test]
    fn read_checksum_mismatch() {
        let (_dir, store) = make_store();
        let header = AssemblyHeader {
            magic: ASSEMBLY_MAGIC,
            format_version: ASSEMBLY_FORMAT_VERSION,
            kiln_version: "0.1.0".to_string(),
            checksum: ContentHash::from_bytes(b"data"),
        };
        write_raw(&store, "tampered", &header, b"tampered");
        assert!(matches!(
            store.read("tampered"),
            Err(CacheError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn gc_keeps_live_images() {
        let (_dir, store) = make_store();
        store.write("a", b"A").unwrap();
        store.write("b", b"B").unwrap();
        assert_eq!(store.gc(&["a"]).unwrap(), 1);
        assert_eq!(store.names(), vec!["a"]);
        assert_eq!(store.gc(&["a"]).unwrap(), 0);
    }

    #[test]
    fn clear_removes_images_and_temp_files() {
        let (_dir, store) = make_store();
        store.write("a", b"A").unwrap();
        std::fs::write(store.dir().join("a.asm.1.0.tmp"), b"partial").unwrap();
        assert_eq!(store.clear().unwrap(), 1);
        assert!(std::fs::read_dir(store.dir()).unwrap().next().is_none());
    }

    #[test]
    fn failed_atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // Renaming a file onto an existing directory fails.
        let target = dir.path().join("target");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("inside"), b"x").unwrap();
        assert!(write_atomic(&target, b"data").is_err());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some(TEMP_EXT))
            .collect();
        assert!(leftovers.is_empty());
    }
}
