//! Preservation records: the on-disk descriptor of a build result.
//!
//! One JSON file per cache key at `<cache_dir>/records/<key>.json`, written
//! atomically and carrying an explicit format version.

use std::path::{Path, PathBuf};

use kiln_common::{ContentHash, DependencySet, VirtualPath};
use serde::{Deserialize, Serialize};

use crate::artifact::{remove_temp_files, write_atomic};
use crate::error::CacheError;
use crate::result::{BuildResult, ResultKind};

/// Current record format version.
pub const RECORD_FORMAT_VERSION: u32 = 1;

const RECORD_SUBDIR: &str = "records";
const RECORD_EXT: &str = "json";

/// The persisted descriptor of one build result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreservationRecord {
    /// Record format version.
    pub format_version: u32,
    /// Result-type tag.
    pub kind: ResultKind,
    /// The originating virtual path.
    pub virtual_path: VirtualPath,
    /// Dependency paths, the unit's own path first.
    pub dependencies: DependencySet,
    /// Combined hash of the dependencies at build time.
    pub dependencies_hash: String,
    /// Configuration hash at build time.
    pub semantic_hash: String,
    /// Name of the assembly image backing the result, if any.
    #[serde(default)]
    pub assembly: Option<String>,
    /// Entry type inside the assembly.
    #[serde(default)]
    pub entry: Option<String>,
    /// Whether the result is top-level.
    #[serde(default)]
    pub top_level: bool,
}

impl PreservationRecord {
    /// Describes `result` for persistence.
    pub fn from_result(result: &BuildResult) -> Self {
        Self {
            format_version: RECORD_FORMAT_VERSION,
            kind: result.kind(),
            virtual_path: result.virtual_path().clone(),
            dependencies: result.dependencies().clone(),
            dependencies_hash: result.dependencies_hash().to_string(),
            semantic_hash: result.semantic_hash().to_string(),
            assembly: result.assembly().map(|a| a.name().to_string()),
            entry: result.entry().map(str::to_string),
            top_level: result.is_top_level(),
        }
    }

    /// Parses the stored dependency hash. `None` if it is not well-formed.
    pub fn parsed_dependencies_hash(&self) -> Option<ContentHash> {
        ContentHash::from_hex(&self.dependencies_hash)
    }

    /// Parses the stored semantic hash. `None` if it is not well-formed.
    pub fn parsed_semantic_hash(&self) -> Option<ContentHash> {
        ContentHash::from_hex(&self.semantic_hash)
    }
}

/// Directory of preservation records keyed by cache key.
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    /// Creates a store under `cache_dir`.
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            dir: cache_dir.join(RECORD_SUBDIR),
        }
    }

    /// The directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the file path for `key`.
    pub fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{RECORD_EXT}"))
    }

    /// Reads the record for `key`.
    ///
    /// `Ok(None)` means no record exists. Any `Err` means the record exists
    /// but cannot be trusted (unreadable, unparseable, wrong version).
    pub fn read(&self, key: &str) -> Result<Option<PreservationRecord>, CacheError> {
        let path = self.path(key);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        let record: PreservationRecord =
            serde_json::from_str(&content).map_err(|e| CacheError::Serialization {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if record.format_version != RECORD_FORMAT_VERSION {
            return Err(CacheError::VersionMismatch {
                path,
                expected: RECORD_FORMAT_VERSION,
                actual: record.format_version,
            });
        }
        Ok(Some(record))
    }

    /// Writes the record for `key`, all-or-nothing.
    pub fn write(&self, key: &str, record: &PreservationRecord) -> Result<(), CacheError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| CacheError::Io {
            path: self.dir.clone(),
            source: e,
        })?;
        let path = self.path(key);
        let json = serde_json::to_vec_pretty(record).map_err(|e| CacheError::Serialization {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&path, &json)
    }

    /// Deletes the record for `key`. Missing records are not an error.
    pub fn remove(&self, key: &str) -> Result<(), CacheError> {
        let path = self.path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }

    /// Lists every stored key.
    pub fn keys(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut keys: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        keys.sort();
        keys
    }

    /// Deletes every record and leftover temp file. Returns how many
    /// records were removed.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let keys = self.keys();
        for key in &keys {
            self.remove(key)?;
        }
        remove_temp_files(&self.dir);
        Ok(keys.len())
    }

    /// Deletes leftover temp files from interrupted writes.
    pub fn remove_temp_files(&self) -> usize {
        remove_temp_files(&self.dir)
    }
}
