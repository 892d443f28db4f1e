//! Disk tier: preservation records plus the assembly images they reference.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::artifact::AssemblyStore;
use crate::error::CacheError;
use crate::record::{PreservationRecord, RecordStore};
use crate::result::{BuildResult, CompiledAssembly};

/// Records and images under one cache directory.
///
/// Loaded images are shared through weak handles, so results restored for
/// several members of one batch point at the same [`CompiledAssembly`].
pub struct DiskTier {
    records: RecordStore,
    assemblies: AssemblyStore,
    loaded: Mutex<HashMap<String, Weak<CompiledAssembly>>>,
}

impl DiskTier {
    /// Opens the tier under `cache_dir`, creating its directories.
    pub fn open(cache_dir: &Path) -> Result<Self, CacheError> {
        let tier = Self {
            records: RecordStore::new(cache_dir),
            assemblies: AssemblyStore::new(cache_dir),
            loaded: Mutex::new(HashMap::new()),
        };
        std::fs::create_dir_all(tier.records.dir()).map_err(|e| CacheError::Io {
            path: tier.records.dir().to_path_buf(),
            source: e,
        })?;
        tier.assemblies.ensure_dir()?;
        Ok(tier)
    }

    /// The record store.
    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// The assembly image store.
    pub fn assemblies(&self) -> &AssemblyStore {
        &self.assemblies
    }

    /// Reads the record for `key`; see [`RecordStore::read`].
    pub fn read_record(&self, key: &str) -> Result<Option<PreservationRecord>, CacheError> {
        self.records.read(key)
    }

    /// Rebuilds a [`BuildResult`] from a record, loading its image.
    pub fn materialize(&self, record: &PreservationRecord) -> Result<BuildResult, CacheError> {
        let corrupt = |reason: &str| CacheError::Serialization {
            path: self.records.path(&record.virtual_path.cache_key()),
            reason: reason.to_string(),
        };
        let dependencies_hash = record
            .parsed_dependencies_hash()
            .ok_or_else(|| corrupt("malformed dependencies hash"))?;
        let semantic_hash = record
            .parsed_semantic_hash()
            .ok_or_else(|| corrupt("malformed semantic hash"))?;

        let mut result = BuildResult::new(
            record.kind,
            record.virtual_path.clone(),
            record.dependencies.clone(),
            dependencies_hash,
            semantic_hash,
        );
        if let Some(name) = &record.assembly {
            result = result.with_assembly(self.load_assembly(name)?, record.entry.clone());
        }
        if record.top_level {
            result = result.top_level();
        }
        Ok(result)
    }

    fn load_assembly(&self, name: &str) -> Result<Arc<CompiledAssembly>, CacheError> {
        let image = self.assemblies.read(name)?;
        let mut loaded = self.loaded.lock();
        if let Some(existing) = loaded.get(name).and_then(Weak::upgrade) {
            if existing.image() == image.as_slice() {
                return Ok(existing);
            }
        }
        let assembly = Arc::new(CompiledAssembly::new(name, image));
        loaded.insert(name.to_string(), Arc::downgrade(&assembly));
        Ok(assembly)
    }

    /// Persists `result` under `key`: its image first, then its record.
    pub fn store(&self, key: &str, result: &BuildResult) -> Result<(), CacheError> {
        if let Some(assembly) = result.assembly() {
            let mut loaded = self.loaded.lock();
            let already_stored = loaded
                .get(assembly.name())
                .and_then(Weak::upgrade)
                .is_some_and(|a| Arc::ptr_eq(&a, assembly))
                && self.assemblies.contains(assembly.name());
            if !already_stored {
                self.assemblies.write(assembly.name(), assembly.image())?;
                loaded.insert(assembly.name().to_string(), Arc::downgrade(assembly));
            }
        }
        self.records
            .write(key, &PreservationRecord::from_result(result))
    }

    /// Deletes the record for `key` and, if no other record uses it, the
    /// image named by `record`.
    pub fn delete(&self, key: &str, record: Option<&PreservationRecord>) -> Result<(), CacheError> {
        self.records.remove(key)?;
        let Some(name) = record.and_then(|r| r.assembly.as_deref()) else {
            return Ok(());
        };
        if self.assembly_referenced(name) {
            debug!(assembly = name, "assembly still referenced, keeping image");
            return Ok(());
        }
        self.assemblies.remove(name)?;
        self.loaded.lock().remove(name);
        Ok(())
    }

    fn assembly_referenced(&self, name: &str) -> bool {
        self.records.keys().iter().any(|key| {
            matches!(self.records.read(key), Ok(Some(r)) if r.assembly.as_deref() == Some(name))
        })
    }

    /// Removes images no record references. Returns how many.
    pub fn gc(&self) -> Result<usize, CacheError> {
        let live: Vec<String> = self
            .records
            .keys()
            .iter()
            .filter_map(|key| self.records.read(key).ok().flatten())
            .filter_map(|r| r.assembly)
            .collect();
        let live_refs: Vec<&str> = live.iter().map(String::as_str).collect();
        let removed = self.assemblies.gc(&live_refs)?;
        let mut loaded = self.loaded.lock();
        loaded.retain(|name, _| live.contains(name));
        Ok(removed)
    }

    /// Deletes every record and image. Returns how many records were removed.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let removed = self.records.clear()?;
        self.assemblies.clear()?;
        self.loaded.lock().clear();
        Ok(removed)
    }

    /// Deletes leftover temp files from interrupted writes.
    pub fn remove_temp_files(&self) -> usize {
        self.records.remove_temp_files() + crate::artifact::remove_temp_files(self.assemblies.dir())
    }
}
