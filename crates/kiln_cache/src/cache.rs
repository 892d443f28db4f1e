//! The two-tier build result cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_common::{ContentHash, DependencySet, VfsError, VirtualFileSystem};
use kiln_lock::{CompilationLock, LockError};
use tracing::{debug, info, warn};

use crate::artifact::write_atomic;
use crate::disk::DiskTier;
use crate::error::CacheError;
use crate::hasher::{DependencyHasher, Freshness};
use crate::memory::MemoryTier;
use crate::record::PreservationRecord;
use crate::result::BuildResult;

const TOP_LEVEL_HASH_FILE: &str = "toplevel.hash";

/// Settings for opening a [`BuildResultCache`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Root of the disk tier.
    pub dir: PathBuf,
    /// Hash of every setting that affects generated output.
    pub semantic_hash: ContentHash,
    /// Keep top-level results in the memory tier as well as on disk.
    pub keep_top_level_in_memory: bool,
}

impl CacheOptions {
    /// Options for `dir` with the given semantic hash.
    pub fn new(dir: impl Into<PathBuf>, semantic_hash: ContentHash) -> Self {
        Self {
            dir: dir.into(),
            semantic_hash,
            keep_top_level_in_memory: true,
        }
    }
}

enum Evaluation {
    Fresh(BuildResult),
    Stale(Freshness),
    Corrupt(CacheError),
}

/// Memory tier in front of a disk tier, both keyed by cache key.
///
/// Every hit is validated against the current dependency hash and semantic
/// hash. Disk writes and deletions happen under the compilation lock.
pub struct BuildResultCache {
    options: CacheOptions,
    vfs: Arc<dyn VirtualFileSystem>,
    lock: Arc<CompilationLock>,
    memory: MemoryTier,
    disk: DiskTier,
}

impl BuildResultCache {
    /// Opens the cache, creating the disk tier if needed.
    pub fn open(
        options: CacheOptions,
        vfs: Arc<dyn VirtualFileSystem>,
        lock: Arc<CompilationLock>,
    ) -> Result<Self, CacheError> {
        let disk = DiskTier::open(&options.dir)?;
        debug!(dir = %options.dir.display(), "opened build result cache");
        Ok(Self {
            options,
            vfs,
            lock,
            memory: MemoryTier::new(),
            disk,
        })
    }

    /// Root of the disk tier.
    pub fn dir(&self) -> &Path {
        &self.options.dir
    }

    /// The configuration hash results are validated against.
    pub fn semantic_hash(&self) -> ContentHash {
        self.options.semantic_hash
    }

    /// The virtual file system dependencies are read through.
    pub fn vfs(&self) -> &Arc<dyn VirtualFileSystem> {
        &self.vfs
    }

    /// The compilation lock guarding disk mutations.
    pub fn lock(&self) -> &Arc<CompilationLock> {
        &self.lock
    }

    /// The disk tier.
    pub fn disk(&self) -> &DiskTier {
        &self.disk
    }

    /// Number of results held in memory.
    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    /// Combined hash of `deps` as they are now.
    pub fn dependencies_hash(&self, deps: &DependencySet) -> Result<ContentHash, VfsError> {
        DependencyHasher::new(self.vfs.as_ref()).hash(deps)
    }

    /// Checks `result` against the current sources and configuration.
    pub fn check(&self, result: &BuildResult) -> Result<Freshness, VfsError> {
        DependencyHasher::new(self.vfs.as_ref()).check_result(result, self.options.semantic_hash)
    }

    /// Looks up a valid result for `key`.
    ///
    /// Stale and corrupt entries are removed and reported as a miss. Only
    /// security failures are returned as errors.
    pub fn get(&self, key: &str) -> Result<Option<Arc<BuildResult>>, CacheError> {
        if let Some(result) = self.memory.get(key) {
            let freshness = self.check(&result)?;
            if freshness.is_fresh() {
                debug!(key, "memory hit");
                return Ok(Some(result));
            }
            debug!(key, reason = freshness.reason(), "stale memory entry");
            self.memory.remove_if_same(key, &result);
        }

        match self.disk.read_record(key) {
            Ok(None) => return Ok(None),
            Ok(Some(record)) => match self.evaluate(&record)? {
                Evaluation::Fresh(result) => {
                    debug!(key, "disk hit");
                    return Ok(Some(self.remember(key, result)));
                }
                Evaluation::Stale(freshness) => {
                    debug!(key, reason = freshness.reason(), "stale disk entry");
                }
                Evaluation::Corrupt(e) => {
                    warn!(key, error = %e, "unusable disk entry");
                }
            },
            Err(e) if e.is_security_failure() => return Err(e),
            Err(e) => warn!(key, error = %e, "unreadable preservation record"),
        }
        self.recheck_under_lock(key)
    }

    /// Re-reads the record for `key` under the lock and deletes it if it is
    /// still unusable. Another process may have replaced it meanwhile.
    fn recheck_under_lock(&self, key: &str) -> Result<Option<Arc<BuildResult>>, CacheError> {
        let _guard = match self.lock.acquire() {
            Ok(guard) => guard,
            Err(LockError::Drained { .. }) => {
                debug!(key, "lock drained, leaving stale entry");
                return Ok(None);
            }
            Err(e) => {
                warn!(key, error = %e, "cannot lock to remove stale entry");
                return Ok(None);
            }
        };

        let record = match self.disk.read_record(key) {
            Ok(None) => return Ok(None),
            Ok(Some(record)) => record,
            Err(e) if e.is_security_failure() => return Err(e),
            Err(_) => {
                self.delete_logged(key, None);
                return Ok(None);
            }
        };
        match self.evaluate(&record)? {
            Evaluation::Fresh(result) => {
                debug!(key, "entry refreshed by another writer");
                Ok(Some(self.remember(key, result)))
            }
            Evaluation::Stale(_) | Evaluation::Corrupt(_) => {
                self.delete_logged(key, Some(&record));
                Ok(None)
            }
        }
    }

    fn evaluate(&self, record: &PreservationRecord) -> Result<Evaluation, CacheError> {
        let (Some(dependencies_hash), Some(semantic_hash)) = (
            record.parsed_dependencies_hash(),
            record.parsed_semantic_hash(),
        ) else {
            return Ok(Evaluation::Corrupt(CacheError::Serialization {
                path: self.disk.records().path(&record.virtual_path.cache_key()),
                reason: "malformed hash".to_string(),
            }));
        };
        let freshness = DependencyHasher::new(self.vfs.as_ref()).check(
            &record.dependencies,
            dependencies_hash,
            semantic_hash,
            self.options.semantic_hash,
        )?;
        if !freshness.is_fresh() {
            return Ok(Evaluation::Stale(freshness));
        }
        match self.disk.materialize(record) {
            Ok(result) => Ok(Evaluation::Fresh(result)),
            Err(e) if e.is_security_failure() => Err(e),
            Err(e) => Ok(Evaluation::Corrupt(e)),
        }
    }

    fn remember(&self, key: &str, result: BuildResult) -> Arc<BuildResult> {
        let result = Arc::new(result);
        if self.keeps_in_memory(&result) {
            self.memory.insert(key, Arc::clone(&result));
        }
        result
    }

    fn keeps_in_memory(&self, result: &BuildResult) -> bool {
        !result.is_top_level() || self.options.keep_top_level_in_memory
    }

    fn delete_logged(&self, key: &str, record: Option<&PreservationRecord>) {
        self.memory.remove(key);
        match self.disk.delete(key, record) {
            Ok(()) => info!(key, "removed stale cache entry"),
            Err(e) => warn!(key, error = %e, "failed to remove stale cache entry"),
        }
    }

    /// Stores `result` under `key`.
    ///
    /// The memory tier is always written, except for top-level results when
    /// they are configured to live on disk only. The disk tier is written
    /// unless the result is memory-only.
    pub fn put(&self, key: &str, result: &Arc<BuildResult>) -> Result<(), CacheError> {
        if self.keeps_in_memory(result) {
            self.memory.insert(key, Arc::clone(result));
        }
        self.persist(key, result)
    }

    /// Writes `result` to the disk tier only. Memory-only results are
    /// skipped.
    pub fn persist(&self, key: &str, result: &BuildResult) -> Result<(), CacheError> {
        if result.is_memory_only() {
            debug!(key, "stored in memory only");
            return Ok(());
        }
        let _guard = self.lock.acquire()?;
        self.disk.store(key, result)?;
        debug!(key, "stored");
        Ok(())
    }

    /// Removes `key` from both tiers.
    pub fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.memory.remove(key);
        let _guard = self.lock.acquire()?;
        let record = self.disk.read_record(key).ok().flatten();
        self.disk.delete(key, record.as_ref())
    }

    /// The dependency set and combined hash last recorded for `key`,
    /// without validating them.
    pub fn cached_dependencies(&self, key: &str) -> Option<(ContentHash, DependencySet)> {
        if let Some(result) = self.memory.get(key) {
            return Some((result.dependencies_hash(), result.dependencies().clone()));
        }
        let record = self.disk.read_record(key).ok().flatten()?;
        Some((record.parsed_dependencies_hash()?, record.dependencies))
    }

    /// Deletes assembly images no record references. Returns how many.
    pub fn gc(&self) -> Result<usize, CacheError> {
        let _guard = self.lock.acquire()?;
        let removed = self.disk.gc()? + self.disk.remove_temp_files();
        info!(removed, "cache garbage collected");
        Ok(removed)
    }

    /// The application-wide hash recorded by the last initialization.
    pub fn read_top_level_hash(&self) -> Option<ContentHash> {
        let text = std::fs::read_to_string(self.top_level_hash_path()).ok()?;
        ContentHash::from_hex(text.trim())
    }

    /// Records the application-wide hash.
    pub fn write_top_level_hash(&self, hash: ContentHash) -> Result<(), CacheError> {
        let _guard = self.lock.acquire()?;
        write_atomic(&self.top_level_hash_path(), hash.to_string().as_bytes())
    }

    fn top_level_hash_path(&self) -> PathBuf {
        self.options.dir.join(TOP_LEVEL_HASH_FILE)
    }

    /// Empties both tiers. Returns how many records were deleted.
    pub fn remove_all(&self) -> Result<usize, CacheError> {
        let _guard = self.lock.acquire()?;
        self.memory.clear();
        let removed = self.disk.clear()?;
        info!(removed, "cache cleared");
        Ok(removed)
    }

    /// Deletes leftover temp files from interrupted writes.
    pub fn remove_temp_files(&self) -> usize {
        self.disk.remove_temp_files()
    }
}
