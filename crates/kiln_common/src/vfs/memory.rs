//! In-memory file system, used by tests and by hosts that virtualize sources.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use super::{VfsError, VirtualFileSystem};
use crate::virtual_path::{PathError, VirtualPath};

#[derive(Debug, Clone)]
struct MemoryFile {
    path: VirtualPath,
    content: Vec<u8>,
    modified: SystemTime,
    denied: bool,
}

/// An in-memory file system keyed by virtual path.
///
/// Directories are implied by the files beneath them. Clones share the same
/// storage, so a test can keep a handle and mutate files the engine reads.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileSystem {
    files: Arc<RwLock<BTreeMap<String, MemoryFile>>>,
}

impl MemoryFileSystem {
    /// Creates an empty file system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a file system pre-populated with `(path, content)` pairs.
    pub fn with_files<I, S, C>(files: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = (S, C)>,
        S: AsRef<str>,
        C: AsRef<[u8]>,
    {
        let fs = Self::new();
        for (path, content) in files {
            let path = VirtualPath::file(path.as_ref())?;
            fs.write(&path, content.as_ref());
        }
        Ok(fs)
    }

    /// Creates or replaces a file.
    pub fn write(&self, path: &VirtualPath, content: &[u8]) {
        let mut files = self.files.write();
        files.insert(
            path.key().to_string(),
            MemoryFile {
                path: path.clone(),
                content: content.to_vec(),
                modified: SystemTime::now(),
                denied: false,
            },
        );
    }

    /// Removes a file. Returns `true` if it existed.
    pub fn remove(&self, path: &VirtualPath) -> bool {
        self.files.write().remove(path.key()).is_some()
    }

    /// Makes a file unreadable, simulating an access-control failure.
    pub fn deny(&self, path: &VirtualPath) {
        if let Some(file) = self.files.write().get_mut(path.key()) {
            file.denied = true;
        }
    }

    fn with_file<T>(
        &self,
        path: &VirtualPath,
        f: impl FnOnce(&MemoryFile) -> T,
    ) -> Result<T, VfsError> {
        let files = self.files.read();
        let file = files
            .get(path.key())
            .ok_or_else(|| VfsError::NotFound(path.clone()))?;
        if file.denied {
            return Err(VfsError::PermissionDenied(path.clone()));
        }
        Ok(f(file))
    }
}

impl VirtualFileSystem for MemoryFileSystem {
    fn exists(&self, path: &VirtualPath) -> bool {
        let files = self.files.read();
        if !path.is_directory() {
            return files.contains_key(path.key());
        }
        files
            .range(path.key().to_string()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(path.key()))
    }

    fn read(&self, path: &VirtualPath) -> Result<Vec<u8>, VfsError> {
        self.with_file(path, |f| f.content.clone())
    }

    fn last_modified(&self, path: &VirtualPath) -> Result<SystemTime, VfsError> {
        self.with_file(path, |f| f.modified)
    }

    fn file_size(&self, path: &VirtualPath) -> Result<u64, VfsError> {
        self.with_file(path, |f| f.content.len() as u64)
    }

    fn list(&self, dir: &VirtualPath) -> Result<Vec<VirtualPath>, VfsError> {
        if !self.exists(dir) {
            return Err(VfsError::NotFound(dir.clone()));
        }
        let files = self.files.read();
        let mut children = BTreeSet::new();
        for (key, file) in files.range(dir.key().to_string()..) {
            if !key.starts_with(dir.key()) {
                break;
            }
            let Some(rest) = file.path.as_str().get(dir.as_str().len()..) else {
                continue;
            };
            let child = match rest.find('/') {
                Some(slash) => VirtualPath::directory(&format!("{}{}", dir, &rest[..slash])),
                None => Ok(file.path.clone()),
            };
            if let Ok(child) = child {
                children.insert(child);
            }
        }
        Ok(children.into_iter().collect())
    }
}
