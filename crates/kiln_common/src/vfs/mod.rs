//! Virtual file system abstraction over application sources.
//!
//! The build engine never touches the disk directly for sources; it goes
//! through [`VirtualFileSystem`] so that the same pipeline runs against a
//! physical application directory or an in-memory tree in tests.

mod memory;
mod physical;

pub use memory::MemoryFileSystem;
pub use physical::PhysicalFileSystem;

use std::time::SystemTime;

use crate::hash::{ContentHash, HashCombiner};
use crate::virtual_path::VirtualPath;

/// Errors surfaced by a [`VirtualFileSystem`].
#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    /// The path does not exist.
    #[error("virtual path not found: {0}")]
    NotFound(VirtualPath),

    /// The caller is not allowed to read the path.
    #[error("access denied to {0}")]
    PermissionDenied(VirtualPath),

    /// Any other I/O failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The path being accessed.
        path: VirtualPath,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

impl VfsError {
    /// Classifies a `std::io::Error` for `path`.
    pub fn from_io(path: &VirtualPath, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => VfsError::NotFound(path.clone()),
            std::io::ErrorKind::PermissionDenied => VfsError::PermissionDenied(path.clone()),
            _ => VfsError::Io {
                path: path.clone(),
                source,
            },
        }
    }

    /// Returns `true` for access-control failures, which callers must not
    /// swallow.
    pub fn is_security_failure(&self) -> bool {
        matches!(self, VfsError::PermissionDenied(_))
    }
}

/// Read access to the application's source tree.
pub trait VirtualFileSystem: Send + Sync {
    /// Returns `true` if a file or directory exists at `path`.
    fn exists(&self, path: &VirtualPath) -> bool;

    /// Reads a file's content.
    fn read(&self, path: &VirtualPath) -> Result<Vec<u8>, VfsError>;

    /// Returns the last modification time of a file.
    fn last_modified(&self, path: &VirtualPath) -> Result<SystemTime, VfsError>;

    /// Lists the immediate children of a directory, sorted by key.
    ///
    /// Child directories are returned slash-terminated.
    fn list(&self, dir: &VirtualPath) -> Result<Vec<VirtualPath>, VfsError>;

    /// Returns the size of a file in bytes.
    fn file_size(&self, path: &VirtualPath) -> Result<u64, VfsError> {
        Ok(self.read(path)?.len() as u64)
    }

    /// Hashes a file's content.
    fn file_hash(&self, path: &VirtualPath) -> Result<ContentHash, VfsError> {
        Ok(ContentHash::from_bytes(&self.read(path)?))
    }

    /// Hashes a directory tree: names and contents of every file beneath it.
    ///
    /// A missing directory hashes to a fixed "absent" value rather than
    /// failing, so that optional special directories can be fingerprinted.
    fn directory_hash(&self, dir: &VirtualPath) -> Result<ContentHash, VfsError> {
        let mut combiner = HashCombiner::new();
        if !self.exists(dir) {
            combiner.add_str("<absent>");
            return Ok(combiner.finish());
        }
        for child in self.list(dir)? {
            combiner.add_str(child.key());
            if child.is_directory() {
                combiner.add_hash(&self.directory_hash(&child)?);
            } else {
                combiner.add_hash(&self.file_hash(&child)?);
            }
        }
        Ok(combiner.finish())
    }

    /// Hashes a file or directory depending on the path's form.
    fn hash(&self, path: &VirtualPath) -> Result<ContentHash, VfsError> {
        if path.is_directory() {
            self.directory_hash(path)
        } else {
            self.file_hash(path)
        }
    }

    /// Lists every file beneath `dir`, recursively, sorted by key.
    fn list_files_recursive(&self, dir: &VirtualPath) -> Result<Vec<VirtualPath>, VfsError> {
        let mut out = Vec::new();
        if !self.exists(dir) {
            return Ok(out);
        }
        for child in self.list(dir)? {
            if child.is_directory() {
                out.extend(self.list_files_recursive(&child)?);
            } else {
                out.push(child);
            }
        }
        out.sort();
        Ok(out)
    }
}
