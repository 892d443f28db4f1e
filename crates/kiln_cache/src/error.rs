//! Error types for cache operations.

use std::path::PathBuf;

use kiln_common::VfsError;
use kiln_lock::LockError;

/// Errors that can occur during cache operations.
///
/// Reads are fail-safe: corruption, version mismatches and I/O problems
/// become cache misses inside [`BuildResultCache`](crate::BuildResultCache).
/// Only file-system security failures escape a lookup.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// An I/O error occurred while reading or writing cache files.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// An assembly image has an invalid or missing header.
    #[error("invalid assembly header in {path}: {reason}")]
    InvalidHeader {
        /// The assembly file path.
        path: PathBuf,
        /// Description of the header problem.
        reason: String,
    },

    /// The stored checksum does not match the payload.
    #[error("checksum mismatch in {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The assembly file path.
        path: PathBuf,
        /// The checksum recorded in the header.
        expected: String,
        /// The checksum of the payload on disk.
        actual: String,
    },

    /// A record or image was written by an incompatible format version.
    #[error("version mismatch in {path}: expected {expected}, got {actual}")]
    VersionMismatch {
        /// The file path.
        path: PathBuf,
        /// The format version this build understands.
        expected: u32,
        /// The format version found in the file.
        actual: u32,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error in {path}: {reason}")]
    Serialization {
        /// The file being read or written.
        path: PathBuf,
        /// Description of the failure.
        reason: String,
    },

    /// A dependency could not be read from the virtual file system.
    #[error(transparent)]
    Vfs(#[from] VfsError),

    /// The compilation lock could not be taken for a cache write.
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl CacheError {
    /// Returns `true` for failures that must reach the caller even from a
    /// fail-safe lookup.
    pub fn is_security_failure(&self) -> bool {
        match self {
            CacheError::Vfs(e) => e.is_security_failure(),
            CacheError::Io { source, .. } => {
                source.kind() == std::io::ErrorKind::PermissionDenied
            }
            _ => false,
        }
    }
}
