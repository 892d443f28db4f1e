//! Error types for the compilation lock.

use std::path::PathBuf;

/// Errors returned when acquiring a [`CompilationLock`](crate::CompilationLock).
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock is draining or closed; the process is shutting down and the
    /// caller must not retry.
    #[error("compilation lock for '{name}' has been drained")]
    Drained {
        /// The application identity the lock belongs to.
        name: String,
    },

    /// The named lock file could not be created or locked.
    #[error("failed to take named lock {path}: {source}")]
    Io {
        /// The lock file path.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}
