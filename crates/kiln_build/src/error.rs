//! Build errors and their taxonomy.

use std::time::Duration;

use kiln_cache::CacheError;
use kiln_common::{VfsError, VirtualPath};
use kiln_config::ConfigError;
use kiln_diagnostics::{Category, Diagnostic, DiagnosticCode, Location};
use kiln_lock::LockError;

/// Whose problem a [`BuildError`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Something in the application's sources; the user can fix it.
    User,
    /// Lock, cache, file-system or timeout failures.
    Infrastructure,
    /// The process is going away or must be recycled.
    Lifecycle,
}

/// Diagnostic codes attached to build errors.
pub mod codes {
    use super::*;

    /// A source unit could not be parsed.
    pub const PARSE_FAILED: DiagnosticCode = DiagnosticCode::new(Category::Parse, 1);
    /// A referenced file does not exist.
    pub const MISSING_DEPENDENCY: DiagnosticCode = DiagnosticCode::new(Category::Parse, 2);
    /// The requested path does not exist.
    pub const NOT_FOUND: DiagnosticCode = DiagnosticCode::new(Category::Parse, 10);
    /// The requested path lies in a protected directory.
    pub const FORBIDDEN_PATH: DiagnosticCode = DiagnosticCode::new(Category::Parse, 11);
    /// A unit depends on itself.
    pub const CIRCULAR_REFERENCE: DiagnosticCode = DiagnosticCode::new(Category::Parse, 12);
    /// No source kind is registered for the path.
    pub const NO_BUILD_PROVIDER: DiagnosticCode = DiagnosticCode::new(Category::Parse, 13);
    /// The compiler rejected generated code.
    pub const COMPILE_FAILED: DiagnosticCode = DiagnosticCode::new(Category::Compile, 1);
    /// A previously loaded module did not unload in time.
    pub const UNLOAD_TIMEOUT: DiagnosticCode = DiagnosticCode::new(Category::Infrastructure, 1);
    /// The cache could not be read or written.
    pub const CACHE_FAILURE: DiagnosticCode = DiagnosticCode::new(Category::Infrastructure, 2);
    /// The virtual file system refused an operation.
    pub const FILE_SYSTEM: DiagnosticCode = DiagnosticCode::new(Category::Infrastructure, 3);
    /// The compilation lock failed.
    pub const LOCK_FAILURE: DiagnosticCode = DiagnosticCode::new(Category::Infrastructure, 4);
    /// The configuration is invalid.
    pub const CONFIG_INVALID: DiagnosticCode = DiagnosticCode::new(Category::Infrastructure, 5);
    /// The compilation lock is drained.
    pub const LOCK_DRAINED: DiagnosticCode = DiagnosticCode::new(Category::Lifecycle, 1);
    /// The recompilation ceiling was crossed.
    pub const RESTART_REQUIRED: DiagnosticCode = DiagnosticCode::new(Category::Lifecycle, 2);
}

/// Errors returned by [`BuildOrchestrator`](crate::BuildOrchestrator).
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// A unit could not be turned into a syntax tree.
    #[error("failed to parse {path}")]
    Parse {
        /// The unit that failed.
        path: VirtualPath,
        /// Parser diagnostics.
        diagnostics: Vec<Diagnostic>,
    },

    /// The compiler rejected the generated code.
    #[error("failed to compile {path}")]
    Compile {
        /// The requested unit.
        path: VirtualPath,
        /// Compiler diagnostics.
        diagnostics: Vec<Diagnostic>,
    },

    /// A unit references a file that does not exist.
    #[error("{path} references missing file {missing}")]
    MissingDependency {
        /// The unit being resolved.
        path: VirtualPath,
        /// The dangling reference.
        missing: VirtualPath,
    },

    /// The requested path does not exist.
    #[error("{0} does not exist")]
    NotFound(VirtualPath),

    /// The requested path lies in a directory that is never served.
    #[error("{0} lies in a protected application directory")]
    ForbiddenPath(VirtualPath),

    /// A unit is already being built further up this thread's stack.
    #[error("circular reference to {0}")]
    CircularReference(VirtualPath),

    /// No source kind is registered for the path.
    #[error("no build provider for {0}")]
    NoBuildProvider(VirtualPath),

    /// The compilation lock is drained; the process is shutting down.
    #[error("compilation lock {name} is drained")]
    LockDrained {
        /// The lock's name.
        name: String,
    },

    /// A previously loaded module kept its output name past the timeout.
    #[error("timed out after {waited:?} waiting for {assembly} to unload")]
    ConcurrencyTimeout {
        /// The output name being reused.
        assembly: String,
        /// How long the build waited.
        waited: Duration,
    },

    /// The unit crossed the recompilation ceiling; the process must restart.
    #[error("{path} was recompiled {count} times; the process must restart")]
    RestartRequired {
        /// The rebuilt unit.
        path: VirtualPath,
        /// Rebuilds of the unit in this process.
        count: u32,
    },

    /// The cache failed in a way it could not recover from.
    #[error(transparent)]
    Cache(CacheError),

    /// The virtual file system refused an operation.
    #[error(transparent)]
    Vfs(#[from] VfsError),

    /// The compilation lock failed.
    #[error(transparent)]
    Lock(LockError),

    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<LockError> for BuildError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Drained { name } => BuildError::LockDrained { name },
            other => BuildError::Lock(other),
        }
    }
}

impl From<CacheError> for BuildError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Lock(lock) => lock.into(),
            CacheError::Vfs(vfs) => BuildError::Vfs(vfs),
            other => BuildError::Cache(other),
        }
    }
}

impl BuildError {
    /// Classifies the error for tooling.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::Parse { .. }
            | BuildError::Compile { .. }
            | BuildError::MissingDependency { .. }
            | BuildError::NotFound(_)
            | BuildError::ForbiddenPath(_)
            | BuildError::CircularReference(_)
            | BuildError::NoBuildProvider(_) => ErrorKind::User,
            BuildError::LockDrained { .. } | BuildError::RestartRequired { .. } => {
                ErrorKind::Lifecycle
            }
            BuildError::ConcurrencyTimeout { .. }
            | BuildError::Cache(_)
            | BuildError::Vfs(_)
            | BuildError::Lock(_)
            | BuildError::Config(_) => ErrorKind::Infrastructure,
        }
    }

    /// The diagnostic code for this error.
    pub fn code(&self) -> DiagnosticCode {
        match self {
            BuildError::Parse { .. } => codes::PARSE_FAILED,
            BuildError::Compile { .. } => codes::COMPILE_FAILED,
            BuildError::MissingDependency { .. } => codes::MISSING_DEPENDENCY,
            BuildError::NotFound(_) => codes::NOT_FOUND,
            BuildError::ForbiddenPath(_) => codes::FORBIDDEN_PATH,
            BuildError::CircularReference(_) => codes::CIRCULAR_REFERENCE,
            BuildError::NoBuildProvider(_) => codes::NO_BUILD_PROVIDER,
            BuildError::LockDrained { .. } => codes::LOCK_DRAINED,
            BuildError::ConcurrencyTimeout { .. } => codes::UNLOAD_TIMEOUT,
            BuildError::RestartRequired { .. } => codes::RESTART_REQUIRED,
            BuildError::Cache(_) => codes::CACHE_FAILURE,
            BuildError::Vfs(_) => codes::FILE_SYSTEM,
            BuildError::Lock(_) => codes::LOCK_FAILURE,
            BuildError::Config(_) => codes::CONFIG_INVALID,
        }
    }

    /// The diagnostics describing this error.
    ///
    /// Parse and compile errors return their collected diagnostics; every
    /// other error is summarized as one diagnostic carrying [`Self::code`].
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        match self {
            BuildError::Parse { diagnostics, .. } | BuildError::Compile { diagnostics, .. }
                if !diagnostics.is_empty() =>
            {
                diagnostics.clone()
            }
            _ => {
                let diag = Diagnostic::error(self.code(), self.to_string());
                match self.path() {
                    Some(path) => vec![diag.at(Location::file(path.clone()))],
                    None => vec![diag],
                }
            }
        }
    }

    fn path(&self) -> Option<&VirtualPath> {
        match self {
            BuildError::Parse { path, .. }
            | BuildError::Compile { path, .. }
            | BuildError::MissingDependency { path, .. }
            | BuildError::RestartRequired { path, .. }
            | BuildError::NotFound(path)
            | BuildError::ForbiddenPath(path)
            | BuildError::CircularReference(path)
            | BuildError::NoBuildProvider(path) => Some(path),
            _ => None,
        }
    }
}
