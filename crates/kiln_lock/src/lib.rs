//! Cross-process compilation lock with an explicit drain protocol.
//!
//! [`CompilationLock`] serializes compilations and cache writes for one
//! application. It pairs an in-process ordering lock with a named file lock
//! shared by every process building the same application, always taken in
//! that order. Once [`CompilationLock::begin_drain`] is called no new session
//! may start, while sessions already waiting or running finish normally.

#![warn(missing_docs)]

pub mod error;
pub mod lock;

pub use error::LockError;
pub use lock::{CompilationGuard, CompilationLock, LockState};
