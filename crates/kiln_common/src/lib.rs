//! Shared foundational types for the Kiln on-demand build engine.
//!
//! This crate provides application-relative virtual paths, content hashing,
//! dependency sets, and the virtual file system the engine reads sources from.

#![warn(missing_docs)]

pub mod dependency;
pub mod hash;
pub mod vfs;
pub mod virtual_path;

pub use dependency::DependencySet;
pub use hash::{ContentHash, HashCombiner};
pub use vfs::{MemoryFileSystem, PhysicalFileSystem, VfsError, VirtualFileSystem};
pub use virtual_path::{PathError, VirtualPath};
