//! Two-tier cache of build results.
//!
//! A [`BuildResult`] ties a compiled assembly to the dependency set and
//! configuration it was built from. [`BuildResultCache`] keeps results in a
//! process-lifetime memory tier and persists them to disk as versioned
//! preservation records plus integrity-checked assembly images, validating
//! every hit against the current dependency hash and semantic hash.

#![warn(missing_docs)]

pub mod artifact;
pub mod cache;
pub mod disk;
pub mod error;
pub mod hasher;
pub mod memory;
pub mod record;
pub mod result;

pub use artifact::AssemblyStore;
pub use cache::{BuildResultCache, CacheOptions};
pub use error::CacheError;
pub use hasher::{DependencyHasher, Freshness};
pub use record::{PreservationRecord, RecordStore};
pub use result::{BuildResult, CompiledAssembly, ResultKind};
