//! Build results and compiled assembly handles.

use std::fmt;
use std::sync::Arc;

use kiln_common::{ContentHash, DependencySet, VirtualPath};
use serde::{Deserialize, Serialize};

/// An opaque compiled assembly produced by the compiler backend.
///
/// One assembly may back many build results when units were compiled as a
/// batch; results share it through an `Arc`.
pub struct CompiledAssembly {
    name: String,
    image: Vec<u8>,
}

impl CompiledAssembly {
    /// Wraps a compiled image under its output name.
    pub fn new(name: impl Into<String>, image: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            image,
        }
    }

    /// The assembly's output name, also its file stem in the cache.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The compiled image.
    pub fn image(&self) -> &[u8] {
        &self.image
    }
}

impl fmt::Debug for CompiledAssembly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledAssembly")
            .field("name", &self.name)
            .field("size", &self.image.len())
            .finish()
    }
}

/// What kind of unit a result was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultKind {
    /// A template or handler compiled into an entry type of an assembly.
    Compiled,
    /// A whole special directory (code, resources, web references).
    CodeDirectory,
    /// The global application file.
    GlobalApplication,
}

/// One compiled output and everything needed to decide whether it is still
/// valid. Never mutated after creation; a rebuild produces a new result.
#[derive(Debug, Clone)]
pub struct BuildResult {
    kind: ResultKind,
    virtual_path: VirtualPath,
    dependencies: DependencySet,
    dependencies_hash: ContentHash,
    semantic_hash: ContentHash,
    assembly: Option<Arc<CompiledAssembly>>,
    entry: Option<String>,
    memory_only: bool,
    top_level: bool,
}

impl BuildResult {
    /// Creates a result for `virtual_path` built from `dependencies`.
    ///
    /// `dependencies_hash` is the combined hash of those files at build time;
    /// `semantic_hash` is the configuration hash in effect.
    pub fn new(
        kind: ResultKind,
        virtual_path: VirtualPath,
        dependencies: DependencySet,
        dependencies_hash: ContentHash,
        semantic_hash: ContentHash,
    ) -> Self {
        Self {
            kind,
            virtual_path,
            dependencies,
            dependencies_hash,
            semantic_hash,
            assembly: None,
            entry: None,
            memory_only: false,
            top_level: false,
        }
    }

    /// Attaches the compiled assembly and the entry type inside it.
    pub fn with_assembly(mut self, assembly: Arc<CompiledAssembly>, entry: Option<String>) -> Self {
        self.assembly = Some(assembly);
        self.entry = entry;
        self
    }

    /// Marks the result as never persisted to disk.
    pub fn memory_only(mut self) -> Self {
        self.memory_only = true;
        self
    }

    /// Marks the result as top-level: always persisted, never memory-only.
    pub fn top_level(mut self) -> Self {
        self.top_level = true;
        self.memory_only = false;
        self
    }

    /// The kind of unit this result was built for.
    pub fn kind(&self) -> ResultKind {
        self.kind
    }

    /// The originating virtual path.
    pub fn virtual_path(&self) -> &VirtualPath {
        &self.virtual_path
    }

    /// Everything that invalidates this result when changed.
    pub fn dependencies(&self) -> &DependencySet {
        &self.dependencies
    }

    /// Combined hash of the dependencies at build time.
    pub fn dependencies_hash(&self) -> ContentHash {
        self.dependencies_hash
    }

    /// Configuration hash at build time.
    pub fn semantic_hash(&self) -> ContentHash {
        self.semantic_hash
    }

    /// The compiled assembly, if the unit produced code.
    pub fn assembly(&self) -> Option<&Arc<CompiledAssembly>> {
        self.assembly.as_ref()
    }

    /// The entry type inside the assembly.
    pub fn entry(&self) -> Option<&str> {
        self.entry.as_deref()
    }

    /// `true` if the result must not reach the disk tier.
    pub fn is_memory_only(&self) -> bool {
        self.memory_only
    }

    /// `true` for the global file and code directories.
    pub fn is_top_level(&self) -> bool {
        self.top_level
    }
}
