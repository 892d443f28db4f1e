//! Build-unit resolution, batching and orchestration.
//!
//! [`BuildOrchestrator`] is the entry point: it classifies a requested
//! virtual path into a [`BuildUnit`], consults the two-tier cache, resolves
//! the unit's transitive dependencies, groups it with batchable siblings,
//! and drives the external [`CodeGenerator`] and [`CompilerBackend`] under
//! the application's compilation lock.

#![warn(missing_docs)]

pub mod batch;
pub mod error;
pub mod orchestrator;
pub mod recompile;
pub mod resolver;
pub mod scope;
pub mod toolchain;
pub mod unit;

pub use batch::{BatchGroup, CompilationBatcher, GenerationFailure};
pub use error::{BuildError, ErrorKind};
pub use orchestrator::BuildOrchestrator;
pub use recompile::{RecompilationCounter, RestartReason, RestartSignal};
pub use resolver::DependencyResolver;
pub use scope::CompilationScope;
pub use toolchain::{
    CodeGenerator, CompileRequest, CompilerBackend, CompilerOptions, DependencyParser,
    GeneratedCode, ModuleHost, NoModuleHost, ParsedSource, SyntaxTree, Toolchain,
};
pub use unit::{BuildUnit, SourceClassifier, SourceKind};
