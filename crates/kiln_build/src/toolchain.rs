//! Collaborator interfaces consumed by the build pipeline.
//!
//! Markup parsing, syntax-tree generation and the language compiler live
//! outside this crate. The orchestrator only sees them through these traits,
//! dispatched by [`SourceKind`].

use std::sync::Arc;

use kiln_cache::CompiledAssembly;
use kiln_common::{VirtualFileSystem, VirtualPath};
use kiln_config::KilnConfig;
use kiln_diagnostics::Diagnostic;

use crate::unit::{BuildUnit, SourceKind};

/// What a dependency parser learned from one source file.
#[derive(Debug, Clone, Default)]
pub struct ParsedSource {
    /// Every file the source pulls in: includes, master pages, user
    /// controls, code-behind.
    pub dependencies: Vec<VirtualPath>,
    /// The subset of `dependencies` that are separately compiled templates
    /// whose assemblies this unit references.
    pub templates: Vec<VirtualPath>,
    /// Files that must be compiled in the same batch, such as code-behind.
    pub companions: Vec<VirtualPath>,
    /// Assembly references requested by directives.
    pub assemblies: Vec<String>,
    /// The source asks for its own assembly.
    pub compile_separately: bool,
}

/// Extracts dependency information from a source file.
pub trait DependencyParser: Send + Sync {
    /// Parses `source`, the content of `path`.
    fn parse(
        &self,
        path: &VirtualPath,
        kind: SourceKind,
        source: &[u8],
    ) -> Result<ParsedSource, Vec<Diagnostic>>;
}

/// An intermediate syntax tree, opaque to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxTree {
    /// The unit the tree was generated from.
    pub unit: VirtualPath,
    /// Generated program text.
    pub text: String,
}

/// The output of a code generator for one unit.
#[derive(Debug, Clone)]
pub struct GeneratedCode {
    /// The compilable tree.
    pub tree: SyntaxTree,
    /// The entry type the unit compiles to.
    pub entry: Option<String>,
    /// Extra assembly references the generated code needs.
    pub assemblies: Vec<String>,
    /// Non-fatal findings.
    pub warnings: Vec<Diagnostic>,
    /// Keep the result out of the disk tier.
    pub memory_only: bool,
}

impl GeneratedCode {
    /// Generated code with no entry type, references or warnings.
    pub fn new(tree: SyntaxTree) -> Self {
        Self {
            tree,
            entry: None,
            assemblies: Vec::new(),
            warnings: Vec::new(),
            memory_only: false,
        }
    }
}

/// Turns a unit into a syntax tree.
pub trait CodeGenerator: Send + Sync {
    /// Generates code for `unit`, reading its sources through `vfs`.
    fn generate(
        &self,
        unit: &BuildUnit,
        vfs: &dyn VirtualFileSystem,
    ) -> Result<GeneratedCode, Vec<Diagnostic>>;
}

/// Compiler settings passed through to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerOptions {
    /// Backend selector, e.g. `csharp`.
    pub compiler: String,
    /// Raw options.
    pub options: Vec<String>,
    /// Emit debug information.
    pub debug: bool,
}

impl CompilerOptions {
    /// Extracts compiler settings from `config`.
    pub fn from_config(config: &KilnConfig) -> Self {
        Self {
            compiler: config.compilation.compiler.clone(),
            options: config.compilation.options.clone(),
            debug: config.compilation.debug,
        }
    }
}

/// One compiler invocation.
#[derive(Debug)]
pub struct CompileRequest<'a> {
    /// Output assembly name.
    pub assembly_name: &'a str,
    /// Trees to compile together, in batch order.
    pub trees: &'a [SyntaxTree],
    /// Referenced assemblies after the allow/deny lists were applied.
    pub references: &'a [String],
    /// Compiler settings.
    pub options: &'a CompilerOptions,
}

/// Compiles syntax trees into an assembly.
pub trait CompilerBackend: Send + Sync {
    /// Compiles `request` or returns the compiler's diagnostics.
    fn compile(&self, request: &CompileRequest<'_>) -> Result<CompiledAssembly, Vec<Diagnostic>>;
}

/// Knows which assemblies the hosting process still has loaded.
pub trait ModuleHost: Send + Sync {
    /// Returns `true` while `assembly` is loaded and its output name cannot
    /// be reused.
    fn is_loaded(&self, assembly: &str) -> bool;
}

/// A host that never holds assemblies.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoModuleHost;

impl ModuleHost for NoModuleHost {
    fn is_loaded(&self, _assembly: &str) -> bool {
        false
    }
}

/// The external collaborators of one orchestrator.
#[derive(Clone)]
pub struct Toolchain {
    /// Dependency parser.
    pub parser: Arc<dyn DependencyParser>,
    /// Syntax-tree generator.
    pub generator: Arc<dyn CodeGenerator>,
    /// Compiler backend.
    pub compiler: Arc<dyn CompilerBackend>,
    /// Loaded-module tracker.
    pub modules: Arc<dyn ModuleHost>,
}

impl Toolchain {
    /// A toolchain whose host never holds assemblies.
    pub fn new(
        parser: Arc<dyn DependencyParser>,
        generator: Arc<dyn CodeGenerator>,
        compiler: Arc<dyn CompilerBackend>,
    ) -> Self {
        Self {
            parser,
            generator,
            compiler,
            modules: Arc::new(NoModuleHost),
        }
    }

    /// Replaces the module host.
    pub fn with_modules(mut self, modules: Arc<dyn ModuleHost>) -> Self {
        self.modules = modules;
        self
    }
}
