//! Conformance test helpers for the Kiln build engine.
//!
//! Provides stand-in collaborators for the pieces the engine does not own
//! (dependency parsing, code generation, compilation, module hosting) and a
//! [`Fixture`] that wires them to a [`BuildOrchestrator`] over an in-memory
//! source tree, for assertion in integration tests.
//!
//! Sources understood by [`LineParser`] are plain text with one directive
//! per line:
//!
//! | Line | Meaning |
//! |---|---|
//! | `dep <path>` | file dependency |
//! | `template <path>` | master page or control built first |
//! | `companion <path>` | code-behind file |
//! | `assembly <name>` | extra assembly reference |
//! | `separate` | never batch this unit |
//! | `broken` | parse error on this line |
//! | `codegen-error` | code generation fails |
//! | `compile-error` | compilation fails |
//! | `warn` | code generation reports a warning |
//! | `memory-only` | result is kept out of the disk tier |
//!
//! Relative paths resolve against the file's directory.

#![warn(missing_docs)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kiln_build::{
    BuildError, BuildOrchestrator, BuildUnit, CodeGenerator, CompileRequest, CompilerBackend,
    DependencyParser, GeneratedCode, ModuleHost, ParsedSource, SourceKind, SyntaxTree, Toolchain,
};
use kiln_cache::CompiledAssembly;
use kiln_common::{MemoryFileSystem, VirtualFileSystem, VirtualPath};
use kiln_config::KilnConfig;
use kiln_diagnostics::{Category, Diagnostic, DiagnosticCode, Location};
use parking_lot::{Condvar, Mutex};

const SYNTAX_ERROR: DiagnosticCode = DiagnosticCode::new(Category::Parse, 100);
const CODEGEN_ERROR: DiagnosticCode = DiagnosticCode::new(Category::Parse, 101);
const CODEGEN_WARNING: DiagnosticCode = DiagnosticCode::new(Category::Warning, 100);
const TYPE_ERROR: DiagnosticCode = DiagnosticCode::new(Category::Compile, 100);

/// Parses a path, panicking on malformed input.
pub fn vp(path: &str) -> VirtualPath {
    VirtualPath::parse(path).unwrap()
}

/// Routes `tracing` output to the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn lines_of(source: &[u8]) -> impl Iterator<Item = (u32, String)> + '_ {
    std::str::from_utf8(source)
        .unwrap_or_default()
        .lines()
        .enumerate()
        .map(|(i, l)| (i as u32 + 1, l.trim().to_string()))
}

/// Reads the directives described in the crate docs.
pub struct LineParser;

impl DependencyParser for LineParser {
    fn parse(
        &self,
        path: &VirtualPath,
        _kind: SourceKind,
        source: &[u8],
    ) -> Result<ParsedSource, Vec<Diagnostic>> {
        let mut parsed = ParsedSource::default();
        let mut errors = Vec::new();
        for (line, text) in lines_of(source) {
            let (directive, arg) = text.split_once(' ').unwrap_or((text.as_str(), ""));
            let target = || {
                path.join(arg).map_err(|e| {
                    Diagnostic::error(SYNTAX_ERROR, e.to_string())
                        .at(Location::line(path.clone(), line))
                })
            };
            match directive {
                "dep" => match target() {
                    Ok(p) => parsed.dependencies.push(p),
                    Err(d) => errors.push(d),
                },
                "template" => match target() {
                    Ok(p) => {
                        parsed.dependencies.push(p.clone());
                        parsed.templates.push(p);
                    }
                    Err(d) => errors.push(d),
                },
                "companion" => match target() {
                    Ok(p) => parsed.companions.push(p),
                    Err(d) => errors.push(d),
                },
                "assembly" => parsed.assemblies.push(arg.to_string()),
                "separate" => parsed.compile_separately = true,
                "broken" => errors.push(
                    Diagnostic::error(SYNTAX_ERROR, "unterminated directive")
                        .at(Location::line(path.clone(), line)),
                ),
                _ => {}
            }
        }
        if errors.is_empty() {
            Ok(parsed)
        } else {
            Err(errors)
        }
    }
}

/// Emits each unit's source text as its syntax tree.
///
/// Directory units emit the concatenation of their member files.
#[derive(Default)]
pub struct EchoGenerator {
    calls: AtomicUsize,
}

impl EchoGenerator {
    /// Units generated so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CodeGenerator for EchoGenerator {
    fn generate(
        &self,
        unit: &BuildUnit,
        vfs: &dyn VirtualFileSystem,
    ) -> Result<GeneratedCode, Vec<Diagnostic>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let sources: Vec<&VirtualPath> = if unit.kind == SourceKind::CodeDirectory {
            unit.companions.iter().collect()
        } else {
            std::iter::once(&unit.path).chain(&unit.companions).collect()
        };

        let mut text = String::new();
        let mut code = GeneratedCode::new(SyntaxTree {
            unit: unit.path.clone(),
            text: String::new(),
        });
        for source in sources {
            let bytes = vfs
                .read(source)
                .map_err(|e| vec![Diagnostic::error(CODEGEN_ERROR, e.to_string())])?;
            for (line, directive) in lines_of(&bytes) {
                match directive.as_str() {
                    "codegen-error" => {
                        return Err(vec![Diagnostic::error(CODEGEN_ERROR, "cannot generate")
                            .at(Location::line(source.clone(), line))]);
                    }
                    "warn" => code.warnings.push(
                        Diagnostic::warning(CODEGEN_WARNING, "suspicious directive")
                            .at(Location::line(source.clone(), line)),
                    ),
                    "memory-only" => code.memory_only = true,
                    _ => {}
                }
            }
            text.push_str(&String::from_utf8_lossy(&bytes));
            text.push('\n');
        }
        code.tree.text = text;
        code.entry = Some(format!("ASP.{}", unit.path.file_name().replace('.', "_")));
        code.assemblies = unit.references.clone();
        Ok(code)
    }
}

/// A latch that holds compilations until opened.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    /// A closed gate.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Releases every waiter, present and future.
    pub fn open(&self) {
        *self.open.lock() = true;
        self.opened.notify_all();
    }

    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.opened.wait(&mut open);
        }
    }
}

/// A compiler that records its invocations.
///
/// The image of an assembly is the concatenated text of its trees. A tree
/// containing a `compile-error` line fails the whole assembly.
#[derive(Default)]
pub struct CountingCompiler {
    invocations: AtomicUsize,
    entered: AtomicUsize,
    assemblies: Mutex<Vec<(String, Vec<VirtualPath>, Vec<String>)>>,
    gate: Mutex<Option<Arc<Gate>>>,
}

impl CountingCompiler {
    /// A compiler that never blocks.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every later compilation wait for `gate`.
    pub fn hold_at(&self, gate: Arc<Gate>) {
        *self.gate.lock() = Some(gate);
    }

    /// Completed or failed compilations.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Compilations that have started, including ones held at the gate.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    /// Names of the assemblies compiled, in order.
    pub fn assembly_names(&self) -> Vec<String> {
        self.assemblies.lock().iter().map(|(n, _, _)| n.clone()).collect()
    }

    /// The units compiled into each assembly, in order.
    pub fn batches(&self) -> Vec<Vec<VirtualPath>> {
        self.assemblies.lock().iter().map(|(_, u, _)| u.clone()).collect()
    }

    /// The references passed to the most recent compilation.
    pub fn last_references(&self) -> Vec<String> {
        self.assemblies
            .lock()
            .last()
            .map(|(_, _, r)| r.clone())
            .unwrap_or_default()
    }
}

impl CompilerBackend for CountingCompiler {
    fn compile(&self, request: &CompileRequest<'_>) -> Result<CompiledAssembly, Vec<Diagnostic>> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.wait();
        }
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.assemblies.lock().push((
            request.assembly_name.to_string(),
            request.trees.iter().map(|t| t.unit.clone()).collect(),
            request.references.to_vec(),
        ));

        let failures: Vec<Diagnostic> = request
            .trees
            .iter()
            .filter(|t| t.text.lines().any(|l| l.trim() == "compile-error"))
            .map(|t| {
                Diagnostic::error(TYPE_ERROR, "type mismatch").at(Location::file(t.unit.clone()))
            })
            .collect();
        if !failures.is_empty() {
            return Err(failures);
        }
        let image: String = request.trees.iter().map(|t| t.text.as_str()).collect();
        Ok(CompiledAssembly::new(request.assembly_name, image.into_bytes()))
    }
}

/// A module host whose loaded set is controlled by the test.
#[derive(Default)]
pub struct LoadedModules {
    loaded: Mutex<HashSet<String>>,
}

impl LoadedModules {
    /// Nothing loaded.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Marks `assembly` as loaded.
    pub fn load(&self, assembly: &str) {
        self.loaded.lock().insert(assembly.to_string());
    }

    /// Marks `assembly` as released.
    pub fn unload(&self, assembly: &str) {
        self.loaded.lock().remove(assembly);
    }
}

impl ModuleHost for LoadedModules {
    fn is_loaded(&self, assembly: &str) -> bool {
        self.loaded.lock().contains(assembly)
    }
}

/// An application under test: in-memory sources, an on-disk cache under
/// `root`, and stub collaborators shared across [`Fixture::reopen`].
pub struct Fixture {
    /// Physical application root; the cache lives beneath it.
    pub root: PathBuf,
    /// Source tree. Clones share storage, so edits are seen by the engine.
    pub vfs: MemoryFileSystem,
    /// The stub code generator.
    pub generator: Arc<EchoGenerator>,
    /// The stub compiler.
    pub compiler: Arc<CountingCompiler>,
    /// The stub module host.
    pub modules: Arc<LoadedModules>,
    /// The engine.
    pub orchestrator: BuildOrchestrator,
}

impl Fixture {
    /// Creates an application at `root` with the default configuration.
    pub fn new<S, C>(root: &Path, files: impl IntoIterator<Item = (S, C)>) -> Self
    where
        S: AsRef<str>,
        C: AsRef<[u8]>,
    {
        Self::with_config(root, files, KilnConfig::default_for("conformance"))
    }

    /// Creates an application at `root` with `config`.
    pub fn with_config<S, C>(
        root: &Path,
        files: impl IntoIterator<Item = (S, C)>,
        config: KilnConfig,
    ) -> Self
    where
        S: AsRef<str>,
        C: AsRef<[u8]>,
    {
        init_tracing();
        let vfs = MemoryFileSystem::with_files(files).unwrap();
        let generator = Arc::new(EchoGenerator::default());
        let compiler = CountingCompiler::new();
        let modules = LoadedModules::new();
        let orchestrator = assemble(root, &vfs, &generator, &compiler, &modules, config);
        Self {
            root: root.to_path_buf(),
            vfs,
            generator,
            compiler,
            modules,
            orchestrator,
        }
    }

    /// Simulates a process restart: a fresh orchestrator over the same
    /// sources, cache directory and collaborators.
    pub fn reopen(&mut self, config: KilnConfig) {
        self.orchestrator = assemble(
            &self.root,
            &self.vfs,
            &self.generator,
            &self.compiler,
            &self.modules,
            config,
        );
    }

    /// Creates or replaces a source file.
    pub fn write(&self, path: &str, content: &str) {
        self.vfs.write(&vp(path), content.as_bytes());
    }

    /// Builds `path`.
    pub fn build(&self, path: &str) -> Result<Arc<kiln_cache::BuildResult>, BuildError> {
        self.orchestrator.ensure_built(&vp(path))
    }
}

fn assemble(
    root: &Path,
    vfs: &MemoryFileSystem,
    generator: &Arc<EchoGenerator>,
    compiler: &Arc<CountingCompiler>,
    modules: &Arc<LoadedModules>,
    config: KilnConfig,
) -> BuildOrchestrator {
    let toolchain = Toolchain::new(
        Arc::new(LineParser),
        Arc::clone(generator) as Arc<dyn CodeGenerator>,
        Arc::clone(compiler) as Arc<dyn CompilerBackend>,
    )
    .with_modules(Arc::clone(modules) as Arc<dyn ModuleHost>);
    BuildOrchestrator::new(root, config, Arc::new(vfs.clone()), toolchain).unwrap()
}
