//! The build pipeline driver.

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_cache::{BuildResult, BuildResultCache, CacheOptions};
use kiln_common::{ContentHash, DependencySet, HashCombiner, VirtualFileSystem, VirtualPath};
use kiln_config::{load_config, validate_config, KilnConfig};
use kiln_diagnostics::{Diagnostic, DiagnosticSink};
use kiln_lock::CompilationLock;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::batch::{BatchGroup, CompilationBatcher};
use crate::error::{BuildError, ErrorKind};
use crate::recompile::{RecompilationCounter, RestartReason, RestartSignal};
use crate::resolver::DependencyResolver;
use crate::toolchain::{CompileRequest, CompilerOptions, SyntaxTree, Toolchain};
use crate::unit::{BuildUnit, SourceClassifier, SourceKind};

type AppStartCallback = Box<dyn FnOnce(&[Arc<BuildResult>]) + Send>;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static IN_PROGRESS: RefCell<Vec<(usize, String)>> = const { RefCell::new(Vec::new()) };
}

/// Marks a path as being built on the current thread until dropped.
struct InProgress {
    owner: usize,
    key: String,
}

impl InProgress {
    fn enter(owner: usize, path: &VirtualPath) -> Result<Self, BuildError> {
        let key = path.key().to_string();
        IN_PROGRESS.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.iter().any(|(o, k)| *o == owner && *k == key) {
                return Err(BuildError::CircularReference(path.clone()));
            }
            stack.push((owner, key.clone()));
            Ok(Self { owner, key })
        })
    }

    fn contains(owner: usize, path: &VirtualPath) -> bool {
        IN_PROGRESS.with(|stack| {
            stack
                .borrow()
                .iter()
                .any(|(o, k)| *o == owner && k == path.key())
        })
    }
}

impl Drop for InProgress {
    fn drop(&mut self) {
        IN_PROGRESS.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack
                .iter()
                .rposition(|(o, k)| *o == self.owner && *k == self.key)
            {
                stack.remove(pos);
            }
        });
    }
}

/// Drives resolution, caching, batching and compilation for one application.
///
/// Owns the application's cache and compilation lock; several orchestrators
/// for different applications can live in one process.
pub struct BuildOrchestrator {
    id: usize,
    app_root: PathBuf,
    config: KilnConfig,
    classifier: SourceClassifier,
    batcher: CompilationBatcher,
    compiler_options: CompilerOptions,
    toolchain: Toolchain,
    vfs: Arc<dyn VirtualFileSystem>,
    cache: BuildResultCache,
    counter: RecompilationCounter,
    restart: RestartSignal,
    diagnostics: DiagnosticSink,
    /// Keys compiled or invalidated by this process.
    known: Mutex<HashSet<String>>,
    app_start: Mutex<Option<AppStartCallback>>,
}

impl BuildOrchestrator {
    /// Creates an orchestrator for the application at `app_root`.
    ///
    /// The cache and the named lock live under `config.cache.dir` relative
    /// to `app_root`; every process given the same root shares them.
    pub fn new(
        app_root: &Path,
        config: KilnConfig,
        vfs: Arc<dyn VirtualFileSystem>,
        toolchain: Toolchain,
    ) -> Result<Self, BuildError> {
        validate_config(&config)?;
        let classifier = SourceClassifier::new(&config)?;
        let cache_dir = app_root.join(&config.cache.dir);
        let lock = Arc::new(CompilationLock::new(
            &cache_dir,
            &app_root.to_string_lossy(),
        ));
        let mut options = CacheOptions::new(cache_dir, config.semantic_hash());
        options.keep_top_level_in_memory = config.cache.keep_top_level_in_memory;
        let cache = BuildResultCache::open(options, Arc::clone(&vfs), lock)?;

        info!(
            app = %config.application.name,
            root = %app_root.display(),
            "build orchestrator ready"
        );
        Ok(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            app_root: app_root.to_path_buf(),
            batcher: CompilationBatcher::new(&config),
            compiler_options: CompilerOptions::from_config(&config),
            counter: RecompilationCounter::new(config.compilation.num_recompiles_before_restart),
            classifier,
            config,
            toolchain,
            vfs,
            cache,
            restart: RestartSignal::new(),
            diagnostics: DiagnosticSink::new(),
            known: Mutex::new(HashSet::new()),
            app_start: Mutex::new(None),
        })
    }

    /// Loads `kiln.toml` from `app_root` and creates an orchestrator.
    pub fn open(
        app_root: &Path,
        vfs: Arc<dyn VirtualFileSystem>,
        toolchain: Toolchain,
    ) -> Result<Self, BuildError> {
        let config = load_config(app_root)?;
        Self::new(app_root, config, vfs, toolchain)
    }

    /// The application's configuration.
    pub fn config(&self) -> &KilnConfig {
        &self.config
    }

    /// The application's build result cache.
    pub fn cache(&self) -> &BuildResultCache {
        &self.cache
    }

    /// The application's compilation lock.
    pub fn lock(&self) -> &Arc<CompilationLock> {
        self.cache.lock()
    }

    /// The source classifier.
    pub fn classifier(&self) -> &SourceClassifier {
        &self.classifier
    }

    /// Rebuilds of `path` in this process.
    pub fn recompilations(&self, path: &VirtualPath) -> u32 {
        self.counter.count(&path.cache_key())
    }

    /// Registers the callback run once when the recompilation ceiling is
    /// crossed.
    pub fn on_restart(&self, callback: impl Fn(&RestartReason) + Send + Sync + 'static) {
        self.restart.on_restart(callback);
    }

    /// Returns `true` once a restart has been signalled.
    pub fn restart_required(&self) -> bool {
        self.restart.has_fired()
    }

    /// Registers the callback run after the top-level units are first
    /// built in this process.
    pub fn on_application_start(
        &self,
        callback: impl FnOnce(&[Arc<BuildResult>]) + Send + 'static,
    ) {
        *self.app_start.lock() = Some(Box::new(callback));
    }

    /// Warnings reported by code generators since the last call.
    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.take_sorted()
    }

    /// Validates the disk cache against the top-level files.
    ///
    /// Under the lock, hashes the application identity, the configuration
    /// and the special directories. If the hash differs from the persisted
    /// one every cached result is deleted; otherwise only leftover temp
    /// files are.
    pub fn initialize(&self) -> Result<(), BuildError> {
        let _guard = self.lock().acquire()?;
        let current = self.top_level_hash()?;
        match self.cache.read_top_level_hash() {
            Some(stored) if stored == current => {
                let removed = self.cache.remove_temp_files();
                debug!(removed, "top-level files unchanged");
            }
            stored => {
                let removed = self.cache.remove_all()?;
                info!(
                    removed,
                    first_run = stored.is_none(),
                    "top-level files changed, cache cleared"
                );
                self.cache.write_top_level_hash(current)?;
            }
        }
        Ok(())
    }

    fn top_level_hash(&self) -> Result<ContentHash, BuildError> {
        let layout = self.classifier.layout();
        let mut h = HashCombiner::new();
        h.add_str(&self.app_root.to_string_lossy());
        h.add_hash(&self.config.semantic_hash());
        for dir in [
            &layout.bin,
            &layout.code,
            &layout.global_resources,
            &layout.web_references,
        ] {
            h.add_str(dir.key()).add_hash(&self.vfs.hash(dir)?);
        }
        h.add_str(layout.global_file.key());
        if self.vfs.exists(&layout.global_file) {
            h.add_hash(&self.vfs.hash(&layout.global_file)?);
        } else {
            h.add_str("<absent>");
        }
        Ok(h.finish())
    }

    /// Returns a valid compiled result for `path`, building it if needed.
    ///
    /// Pages and controls first make sure the top-level units are built. A
    /// request for a code directory or the global file returns that unit's
    /// top-level result.
    pub fn ensure_built(&self, path: &VirtualPath) -> Result<Arc<BuildResult>, BuildError> {
        let kind = self.check_request(path)?;
        let top_level = self.ensure_top_level_built()?;
        if kind.is_top_level() {
            return top_level
                .into_iter()
                .find(|r| r.virtual_path() == path)
                .ok_or_else(|| BuildError::NotFound(path.clone()));
        }
        self.build_entry(path, kind, &top_level)
    }

    /// Builds the special directories and the global file, in dependency
    /// order, and returns their results.
    ///
    /// The first successful call in the process runs the application-start
    /// callback.
    pub fn ensure_top_level_built(&self) -> Result<Vec<Arc<BuildResult>>, BuildError> {
        let layout = self.classifier.layout();
        let mut dirs = vec![
            layout.global_resources.clone(),
            layout.web_references.clone(),
        ];
        dirs.extend(layout.code_subdirectories.iter().cloned());
        dirs.push(layout.code.clone());

        let mut results: Vec<Arc<BuildResult>> = Vec::new();
        for dir in dirs {
            if self.vfs.exists(&dir) {
                let result = self.build_entry(&dir, SourceKind::CodeDirectory, &results)?;
                results.push(result);
            }
        }
        if self.vfs.exists(&layout.global_file) {
            let result = self.build_entry(&layout.global_file, SourceKind::GlobalAppFile, &results)?;
            results.push(result);
        }

        let callback = self.app_start.lock().take();
        if let Some(callback) = callback {
            info!(units = results.len(), "application starting");
            callback(&results);
        }
        Ok(results)
    }

    /// The dependency hash and paths last recorded for `path`, without
    /// validating them.
    pub fn get_cached_dependency_set(
        &self,
        path: &VirtualPath,
    ) -> Option<(ContentHash, DependencySet)> {
        self.cache.cached_dependencies(&path.cache_key())
    }

    /// Evicts `path` from both cache tiers and builds it again.
    ///
    /// The rebuild counts towards the recompilation ceiling.
    pub fn invalidate_and_rebuild(&self, path: &VirtualPath) -> Result<Arc<BuildResult>, BuildError> {
        self.check_request(path)?;
        let key = path.cache_key();
        self.known.lock().insert(key.clone());
        self.cache.remove(&key)?;
        info!(path = %path, "invalidated");
        self.ensure_built(path)
    }

    /// Stops accepting compilations and waits up to `timeout` for running
    /// ones to finish. Returns `true` if everything finished.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.lock().drain(timeout)
    }

    fn check_request(&self, path: &VirtualPath) -> Result<SourceKind, BuildError> {
        let kind = self.classifier.classify(path);
        if kind != Some(SourceKind::CodeDirectory) && self.classifier.layout().is_forbidden(path) {
            return Err(BuildError::ForbiddenPath(path.clone()));
        }
        if !self.vfs.exists(path) {
            return Err(BuildError::NotFound(path.clone()));
        }
        match kind {
            Some(kind) if kind.is_requestable() => Ok(kind),
            _ => Err(BuildError::NoBuildProvider(path.clone())),
        }
    }

    fn build_entry(
        &self,
        path: &VirtualPath,
        kind: SourceKind,
        top_level: &[Arc<BuildResult>],
    ) -> Result<Arc<BuildResult>, BuildError> {
        let _in_progress = InProgress::enter(self.id, path)?;
        let key = path.cache_key();
        let rebuild =
            self.known.lock().contains(&key) || self.cache.cached_dependencies(&key).is_some();

        if let Some(hit) = self.cache.get(&key)? {
            return Ok(hit);
        }
        debug!(path = %path, rebuild, "cache miss");

        let unit = self.describe(path, kind)?;
        let mut references = top_level.to_vec();
        for template in &unit.templates {
            references.push(self.build_template(&unit, template, top_level)?);
        }
        let siblings = self.collect_siblings(&unit);

        let _guard = self.lock().acquire()?;
        if let Some(hit) = self.cache.get(&key)? {
            debug!(path = %path, "built while waiting for the lock");
            return Ok(hit);
        }
        // Siblings may have been compiled by another request in the meantime.
        let siblings: Vec<BuildUnit> = siblings
            .into_iter()
            .filter(|s| !matches!(self.cache.get(&s.path.cache_key()), Ok(Some(_))))
            .collect();
        self.compile_requested(unit, siblings, &references, rebuild)
    }

    fn build_template(
        &self,
        unit: &BuildUnit,
        template: &VirtualPath,
        top_level: &[Arc<BuildResult>],
    ) -> Result<Arc<BuildResult>, BuildError> {
        if !self.vfs.exists(template) {
            return Err(BuildError::MissingDependency {
                path: unit.path.clone(),
                missing: template.clone(),
            });
        }
        match self.classifier.classify(template) {
            Some(kind) if kind.is_requestable() && !kind.is_top_level() => {
                self.build_entry(template, kind, top_level)
            }
            _ => Err(BuildError::NoBuildProvider(template.clone())),
        }
    }

    fn describe(&self, path: &VirtualPath, kind: SourceKind) -> Result<BuildUnit, BuildError> {
        if kind == SourceKind::CodeDirectory {
            return Ok(self.classifier.describe_directory(path, self.vfs.as_ref())?);
        }
        let source = self.vfs.read(path)?;
        let parsed = self
            .toolchain
            .parser
            .parse(path, kind, &source)
            .map_err(|diagnostics| BuildError::Parse {
                path: path.clone(),
                diagnostics,
            })?;
        Ok(BuildUnit::from_parsed(
            path.clone(),
            kind,
            self.classifier.scope_of(path),
            parsed,
            source.len() as u64,
        ))
    }

    /// Uncached batchable units in the same directory that can share the
    /// requested unit's assembly. Units with template references of their
    /// own are left to build on demand.
    fn collect_siblings(&self, unit: &BuildUnit) -> Vec<BuildUnit> {
        if !self.batcher.is_enabled() || !unit.kind.is_batchable() || unit.compile_separately {
            return Vec::new();
        }
        let Some(dir) = unit.path.parent() else {
            return Vec::new();
        };
        let Ok(entries) = self.vfs.list(&dir) else {
            return Vec::new();
        };

        let mut siblings = Vec::new();
        for path in entries {
            if path.is_directory() || path == unit.path || InProgress::contains(self.id, &path) {
                continue;
            }
            let Some(kind) = self.classifier.classify(&path) else {
                continue;
            };
            if !kind.is_batchable() || self.classifier.layout().is_forbidden(&path) {
                continue;
            }
            if matches!(self.cache.get(&path.cache_key()), Ok(Some(_))) {
                continue;
            }
            match self.describe(&path, kind) {
                Ok(sibling) if sibling.templates.is_empty() && !sibling.compile_separately => {
                    siblings.push(sibling);
                }
                Ok(_) => {}
                Err(e) => debug!(path = %path, error = %e, "sibling left out of batch"),
            }
        }
        siblings
    }

    fn compile_requested(
        &self,
        unit: BuildUnit,
        siblings: Vec<BuildUnit>,
        references: &[Arc<BuildResult>],
        rebuild: bool,
    ) -> Result<Arc<BuildResult>, BuildError> {
        let path = unit.path.clone();
        let mut candidates = siblings;
        candidates.push(unit.clone());
        let group = self
            .batcher
            .batch(candidates)
            .into_iter()
            .find(|g| g.contains(&path))
            .unwrap_or_else(|| self.batcher.singleton(unit.clone()));

        let results = match self.compile_group(&group, &path, references) {
            Ok(results) => results,
            Err(err) if group.units.len() > 1 && err.kind() == ErrorKind::User => {
                warn!(
                    path = %path,
                    assembly = %group.assembly_name,
                    error = %err,
                    "batch failed, compiling unit alone"
                );
                self.compile_group(&self.batcher.singleton(unit), &path, references)?
            }
            Err(err) => return Err(err),
        };

        let mut requested = None;
        for result in results {
            let result = Arc::new(result);
            let key = result.virtual_path().cache_key();
            self.known.lock().insert(key.clone());
            if *result.virtual_path() == path {
                requested = Some((key, result));
            } else {
                self.store(&key, &result);
            }
        }
        let (key, result) = requested.ok_or_else(|| BuildError::NotFound(path.clone()))?;

        if rebuild {
            let count = self.counter.record(&key);
            if self.counter.exceeds(count) {
                if let Err(e) = self.cache.persist(&key, &result) {
                    warn!(key = %key, error = %e, "failed to persist result before restart");
                }
                let reason = RestartReason {
                    path: path.clone(),
                    recompilations: count,
                };
                if self.restart.fire(&reason) {
                    self.lock().begin_drain();
                }
                return Err(BuildError::RestartRequired { path, count });
            }
        }
        self.store(&key, &result);
        Ok(result)
    }

    fn compile_group(
        &self,
        group: &BatchGroup,
        requested: &VirtualPath,
        references: &[Arc<BuildResult>],
    ) -> Result<Vec<BuildResult>, BuildError> {
        let resolver = DependencyResolver::new(
            self.vfs.as_ref(),
            self.toolchain.parser.as_ref(),
            &self.classifier,
        );
        let mut snapshots = Vec::with_capacity(group.units.len());
        for unit in &group.units {
            let mut deps = resolver.resolve(unit)?;
            deps.extend(references.iter().map(|r| r.virtual_path().clone()));
            let hash = self.cache.dependencies_hash(&deps)?;
            snapshots.push((deps, hash));
        }

        let generated = self
            .batcher
            .generate(group, self.toolchain.generator.as_ref(), self.vfs.as_ref())
            .map_err(|failure| BuildError::Parse {
                path: failure
                    .failed
                    .first()
                    .map(|(p, _)| p.clone())
                    .unwrap_or_else(|| requested.clone()),
                diagnostics: failure.diagnostics(),
            })?;
        for code in &generated {
            self.diagnostics.extend(code.warnings.iter().cloned());
        }

        self.wait_for_unload(&group.assembly_name)?;

        let requested_refs = group
            .units
            .iter()
            .flat_map(|u| u.references.iter().map(String::as_str))
            .chain(generated.iter().flat_map(|g| g.assemblies.iter().map(String::as_str)))
            .chain(references.iter().filter_map(|r| r.assembly()).map(|a| a.name()));
        let assembly_refs = self.config.assemblies.resolve(requested_refs);
        let trees: Vec<SyntaxTree> = generated.iter().map(|g| g.tree.clone()).collect();

        info!(
            assembly = %group.assembly_name,
            units = trees.len(),
            references = assembly_refs.len(),
            "compiling"
        );
        let request = CompileRequest {
            assembly_name: &group.assembly_name,
            trees: &trees,
            references: &assembly_refs,
            options: &self.compiler_options,
        };
        let assembly = self
            .toolchain
            .compiler
            .compile(&request)
            .map_err(|diagnostics| BuildError::Compile {
                path: requested.clone(),
                diagnostics,
            })?;
        let assembly = Arc::new(assembly);

        let semantic_hash = self.cache.semantic_hash();
        Ok(group
            .units
            .iter()
            .zip(generated)
            .zip(snapshots)
            .map(|((unit, code), (deps, hash))| {
                let result = BuildResult::new(
                    unit.kind.result_kind(),
                    unit.path.clone(),
                    deps,
                    hash,
                    semantic_hash,
                )
                .with_assembly(Arc::clone(&assembly), code.entry);
                if unit.kind.is_top_level() {
                    result.top_level()
                } else if code.memory_only {
                    result.memory_only()
                } else {
                    result
                }
            })
            .collect())
    }

    fn wait_for_unload(&self, assembly: &str) -> Result<(), BuildError> {
        let timeout = self.config.cache.unload_timeout();
        let poll = self.config.cache.unload_poll();
        let start = Instant::now();
        while self.toolchain.modules.is_loaded(assembly) {
            let waited = start.elapsed();
            if waited >= timeout {
                warn!(assembly, ?waited, "previous module still loaded");
                return Err(BuildError::ConcurrencyTimeout {
                    assembly: assembly.to_string(),
                    waited,
                });
            }
            std::thread::sleep(poll.min(timeout - waited));
        }
        Ok(())
    }

    /// Caches `result`, then evicts it again if a dependency changed while
    /// it was being built.
    fn store(&self, key: &str, result: &Arc<BuildResult>) {
        if let Err(e) = self.cache.put(key, result) {
            warn!(key, error = %e, "failed to cache build result");
            return;
        }
        match self.cache.dependencies_hash(result.dependencies()) {
            Ok(current) if current == result.dependencies_hash() => {}
            _ => {
                warn!(key, "dependencies changed during build, evicting result");
                if let Err(e) = self.cache.remove(key) {
                    warn!(key, error = %e, "failed to evict result");
                }
            }
        }
    }
}

impl std::fmt::Debug for BuildOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildOrchestrator")
            .field("app", &self.config.application.name)
            .field("root", &self.app_root)
            .field("lock", self.lock())
            .finish()
    }
}
