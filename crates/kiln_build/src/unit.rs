//! Build units and source classification.

use kiln_common::{VfsError, VirtualFileSystem, VirtualPath};
use kiln_config::{ConfigError, DirectoryLayout, KilnConfig, SourceKindSetting};

use crate::scope::CompilationScope;
use crate::toolchain::ParsedSource;
use kiln_cache::ResultKind;

/// What kind of source a unit is, which selects its parser and generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// A page template.
    Page,
    /// A master page template.
    MasterPage,
    /// A user control template.
    UserControl,
    /// A request handler or web service.
    Handler,
    /// Code-behind for a template; only compiled as a companion.
    CodeBehind,
    /// An included fragment; only compiled through its includer.
    Include,
    /// A code file inside a code directory.
    Code,
    /// A resource file.
    Resource,
    /// The global application file.
    GlobalAppFile,
    /// A whole code, resources or web references directory.
    CodeDirectory,
}

impl SourceKind {
    /// The built-in kind for a lower-cased extension (with dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        Some(match ext {
            ".aspx" => SourceKind::Page,
            ".master" => SourceKind::MasterPage,
            ".ascx" => SourceKind::UserControl,
            ".ashx" | ".asmx" => SourceKind::Handler,
            ".cs" | ".vb" => SourceKind::CodeBehind,
            ".inc" => SourceKind::Include,
            ".resx" | ".resources" => SourceKind::Resource,
            _ => return None,
        })
    }

    fn from_setting(setting: SourceKindSetting) -> Self {
        match setting {
            SourceKindSetting::Page => SourceKind::Page,
            SourceKindSetting::MasterPage => SourceKind::MasterPage,
            SourceKindSetting::UserControl => SourceKind::UserControl,
            SourceKindSetting::Handler => SourceKind::Handler,
            SourceKindSetting::CodeBehind => SourceKind::CodeBehind,
            SourceKindSetting::Include => SourceKind::Include,
            SourceKindSetting::Code => SourceKind::Code,
            SourceKindSetting::Resource => SourceKind::Resource,
        }
    }

    /// Can be passed to `ensure_built` directly.
    pub fn is_requestable(self) -> bool {
        matches!(
            self,
            SourceKind::Page
                | SourceKind::MasterPage
                | SourceKind::UserControl
                | SourceKind::Handler
                | SourceKind::GlobalAppFile
                | SourceKind::CodeDirectory
        )
    }

    /// May share an assembly with siblings in the same directory.
    pub fn is_batchable(self) -> bool {
        matches!(
            self,
            SourceKind::Page | SourceKind::MasterPage | SourceKind::UserControl | SourceKind::Handler
        )
    }

    /// Has a parseable dependency list.
    pub fn has_dependencies(self) -> bool {
        matches!(
            self,
            SourceKind::Page
                | SourceKind::MasterPage
                | SourceKind::UserControl
                | SourceKind::Handler
                | SourceKind::Include
                | SourceKind::GlobalAppFile
        )
    }

    /// Always persisted, built before any page.
    pub fn is_top_level(self) -> bool {
        matches!(self, SourceKind::GlobalAppFile | SourceKind::CodeDirectory)
    }

    /// The result-type tag recorded for this kind.
    pub fn result_kind(self) -> ResultKind {
        match self {
            SourceKind::CodeDirectory => ResultKind::CodeDirectory,
            SourceKind::GlobalAppFile => ResultKind::GlobalApplication,
            _ => ResultKind::Compiled,
        }
    }
}

/// One thing that must be compiled.
///
/// Created per request and never persisted; its result is.
#[derive(Debug, Clone)]
pub struct BuildUnit {
    /// The unit's virtual path.
    pub path: VirtualPath,
    /// The unit's source kind.
    pub kind: SourceKind,
    /// The batching boundary it belongs to.
    pub scope: CompilationScope,
    /// Direct dependencies reported by the parser.
    pub dependencies: Vec<VirtualPath>,
    /// Separately compiled templates this unit references.
    pub templates: Vec<VirtualPath>,
    /// Files or units that must compile in the same batch. For directory
    /// units, the member files.
    pub companions: Vec<VirtualPath>,
    /// Assembly references required by the unit.
    pub references: Vec<String>,
    /// Bytes of source, used against the batch size limit.
    pub size: u64,
    /// The unit gets its own assembly.
    pub compile_separately: bool,
}

impl BuildUnit {
    /// A unit with no dependencies beyond itself.
    pub fn new(path: VirtualPath, kind: SourceKind, scope: CompilationScope) -> Self {
        Self {
            path,
            kind,
            scope,
            dependencies: Vec::new(),
            templates: Vec::new(),
            companions: Vec::new(),
            references: Vec::new(),
            size: 0,
            compile_separately: kind.is_top_level(),
        }
    }

    /// A unit described by a parse of its source.
    pub fn from_parsed(
        path: VirtualPath,
        kind: SourceKind,
        scope: CompilationScope,
        parsed: ParsedSource,
        size: u64,
    ) -> Self {
        Self {
            dependencies: parsed.dependencies,
            templates: parsed.templates,
            companions: parsed.companions,
            references: parsed.assemblies,
            size,
            compile_separately: parsed.compile_separately || kind.is_top_level(),
            ..Self::new(path, kind, scope)
        }
    }

    /// The cache key results of this unit are stored under.
    pub fn cache_key(&self) -> String {
        self.path.cache_key()
    }
}

/// Maps virtual paths to source kinds and scopes for one application.
#[derive(Debug, Clone)]
pub struct SourceClassifier {
    layout: DirectoryLayout,
    overrides: Vec<(String, SourceKind)>,
}

impl SourceClassifier {
    /// Builds a classifier from the application's configuration.
    pub fn new(config: &KilnConfig) -> Result<Self, ConfigError> {
        let overrides = config
            .extensions
            .iter()
            .map(|(ext, kind)| (ext.to_lowercase(), SourceKind::from_setting(*kind)))
            .collect();
        Ok(Self {
            layout: DirectoryLayout::resolve(config)?,
            overrides,
        })
    }

    /// The application's special directories.
    pub fn layout(&self) -> &DirectoryLayout {
        &self.layout
    }

    /// Returns `true` for the directories compiled as one unit each.
    pub fn is_directory_unit(&self, path: &VirtualPath) -> bool {
        let layout = &self.layout;
        *path == layout.code
            || *path == layout.global_resources
            || *path == layout.web_references
            || layout.code_subdirectories.contains(path)
    }

    /// The source kind of `path`, or `None` if nothing can build it.
    pub fn classify(&self, path: &VirtualPath) -> Option<SourceKind> {
        if path.is_directory() {
            return self
                .is_directory_unit(path)
                .then_some(SourceKind::CodeDirectory);
        }
        if *path == self.layout.global_file {
            return Some(SourceKind::GlobalAppFile);
        }
        let ext = path.extension()?;
        if let Some((_, kind)) = self.overrides.iter().find(|(e, _)| *e == ext) {
            return Some(*kind);
        }
        if path.is_within(&self.layout.code) {
            return Some(SourceKind::Code);
        }
        SourceKind::from_extension(&ext)
    }

    /// The compilation scope of `path`.
    pub fn scope_of(&self, path: &VirtualPath) -> CompilationScope {
        let layout = &self.layout;
        if *path == layout.global_file {
            return CompilationScope::Application;
        }
        if let Some(sub) = layout.code_subdirectory_of(path) {
            return CompilationScope::SubCode(sub.file_name().to_string());
        }
        if path.is_within(&layout.code) {
            return CompilationScope::MainCode;
        }
        if path.is_within(&layout.global_resources) {
            return CompilationScope::GlobalResources;
        }
        if path.is_within(&layout.web_references) {
            return CompilationScope::WebReferences;
        }
        if path.is_within(&layout.themes) {
            let depth = layout.themes.segments().count();
            let name = path.segments().nth(depth).unwrap_or_default();
            return CompilationScope::Theme(name.to_string());
        }
        let parent = path.parent().unwrap_or_else(VirtualPath::root);
        if parent
            .segments()
            .last()
            .is_some_and(|s| s.eq_ignore_ascii_case(&layout.local_resources))
        {
            return CompilationScope::LocalResources(parent);
        }
        CompilationScope::WebDirectory(parent)
    }

    /// Describes a directory unit; its companions are its member files.
    ///
    /// The main code directory leaves out its configured subdirectories,
    /// which compile as their own scopes.
    pub fn describe_directory(
        &self,
        dir: &VirtualPath,
        vfs: &dyn VirtualFileSystem,
    ) -> Result<BuildUnit, VfsError> {
        let scope = self.scope_of(dir);
        let excluded: &[VirtualPath] = if scope == CompilationScope::MainCode {
            &self.layout.code_subdirectories
        } else {
            &[]
        };
        let members: Vec<VirtualPath> = vfs
            .list_files_recursive(dir)?
            .into_iter()
            .filter(|f| !excluded.iter().any(|sub| f.is_within(sub)))
            .collect();
        let mut size = 0;
        for member in &members {
            size += vfs.file_size(member)?;
        }
        let mut unit = BuildUnit::new(dir.clone(), SourceKind::CodeDirectory, scope);
        unit.companions = members;
        unit.size = size;
        Ok(unit)
    }
}
