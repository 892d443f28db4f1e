//! Configuration types deserialized from `kiln.toml`.

use kiln_common::{ContentHash, HashCombiner};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// The top-level application build configuration parsed from `kiln.toml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KilnConfig {
    /// Application identity and the global initialization file.
    pub application: ApplicationConfig,
    /// Compiler selection and compilation policy.
    pub compilation: CompilationConfig,
    /// Batching limits.
    #[serde(default)]
    pub batch: BatchConfig,
    /// Persistent cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Names of the special application directories.
    #[serde(default)]
    pub directories: DirectoriesConfig,
    /// Reference assembly allow/deny lists.
    #[serde(default)]
    pub assemblies: AssembliesConfig,
    /// Extension overrides, e.g. `".page" = "page"`.
    #[serde(default)]
    pub extensions: BTreeMap<String, SourceKindSetting>,
}

impl KilnConfig {
    /// Returns a valid configuration with default settings for `name`.
    pub fn default_for(name: &str) -> Self {
        Self {
            application: ApplicationConfig {
                name: name.to_string(),
                global_file: default_global_file(),
            },
            compilation: CompilationConfig {
                compiler: "csharp".to_string(),
                options: Vec::new(),
                debug: false,
                num_recompiles_before_restart: default_recompiles(),
                parse_errors: ParseErrorPolicy::default(),
                fixed_names: false,
            },
            batch: BatchConfig::default(),
            cache: CacheConfig::default(),
            directories: DirectoriesConfig::default(),
            assemblies: AssembliesConfig::default(),
            extensions: BTreeMap::new(),
        }
    }

    /// Returns `true` if units should be grouped into shared assemblies.
    ///
    /// Fixed-name mode implies one assembly per unit.
    pub fn batching_enabled(&self) -> bool {
        self.batch.enabled && !self.compilation.fixed_names
    }

    /// Hashes every setting whose change must force a rebuild even when no
    /// source file changed.
    ///
    /// Covers compiler choice and options, debug mode, the assembly
    /// allow/deny lists, batching flags and limits, fixed-name mode and
    /// extension overrides. Cache settings and the restart ceiling are not
    /// covered.
    pub fn semantic_hash(&self) -> ContentHash {
        let mut h = HashCombiner::new();
        h.add_str("compiler").add_str(&self.compilation.compiler);
        h.add_u64(self.compilation.options.len() as u64);
        for option in &self.compilation.options {
            h.add_str(option);
        }
        h.add_bool(self.compilation.debug);
        h.add_bool(self.compilation.fixed_names);

        h.add_str("batch").add_bool(self.batch.enabled);
        h.add_u64(self.batch.max_units as u64);
        h.add_u64(self.batch.max_source_size);

        let mut add = self.assemblies.add.clone();
        add.sort_by_key(|a| a.to_lowercase());
        let mut remove = self.assemblies.remove.clone();
        remove.sort_by_key(|a| a.to_lowercase());
        h.add_str("add").add_u64(add.len() as u64);
        for a in &add {
            h.add_str(&a.to_lowercase());
        }
        h.add_str("remove").add_u64(remove.len() as u64);
        for r in &remove {
            h.add_str(&r.to_lowercase());
        }

        for (ext, kind) in &self.extensions {
            h.add_str(&ext.to_lowercase()).add_str(kind.as_str());
        }
        h.finish()
    }
}

/// Application identity.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApplicationConfig {
    /// The application name.
    pub name: String,
    /// The single global initialization file, relative to the root.
    #[serde(default = "default_global_file")]
    pub global_file: String,
}

fn default_global_file() -> String {
    "global.asax".to_string()
}

/// Compiler selection and compilation policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompilationConfig {
    /// Which compiler backend to use (e.g. "csharp").
    pub compiler: String,
    /// Options passed through to the compiler.
    #[serde(default)]
    pub options: Vec<String>,
    /// Whether to compile with debug information.
    #[serde(default)]
    pub debug: bool,
    /// Rebuilds of one unit allowed before the process must restart.
    #[serde(default = "default_recompiles")]
    pub num_recompiles_before_restart: u32,
    /// What to do when a unit in a batch fails to parse.
    #[serde(default)]
    pub parse_errors: ParseErrorPolicy,
    /// Give every unit its own deterministically named assembly.
    #[serde(default)]
    pub fixed_names: bool,
}

fn default_recompiles() -> u32 {
    15
}

/// Policy for parse failures within a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParseErrorPolicy {
    /// Abort the batch at the first unit that fails to parse.
    #[default]
    FailFast,
    /// Parse every unit and report all failures together.
    Collect,
}

/// Batching limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Whether units in one directory may share an assembly.
    pub enabled: bool,
    /// Maximum number of units per batch.
    pub max_units: usize,
    /// Maximum total source bytes per batch.
    pub max_source_size: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_units: 1000,
            max_source_size: 1_000_000,
        }
    }
}

/// Persistent cache settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory, relative to the physical application root.
    pub dir: String,
    /// Keep top-level results in the memory tier as well as on disk.
    pub keep_top_level_in_memory: bool,
    /// How long to wait for a previously loaded module to unload.
    pub unload_timeout_ms: u64,
    /// Polling interval while waiting for an unload.
    pub unload_poll_ms: u64,
}

impl CacheConfig {
    /// The unload wait timeout.
    pub fn unload_timeout(&self) -> Duration {
        Duration::from_millis(self.unload_timeout_ms)
    }

    /// The unload polling interval.
    pub fn unload_poll(&self) -> Duration {
        Duration::from_millis(self.unload_poll_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: ".kiln".to_string(),
            keep_top_level_in_memory: true,
            unload_timeout_ms: 5000,
            unload_poll_ms: 25,
        }
    }
}

/// Names of the special application directories, relative to the root.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DirectoriesConfig {
    /// The main code directory.
    pub code: String,
    /// Subdirectories of the code directory compiled as their own assemblies.
    pub code_subdirectories: Vec<String>,
    /// Application-wide resources.
    pub global_resources: String,
    /// Name of per-directory local resource folders.
    pub local_resources: String,
    /// Web service references.
    pub web_references: String,
    /// Themes.
    pub themes: String,
    /// Prebuilt assemblies.
    pub bin: String,
}

impl Default for DirectoriesConfig {
    fn default() -> Self {
        Self {
            code: "App_Code".to_string(),
            code_subdirectories: Vec::new(),
            global_resources: "App_GlobalResources".to_string(),
            local_resources: "App_LocalResources".to_string(),
            web_references: "App_WebReferences".to_string(),
            themes: "App_Themes".to_string(),
            bin: "bin".to_string(),
        }
    }
}

/// Reference assembly allow/deny lists.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AssembliesConfig {
    /// Assemblies always referenced.
    pub add: Vec<String>,
    /// Assemblies never referenced, even if a generator asks for them.
    pub remove: Vec<String>,
}

impl AssembliesConfig {
    /// Applies the allow/deny lists to the references a batch requested.
    ///
    /// The result is de-duplicated case-insensitively and sorted so that
    /// compiler invocations are reproducible.
    pub fn resolve<'a>(&'a self, requested: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let denied = |name: &str| self.remove.iter().any(|r| r.eq_ignore_ascii_case(name));
        let mut out: BTreeMap<String, String> = BTreeMap::new();
        for name in self.add.iter().map(String::as_str).chain(requested) {
            if !denied(name) {
                out.entry(name.to_lowercase())
                    .or_insert_with(|| name.to_string());
            }
        }
        out.into_values().collect()
    }
}

/// Source kinds an extension can be mapped to in `[extensions]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKindSetting {
    /// A page template.
    Page,
    /// A master page template.
    MasterPage,
    /// A user control template.
    UserControl,
    /// A request handler.
    Handler,
    /// A code-behind file.
    CodeBehind,
    /// An included fragment, never compiled by itself.
    Include,
    /// A plain code file.
    Code,
    /// A resource file.
    Resource,
}

impl SourceKindSetting {
    /// Returns the configuration spelling of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKindSetting::Page => "page",
            SourceKindSetting::MasterPage => "master-page",
            SourceKindSetting::UserControl => "user-control",
            SourceKindSetting::Handler => "handler",
            SourceKindSetting::CodeBehind => "code-behind",
            SourceKindSetting::Include => "include",
            SourceKindSetting::Code => "code",
            SourceKindSetting::Resource => "resource",
        }
    }
}
