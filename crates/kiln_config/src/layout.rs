//! Resolved special-directory layout.

use crate::error::ConfigError;
use crate::types::KilnConfig;
use kiln_common::VirtualPath;

/// The special directories of an application, as virtual paths.
///
/// Built once from [`KilnConfig`]; every path has already been validated.
#[derive(Debug, Clone)]
pub struct DirectoryLayout {
    /// The main code directory.
    pub code: VirtualPath,
    /// Code subdirectories compiled separately, in configuration order.
    pub code_subdirectories: Vec<VirtualPath>,
    /// Application-wide resources.
    pub global_resources: VirtualPath,
    /// Folder name used for per-directory local resources.
    pub local_resources: String,
    /// Web service references.
    pub web_references: VirtualPath,
    /// Themes.
    pub themes: VirtualPath,
    /// Prebuilt assemblies.
    pub bin: VirtualPath,
    /// The global initialization file.
    pub global_file: VirtualPath,
}

impl DirectoryLayout {
    /// Resolves the layout for `config`.
    pub fn resolve(config: &KilnConfig) -> Result<Self, ConfigError> {
        let dirs = &config.directories;
        let dir = |field: &str, value: &str| {
            VirtualPath::directory(value).map_err(|source| ConfigError::InvalidPath {
                field: format!("directories.{field}"),
                source,
            })
        };

        let code = dir("code", &dirs.code)?;
        let code_subdirectories = dirs
            .code_subdirectories
            .iter()
            .map(|sub| {
                code.join(&format!("{sub}/"))
                    .map_err(|source| ConfigError::InvalidPath {
                        field: "directories.code_subdirectories".to_string(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(sub) = code_subdirectories
            .iter()
            .find(|s| **s == code || !s.is_within(&code))
        {
            return Err(ConfigError::ValidationError(format!(
                "code subdirectory '{sub}' must lie strictly inside '{code}'"
            )));
        }

        let global_file = VirtualPath::file(&config.application.global_file).map_err(|source| {
            ConfigError::InvalidPath {
                field: "application.global_file".to_string(),
                source,
            }
        })?;

        Ok(Self {
            global_resources: dir("global_resources", &dirs.global_resources)?,
            local_resources: dirs.local_resources.clone(),
            web_references: dir("web_references", &dirs.web_references)?,
            themes: dir("themes", &dirs.themes)?,
            bin: dir("bin", &dirs.bin)?,
            code,
            code_subdirectories,
            global_file,
        })
    }

    /// Returns `true` if `path` lies inside a directory whose contents are
    /// never served as individual units.
    pub fn is_forbidden(&self, path: &VirtualPath) -> bool {
        let roots = [
            &self.code,
            &self.global_resources,
            &self.web_references,
            &self.themes,
            &self.bin,
        ];
        if roots.iter().any(|root| path.is_within(root)) {
            return true;
        }
        path.segments()
            .any(|segment| segment.eq_ignore_ascii_case(&self.local_resources))
    }

    /// Returns the code subdirectory containing `path`, if any.
    pub fn code_subdirectory_of(&self, path: &VirtualPath) -> Option<&VirtualPath> {
        self.code_subdirectories.iter().find(|sub| path.is_within(sub))
    }
}
