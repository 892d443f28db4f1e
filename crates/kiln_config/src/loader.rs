//! Configuration file loading and validation.

use crate::error::ConfigError;
use crate::layout::DirectoryLayout;
use crate::types::KilnConfig;
use std::path::Path;

/// The configuration file name expected at the application root.
pub const CONFIG_FILE_NAME: &str = "kiln.toml";

/// Loads and validates `kiln.toml` from a physical application root.
pub fn load_config(app_root: &Path) -> Result<KilnConfig, ConfigError> {
    let content = std::fs::read_to_string(app_root.join(CONFIG_FILE_NAME))?;
    load_config_from_str(&content)
}

/// Parses and validates a `kiln.toml` configuration from a string.
pub fn load_config_from_str(content: &str) -> Result<KilnConfig, ConfigError> {
    let config: KilnConfig =
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Validates required fields, limits, and that every configured path resolves.
pub fn validate_config(config: &KilnConfig) -> Result<(), ConfigError> {
    if config.application.name.trim().is_empty() {
        return Err(ConfigError::MissingField("application.name".to_string()));
    }
    if config.compilation.compiler.trim().is_empty() {
        return Err(ConfigError::MissingField("compilation.compiler".to_string()));
    }
    if config.batch.max_units == 0 {
        return Err(ConfigError::ValidationError(
            "batch.max_units must be at least 1".to_string(),
        ));
    }
    if config.batch.max_source_size == 0 {
        return Err(ConfigError::ValidationError(
            "batch.max_source_size must be at least 1".to_string(),
        ));
    }
    if config.cache.dir.trim().is_empty() || Path::new(&config.cache.dir).is_absolute() {
        return Err(ConfigError::ValidationError(format!(
            "cache.dir '{}' must be a non-empty relative path",
            config.cache.dir
        )));
    }
    if config.cache.unload_poll_ms == 0 {
        return Err(ConfigError::ValidationError(
            "cache.unload_poll_ms must be at least 1".to_string(),
        ));
    }
    if let Some(ext) = config.extensions.keys().find(|e| !e.starts_with('.')) {
        return Err(ConfigError::ValidationError(format!(
            "extension '{ext}' must start with '.'"
        )));
    }
    let assemblies = &config.assemblies;
    if let Some(both) = assemblies
        .add
        .iter()
        .find(|a| assemblies.remove.iter().any(|r| r.eq_ignore_ascii_case(a)))
    {
        return Err(ConfigError::ValidationError(format!(
            "assembly '{both}' is both added and removed"
        )));
    }
    DirectoryLayout::resolve(config)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParseErrorPolicy;

    #[test]
    fn parse_minimal_config() {
        let toml = r#"
[application]
name = "storefront"

[compilation]
compiler = "csharp"
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.application.name, "storefront");
        assert_eq!(config.application.global_file, "global.asax");
        assert_eq!(config.compilation.num_recompiles_before_restart, 15);
        assert_eq!(config.compilation.parse_errors, ParseErrorPolicy::FailFast);
        assert!(config.batch.enabled);
        assert_eq!(config.cache.dir, ".kiln");
        assert_eq!(config.directories.code, "App_Code");
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[application]
name = "storefront"
global_file = "Global.asax"

[compilation]
compiler = "csharp"
options = ["/optimize+", "/warn:4"]
debug = true
num_recompiles_before_restart = 3
parse_errors = "collect"
fixed_names = true

[batch]
enabled = false
max_units = 50
max_source_size = 4096

[cache]
dir = "obj/kiln"
keep_top_level_in_memory = false
unload_timeout_ms = 200
unload_poll_ms = 5

[directories]
code = "src"
code_subdirectories = ["vb"]
bin = "lib"

[assemblies]
add = ["System.Web"]
remove = ["System.Legacy"]
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.compilation.options.len(), 2);
        assert!(config.compilation.debug);
        assert_eq!(config.compilation.num_recompiles_before_restart, 3);
        assert!(!config.batching_enabled());
        assert_eq!(config.batch.max_units, 50);
        assert!(!config.cache.keep_top_level_in_memory);
        assert_eq!(config.cache.unload_timeout().as_millis(), 200);
        assert_eq!(config.directories.code_subdirectories, vec!["vb"]);
        assert_eq!(config.directories.themes, "App_Themes");
        assert_eq!(config.assemblies.remove, vec!["System.Legacy"]);
    }

    #[test]
    fn missing_name_errors() {
        let toml = r#"
[application]
name = ""

[compilation]
compiler = "csharp"
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "application.name"));
    }

    #[test]
    fn missing_compiler_errors() {
        let toml = r#"
[application]
name = "x"

[compilation]
compiler = " "
"#;
        let err = load_config_from_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }

    #[test]
    fn invalid_toml_errors() {
        let err = load_config_from_str("this is not valid toml {{{}}}").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn unknown_policy_is_a_parse_error() {
        let toml = r#"
[application]
name = "x"

[compilation]
compiler = "csharp"
parse_errors = "sometimes"
"#;
        assert!(matches!(
            load_config_from_str(toml),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn zero_batch_limit_rejected() {
        let mut config = KilnConfig::default_for("x");
        config.batch.max_units = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn absolute_cache_dir_rejected() {
        let mut config = KilnConfig::default_for("x");
        config.cache.dir = "/var/cache/kiln".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn conflicting_assembly_lists_rejected() {
        let mut config = KilnConfig::default_for("x");
        config.assemblies.add = vec!["System.Web".to_string()];
        config.assemblies.remove = vec!["system.web".to_string()];
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn extension_without_dot_rejected() {
        let mut config = KilnConfig::default_for("x");
        config
            .extensions
            .insert("page".to_string(), crate::types::SourceKindSetting::Page);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn default_for_is_valid() {
        validate_config(&KilnConfig::default_for("embedded")).unwrap();
    }

    #[test]
    fn load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[application]\nname = \"disk\"\n[compilation]\ncompiler = \"vb\"\n",
        )
        .unwrap();
        let config = load_config(dir.path()).unwrap();
        assert_eq!(config.application.name, "disk");
        assert_eq!(config.compilation.compiler, "vb");
    }

    #[test]
    fn io_error_from_nonexistent_dir() {
        let err = load_config(Path::new("/nonexistent/dir")).unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }
}
