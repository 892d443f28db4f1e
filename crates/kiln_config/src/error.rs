//! Error types for configuration loading and validation.

use kiln_common::PathError;

/// Errors that can occur when loading or validating a `kiln.toml` configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An I/O error occurred while reading the configuration file.
    #[error("failed to read configuration: {0}")]
    IoError(#[from] std::io::Error),

    /// The TOML content could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// A required field is missing from the configuration.
    #[error("missing required field: {0}")]
    MissingField(String),

    /// A configured directory or file is not a valid virtual path.
    #[error("invalid path in {field}: {source}")]
    InvalidPath {
        /// The configuration key holding the path.
        field: String,
        /// Why the path was rejected.
        source: PathError,
    },

    /// A configuration value failed validation.
    #[error("validation error: {0}")]
    ValidationError(String),
}
