//! Parsing and validation of `kiln.toml` application configuration.
//!
//! This crate reads the application's build configuration and produces a
//! strongly-typed [`KilnConfig`], along with the resolved special-directory
//! [`DirectoryLayout`] and the semantic hash that invalidates cached
//! artifacts when compiler-relevant settings change.

#![warn(missing_docs)]

pub mod error;
pub mod layout;
pub mod loader;
pub mod types;

pub use error::ConfigError;
pub use layout::DirectoryLayout;
pub use loader::{load_config, load_config_from_str, validate_config, CONFIG_FILE_NAME};
pub use types::*;
