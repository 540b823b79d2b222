//! # Tessera Configuration
//!
//! Connection settings for every backend tessera can talk to.
//!
//! ## Features
//!
//! - Multi-format support (TOML, YAML, JSON), selected by file extension
//! - One tagged settings enum per backend family with the drivers' usual defaults
//! - Validation of required fields before any connect attempt
//!
//! ## Quick Start
//!
//! ```rust
//! use tessera_config::{BackendSettings, StoreConfig};
//!
//! let config = StoreConfig::from_toml_str(
//!     r#"
//!     [backend]
//!     backend = "sqlite"
//!     path = ":memory:"
//!     "#,
//! )
//! .unwrap();
//!
//! assert!(matches!(config.backend, BackendSettings::Sqlite(_)));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod backend;
mod loader;

pub use backend::*;
pub use loader::*;

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read {path}: {message}")]
    Io {
        /// Path that failed to load
        path: String,
        /// Underlying I/O message
        message: String,
    },

    /// The file content could not be parsed.
    #[error("Failed to parse {format} configuration: {message}")]
    Parse {
        /// Format that was attempted (toml, yaml, json)
        format: &'static str,
        /// Parser message
        message: String,
    },

    /// The file extension does not map to a known format.
    #[error("Unsupported configuration format: {0}")]
    UnsupportedFormat(String),

    /// A required field is missing.
    #[error("Missing required field: {field}")]
    MissingField {
        /// The name of the missing field
        field: String,
    },

    /// A field carries a value outside its domain.
    #[error("Invalid value for {field}: {value}")]
    InvalidValue {
        /// The offending field
        field: String,
        /// The rejected value
        value: String,
    },
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
