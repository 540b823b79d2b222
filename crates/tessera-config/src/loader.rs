//! Loading configuration files.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{BackendSettings, ConfigError, ConfigResult};

/// Top-level configuration document.
///
/// ```toml
/// [backend]
/// backend = "mysql"
/// database = "app"
/// charset = "utf8mb4"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Connection settings for the selected backend
    pub backend: BackendSettings,
    /// Log every generated statement at debug level
    pub log_queries: bool,
}

impl StoreConfig {
    /// Parse a TOML document.
    #[cfg(feature = "toml")]
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            format: "toml",
            message: e.to_string(),
        })?;
        config.backend.validate()?;
        Ok(config)
    }

    /// Parse a YAML document.
    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            format: "yaml",
            message: e.to_string(),
        })?;
        config.backend.validate()?;
        Ok(config)
    }

    /// Parse a JSON document.
    pub fn from_json_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(content).map_err(|e| ConfigError::Parse {
            format: "json",
            message: e.to_string(),
        })?;
        config.backend.validate()?;
        Ok(config)
    }

    /// Load a configuration file, picking the format from its extension.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        debug!(path = %path.display(), format = %extension, "Loading store configuration");

        match extension.as_str() {
            #[cfg(feature = "toml")]
            "toml" => Self::from_toml_str(&content),
            #[cfg(feature = "yaml")]
            "yaml" | "yml" => Self::from_yaml_str(&content),
            "json" => Self::from_json_str(&content),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }
}
