//! Per-backend connection settings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

/// Settings for one backend connection, tagged by backend family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BackendSettings {
    /// Embedded SQLite database.
    Sqlite(SqliteSettings),
    /// PostgreSQL server.
    #[serde(alias = "postgres")]
    Postgresql(PostgresSettings),
    /// MySQL server.
    Mysql(MySqlSettings),
    /// Mongo-style document store.
    #[serde(alias = "mongodb")]
    Document(DocumentSettings),
    /// Redis-style key-value store.
    #[serde(alias = "redis")]
    Keyvalue(KeyValueSettings),
}

impl BackendSettings {
    /// Short backend name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Postgresql(_) => "postgresql",
            Self::Mysql(_) => "mysql",
            Self::Document(_) => "document",
            Self::Keyvalue(_) => "keyvalue",
        }
    }

    /// Check required fields before a connect attempt.
    pub fn validate(&self) -> ConfigResult<()> {
        match self {
            Self::Sqlite(settings) => settings.validate(),
            Self::Postgresql(settings) => require_database(&settings.database),
            Self::Mysql(settings) => {
                require_database(&settings.database)?;
                if settings.pool_size == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: "pool_size".to_string(),
                        value: "0".to_string(),
                    });
                }
                Ok(())
            }
            Self::Document(settings) => require_database(&settings.database),
            Self::Keyvalue(settings) => {
                if settings.database > 15 {
                    return Err(ConfigError::InvalidValue {
                        field: "database".to_string(),
                        value: settings.database.to_string(),
                    });
                }
                Ok(())
            }
        }
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self::Sqlite(SqliteSettings::default())
    }
}

fn require_database(database: &str) -> ConfigResult<()> {
    if database.trim().is_empty() {
        return Err(ConfigError::MissingField {
            field: "database".to_string(),
        });
    }
    Ok(())
}

/// SQLite connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteSettings {
    /// Database file, or `:memory:`
    pub path: PathBuf,
    /// Enforce foreign keys (`PRAGMA foreign_keys`)
    pub foreign_keys: bool,
    /// Use write-ahead logging for file databases
    pub wal_mode: bool,
    /// Busy timeout in milliseconds
    pub busy_timeout_ms: u32,
}

impl SqliteSettings {
    /// Settings for a file database.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Settings for a private in-memory database.
    pub fn memory() -> Self {
        Self::new(":memory:")
    }

    /// Whether the path designates an in-memory database.
    pub fn is_memory(&self) -> bool {
        self.path.to_str() == Some(":memory:")
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::MissingField {
                field: "path".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for SqliteSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from(":memory:"),
            foreign_keys: true,
            wal_mode: true,
            busy_timeout_ms: 5000,
        }
    }
}

/// PostgreSQL connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: String,
    /// Size of the driver's pool
    pub pool_size: u32,
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: None,
            password: None,
            database: String::new(),
            pool_size: 10,
        }
    }
}

/// MySQL connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MySqlSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: String,
    /// Table character set used by `CREATE TABLE`
    pub charset: String,
    /// Table collation used by `CREATE TABLE`
    pub collation: String,
    /// Size of the driver's pool
    pub pool_size: u32,
}

impl Default for MySqlSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: None,
            password: None,
            database: String::new(),
            charset: "utf8".to_string(),
            collation: "utf8_unicode_ci".to_string(),
            pool_size: 10,
        }
    }
}

/// Document store connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: String,
    /// Size of the driver's pool
    pub pool_size: u32,
}

impl DocumentSettings {
    /// Connection URL in the `mongodb://` scheme.
    pub fn url(&self) -> String {
        match (&self.user, &self.password) {
            (None, None) => format!("mongodb://{}:{}/{}", self.host, self.port, self.database),
            (user, password) => format!(
                "mongodb://{}:{}@{}:{}/{}",
                user.as_deref().unwrap_or_default(),
                password.as_deref().unwrap_or_default(),
                self.host,
                self.port,
                self.database
            ),
        }
    }
}

impl Default for DocumentSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 27017,
            user: None,
            password: None,
            database: String::new(),
            pool_size: 10,
        }
    }
}

/// Key-value store connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyValueSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Logical database index
    pub database: u8,
}

impl Default for KeyValueSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            database: 0,
        }
    }
}
