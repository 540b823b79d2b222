//! SQLite connection management
//!
//! Uses a simple Arc<Mutex<Connection>> pattern: SQLite allows one writer at
//! a time anyway, and every statement runs inside `spawn_blocking`.

use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;
use tracing::{debug, info};

use tessera_config::SqliteSettings;

use crate::error::{SqliteError, SqliteResult};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Thread-safe SQLite connection wrapper
#[derive(Clone)]
pub struct SqlitePool {
    conn: Arc<Mutex<Connection>>,
    settings: SqliteSettings,
}

impl SqlitePool {
    /// Open the database described by `settings`
    pub fn new(settings: SqliteSettings) -> SqliteResult<Self> {
        info!(path = ?settings.path, "Opening SQLite database");

        let conn = if settings.is_memory() {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = settings.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SqliteError::Connection(format!("Failed to create directory: {}", e))
                })?;
            }
            Connection::open(&settings.path)?
        };

        let pool = Self {
            conn: Arc::new(Mutex::new(conn)),
            settings,
        };
        pool.initialize()?;
        Ok(pool)
    }

    /// Private in-memory database
    pub fn memory() -> SqliteResult<Self> {
        Self::new(SqliteSettings::memory())
    }

    pub fn settings(&self) -> &SqliteSettings {
        &self.settings
    }

    /// Execute a closure with the connection
    pub fn with_connection<F, T>(&self, f: F) -> SqliteResult<T>
    where
        F: FnOnce(&Connection) -> SqliteResult<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a closure with mutable access to the connection
    pub fn with_connection_mut<F, T>(&self, f: F) -> SqliteResult<T>
    where
        F: FnOnce(&mut Connection) -> SqliteResult<T>,
    {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }

    fn initialize(&self) -> SqliteResult<()> {
        self.with_connection(|conn| {
            self.configure_pragmas(conn)?;
            register_functions(conn)?;
            debug!("SQLite connection initialized");
            Ok(())
        })
    }

    fn configure_pragmas(&self, conn: &Connection) -> SqliteResult<()> {
        debug!("Configuring SQLite pragmas");

        // WAL has no effect on in-memory databases
        if self.settings.wal_mode && !self.settings.is_memory() {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        }

        let foreign_keys = if self.settings.foreign_keys { "ON" } else { "OFF" };
        conn.execute_batch(&format!("PRAGMA foreign_keys = {};", foreign_keys))?;

        conn.execute_batch(&format!(
            "PRAGMA busy_timeout = {};",
            self.settings.busy_timeout_ms
        ))?;

        conn.execute_batch("PRAGMA temp_store = MEMORY;")?;

        Ok(())
    }
}

/// `value REGEXP pattern` calls `regexp(pattern, value)`.
///
/// Compiled patterns are cached per statement; `NULL` never matches.
fn register_functions(conn: &Connection) -> SqliteResult<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let regex: Arc<Regex> =
                ctx.get_or_create_aux(0, |pattern| -> Result<Regex, BoxError> {
                    Ok(Regex::new(pattern.as_str()?)?)
                })?;
            let text: Option<String> = ctx.get(1)?;
            Ok(text.is_some_and(|text| regex.is_match(&text)))
        },
    )?;
    Ok(())
}
