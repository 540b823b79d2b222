//! Error normalizer
//!
//! Maps backend-native failure signals onto [`StoreError`]. Drivers describe
//! a failure as a [`BackendFailure`] (native code plus message); each backend
//! family has a normalizer that recognizes its codes and message shapes.
//! Anything unrecognized becomes [`StoreError::UnknownError`] carrying the
//! original message.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::error::StoreError;

/// A failure reported by a backend driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendFailure {
    /// Native code as text (`23505`, `ER_DUP_ENTRY`, `2067`, `11000`, ...)
    pub code: String,
    pub message: String,
    /// Table the failing statement addressed, when known
    pub table: Option<String>,
}

impl BackendFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            table: None,
        }
    }

    pub fn on_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

/// Maps one backend family's failures onto the canonical taxonomy.
pub trait ErrorNormalizer: Send + Sync {
    fn normalize(&self, failure: &BackendFailure) -> StoreError;
}

fn capture(regex: &Regex, message: &str) -> Option<String> {
    regex
        .captures(message)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}

fn unknown(failure: &BackendFailure) -> StoreError {
    debug!(code = %failure.code, message = %failure.message, "Unrecognized backend failure");
    StoreError::UnknownError(failure.message.clone())
}

static QUOTED_CONSTRAINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"unique constraint "([^"]+)""#).expect("valid regex"));
static QUOTED_COLUMN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"column "([^"]+)""#).expect("valid regex"));
static QUOTED_RELATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"relation "([^"]+)""#).expect("valid regex"));

/// PostgreSQL SQLSTATE codes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresErrors;

impl ErrorNormalizer for PostgresErrors {
    fn normalize(&self, failure: &BackendFailure) -> StoreError {
        let message = failure.message.as_str();
        match failure.code.as_str() {
            "42P01" => StoreError::TableNotFound(
                capture(&QUOTED_RELATION, message)
                    .or_else(|| failure.table.clone())
                    .unwrap_or_default(),
            ),
            "42703" => StoreError::UnknownColumn(capture(&QUOTED_COLUMN, message).unwrap_or_default()),
            "23505" => {
                let constraint = capture(&QUOTED_CONSTRAINT, message).unwrap_or_default();
                StoreError::DuplicateKey(postgres_key_column(&constraint, failure.table.as_deref()))
            }
            "23502" => StoreError::ColumnRequired(capture(&QUOTED_COLUMN, message).unwrap_or_default()),
            "23503" => StoreError::IntegrityViolation,
            "3D000" | "28P01" | "57P01" => StoreError::ConnectionFailure(failure.message.clone()),
            code if code.starts_with("08") || code == "ECONNREFUSED" => {
                StoreError::ConnectionFailure(failure.message.clone())
            }
            _ => unknown(failure),
        }
    }
}

/// `users_email_key` → `email`.
fn postgres_key_column(constraint: &str, table: Option<&str>) -> String {
    let trimmed = constraint.strip_suffix("_key").unwrap_or(constraint);
    match table.and_then(|table| trimmed.strip_prefix(&format!("{table}_"))) {
        Some(column) => column.to_string(),
        None => trimmed.to_string(),
    }
}

static MYSQL_DUP_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"for key '(?:[^'.]*\.)?([^']+)'").expect("valid regex"));
static MYSQL_COLUMN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[Cc]olumn '([^']+)'").expect("valid regex"));
static MYSQL_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Table '(?:[^'.]*\.)?([^']+)' doesn't exist").expect("valid regex"));

/// MySQL symbolic error codes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlErrors;

impl ErrorNormalizer for MySqlErrors {
    fn normalize(&self, failure: &BackendFailure) -> StoreError {
        let message = failure.message.as_str();
        match failure.code.as_str() {
            "ER_NO_SUCH_TABLE" => StoreError::TableNotFound(
                capture(&MYSQL_TABLE, message)
                    .or_else(|| failure.table.clone())
                    .unwrap_or_default(),
            ),
            "ER_DUP_ENTRY" => StoreError::DuplicateKey(capture(&MYSQL_DUP_KEY, message).unwrap_or_default()),
            "ER_BAD_NULL_ERROR" | "ER_NO_DEFAULT_FOR_FIELD" => {
                StoreError::ColumnRequired(capture(&MYSQL_COLUMN, message).unwrap_or_default())
            }
            "ER_BAD_FIELD_ERROR" => StoreError::UnknownColumn(capture(&MYSQL_COLUMN, message).unwrap_or_default()),
            "ER_ROW_IS_REFERENCED" | "ER_ROW_IS_REFERENCED_2" | "ER_NO_REFERENCED_ROW_2" => {
                StoreError::IntegrityViolation
            }
            "ER_BAD_DB_ERROR" | "ER_DBACCESS_DENIED_ERROR" | "ER_ACCESS_DENIED_ERROR" | "ECONNREFUSED" => {
                StoreError::ConnectionFailure(failure.message.clone())
            }
            _ => unknown(failure),
        }
    }
}

static SQLITE_CONSTRAINT_COLUMN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"constraint failed: (?:[^.,\s]+\.)?([^,\s]+)").expect("valid regex"));
static SQLITE_NO_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"no such table: (?:[^.\s]+\.)?(\S+)").expect("valid regex"));
static SQLITE_NO_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:no such column: |has no column named )(?:[^.\s]+\.)?(\S+)").expect("valid regex")
});

/// SQLite extended result codes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteErrors;

impl SqliteErrors {
    const CONSTRAINT_FOREIGNKEY: &'static str = "787";
    /// `ON DELETE RESTRICT` fires as a trigger constraint.
    const CONSTRAINT_TRIGGER: &'static str = "1811";
    const CONSTRAINT_NOTNULL: &'static str = "1299";
    const CONSTRAINT_PRIMARYKEY: &'static str = "1555";
    const CONSTRAINT_UNIQUE: &'static str = "2067";
    const CANTOPEN: &'static str = "14";
}

impl ErrorNormalizer for SqliteErrors {
    fn normalize(&self, failure: &BackendFailure) -> StoreError {
        let message = failure.message.as_str();
        match failure.code.as_str() {
            Self::CONSTRAINT_UNIQUE => {
                StoreError::DuplicateKey(capture(&SQLITE_CONSTRAINT_COLUMN, message).unwrap_or_default())
            }
            Self::CONSTRAINT_PRIMARYKEY => StoreError::DuplicateKey("id".to_string()),
            Self::CONSTRAINT_NOTNULL => {
                StoreError::ColumnRequired(capture(&SQLITE_CONSTRAINT_COLUMN, message).unwrap_or_default())
            }
            Self::CONSTRAINT_FOREIGNKEY => StoreError::IntegrityViolation,
            Self::CONSTRAINT_TRIGGER if message.contains("FOREIGN KEY constraint failed") => {
                StoreError::IntegrityViolation
            }
            Self::CANTOPEN => StoreError::ConnectionFailure(failure.message.clone()),
            _ => {
                if let Some(table) = capture(&SQLITE_NO_TABLE, message) {
                    StoreError::TableNotFound(table)
                } else if let Some(column) = capture(&SQLITE_NO_COLUMN, message) {
                    StoreError::UnknownColumn(column)
                } else {
                    unknown(failure)
                }
            }
        }
    }
}

static DOCUMENT_DUP_INDEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"index: (?:[\w.\-]+\$)?([\w.\-]+?)(?:_-?1)*\s+dup key").expect("valid regex"));

/// Document store numeric codes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentErrors;

impl ErrorNormalizer for DocumentErrors {
    fn normalize(&self, failure: &BackendFailure) -> StoreError {
        match failure.code.as_str() {
            "11000" | "11001" => {
                StoreError::DuplicateKey(capture(&DOCUMENT_DUP_INDEX, &failure.message).unwrap_or_default())
            }
            "26" => StoreError::TableNotFound(failure.table.clone().unwrap_or_default()),
            "6" | "89" | "ECONNREFUSED" => StoreError::ConnectionFailure(failure.message.clone()),
            _ => unknown(failure),
        }
    }
}

/// Key-value store failures; only connection problems are distinguished.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyValueErrors;

impl ErrorNormalizer for KeyValueErrors {
    fn normalize(&self, failure: &BackendFailure) -> StoreError {
        match failure.code.as_str() {
            "ECONNREFUSED" | "ECONNRESET" | "CONNECTION" | "NOAUTH" => {
                StoreError::ConnectionFailure(failure.message.clone())
            }
            _ => unknown(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("23505", r#"duplicate key value violates unique constraint "users_email_key""#, StoreError::DuplicateKey("email".into()) ; "duplicate")]
    #[test_case("23502", r#"null value in column "name" of relation "users" violates not-null constraint"#, StoreError::ColumnRequired("name".into()) ; "not null")]
    #[test_case("42P01", r#"relation "users" does not exist"#, StoreError::TableNotFound("users".into()) ; "missing table")]
    #[test_case("23503", "update or delete on table violates foreign key constraint", StoreError::IntegrityViolation ; "foreign key")]
    #[test_case("3D000", r#"database "app" does not exist"#, StoreError::ConnectionFailure(r#"database "app" does not exist"#.into()) ; "missing database")]
    fn test_postgres(code: &str, message: &str, expected: StoreError) {
        let failure = BackendFailure::new(code, message).on_table("users");

        assert_eq!(PostgresErrors.normalize(&failure), expected);
    }

    #[test_case("ER_DUP_ENTRY", "Duplicate entry 'a@b.c' for key 'email'", StoreError::DuplicateKey("email".into()) ; "duplicate")]
    #[test_case("ER_DUP_ENTRY", "Duplicate entry 'a@b.c' for key 'users.email'", StoreError::DuplicateKey("email".into()) ; "qualified duplicate")]
    #[test_case("ER_BAD_NULL_ERROR", "Column 'name' cannot be null", StoreError::ColumnRequired("name".into()) ; "not null")]
    #[test_case("ER_NO_SUCH_TABLE", "Table 'app.users' doesn't exist", StoreError::TableNotFound("users".into()) ; "missing table")]
    #[test_case("ER_BAD_FIELD_ERROR", "Unknown column 'nope' in 'field list'", StoreError::UnknownColumn("nope".into()) ; "unknown column")]
    #[test_case("ER_ROW_IS_REFERENCED_2", "Cannot delete or update a parent row", StoreError::IntegrityViolation ; "referenced")]
    fn test_mysql(code: &str, message: &str, expected: StoreError) {
        assert_eq!(MySqlErrors.normalize(&BackendFailure::new(code, message)), expected);
    }

    #[test_case("2067", "UNIQUE constraint failed: users.email", StoreError::DuplicateKey("email".into()) ; "unique")]
    #[test_case("2067", "UNIQUE constraint failed: users.first, users.last", StoreError::DuplicateKey("first".into()) ; "composite unique")]
    #[test_case("1555", "UNIQUE constraint failed: users.id", StoreError::DuplicateKey("id".into()) ; "primary key")]
    #[test_case("1299", "NOT NULL constraint failed: users.name", StoreError::ColumnRequired("name".into()) ; "not null")]
    #[test_case("787", "FOREIGN KEY constraint failed", StoreError::IntegrityViolation ; "foreign key")]
    #[test_case("1811", "FOREIGN KEY constraint failed", StoreError::IntegrityViolation ; "restricted delete")]
    #[test_case("1811", "cannot archive", StoreError::UnknownError("cannot archive".to_string()) ; "other trigger")]
    #[test_case("1", "no such table: users", StoreError::TableNotFound("users".into()) ; "missing table")]
    #[test_case("1", "table users has no column named nope", StoreError::UnknownColumn("nope".into()) ; "unknown column")]
    #[test_case("1", "near \"SELEC\": syntax error", StoreError::UnknownError("near \"SELEC\": syntax error".into()) ; "unrecognized")]
    fn test_sqlite(code: &str, message: &str, expected: StoreError) {
        assert_eq!(SqliteErrors.normalize(&BackendFailure::new(code, message)), expected);
    }

    #[test_case("E11000 duplicate key error collection: app.users index: email_1 dup key: { email: \"a\" }", "email" ; "modern message")]
    #[test_case("E11000 duplicate key error index: app.users.$email_1  dup key: { : \"a\" }", "email" ; "legacy message")]
    #[test_case("E11000 duplicate key error collection: app.users index: email dup key: { email: \"a\" }", "email" ; "named index")]
    fn test_document_duplicate(message: &str, column: &str) {
        assert_eq!(
            DocumentErrors.normalize(&BackendFailure::new("11000", message)),
            StoreError::DuplicateKey(column.to_string())
        );
    }

    #[test]
    fn test_keyvalue_connection_refused() {
        let failure = BackendFailure::new("ECONNREFUSED", "connect ECONNREFUSED 127.0.0.1:6379");

        assert!(matches!(
            KeyValueErrors.normalize(&failure),
            StoreError::ConnectionFailure(_)
        ));
        assert!(matches!(
            KeyValueErrors.normalize(&BackendFailure::new("ERR", "wrong type")),
            StoreError::UnknownError(message) if message == "wrong type"
        ));
    }
}
