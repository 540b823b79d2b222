//! Error types for the SQLite adapter

use thiserror::Error;

use tessera_core::normalize::SqliteErrors;
use tessera_core::{BackendFailure, ErrorNormalizer, StoreError};

/// SQLite adapter error type
#[derive(Error, Debug)]
pub enum SqliteError {
    /// Database connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// A value SQLite cannot store
    #[error("Unsupported value: {0}")]
    Unsupported(String),

    /// The engine answered, but not with what the statement promises
    #[error("Unexpected result: {0}")]
    Unexpected(String),

    /// The blocking task running the statement failed
    #[error("Task error: {0}")]
    Task(String),

    /// Underlying rusqlite error
    #[error("SQLite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
}

/// Result type for SQLite operations
pub type SqliteResult<T> = Result<T, SqliteError>;

impl From<tokio::task::JoinError> for SqliteError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

impl From<SqliteError> for StoreError {
    fn from(err: SqliteError) -> Self {
        match err {
            SqliteError::Connection(msg) => Self::ConnectionFailure(msg),
            SqliteError::Unsupported(msg) => Self::Unsupported(msg),
            SqliteError::Unexpected(msg) => Self::UnexpectedResult(msg),
            SqliteError::Task(msg) => Self::UnknownError(msg),
            SqliteError::Rusqlite(rusqlite::Error::SqliteFailure(failure, message)) => {
                let message = message.unwrap_or_else(|| failure.to_string());
                SqliteErrors.normalize(&BackendFailure::new(failure.extended_code.to_string(), message))
            }
            SqliteError::Rusqlite(e) => Self::UnknownError(e.to_string()),
        }
    }
}
