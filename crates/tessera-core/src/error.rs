//! Canonical error taxonomy
//!
//! Every failure that crosses an adapter boundary is one of these kinds.
//! Backend errors reach it only through an [`ErrorNormalizer`](crate::normalize::ErrorNormalizer).

use std::fmt;

use thiserror::Error;

use crate::adapter::ConnectionState;

/// Error type for every adapter and translator operation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("duplicated {0}")]
    DuplicateKey(String),

    #[error("'{0}' is required")]
    ColumnRequired(String),

    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("'{0}' is not a valid id")]
    InvalidId(String),

    #[error("rejected by a foreign key reference")]
    IntegrityViolation,

    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    #[error("table '{0}' does not exist")]
    TableNotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid condition: {0}")]
    InvalidCondition(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("validation failed: {}", join_field_errors(.0))]
    Validation(Vec<FieldError>),

    #[error("unexpected result: {0}")]
    UnexpectedResult(String),

    #[error("adapter is not connected (state: {0})")]
    NotConnected(ConnectionState),

    #[error("unknown error: {0}")]
    UnknownError(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    pub fn invalid_condition(reason: impl Into<String>) -> Self {
        Self::InvalidCondition(reason.into())
    }

    pub fn invalid_schema(reason: impl Into<String>) -> Self {
        Self::InvalidSchema(reason.into())
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::UnknownError(message.into())
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateKey(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// One column that failed validation, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub reason: FieldErrorKind,
}

impl FieldError {
    pub fn new(field: impl Into<String>, reason: FieldErrorKind) -> Self {
        Self {
            field: field.into(),
            reason,
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' {}", self.field, self.reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldErrorKind {
    NotAString,
    NotANumber,
    NotAnInteger,
    NotABoolean,
    NotADate,
    NotAGeoPoint,
    NotAnArray,
    NotAnObject,
    NotAnId,
    IncrementNotAllowed,
    IncrementOnNonNumeric,
}

impl fmt::Display for FieldErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotAString => "is not a string",
            Self::NotANumber => "is not a number",
            Self::NotAnInteger => "is not an integer",
            Self::NotABoolean => "is not a boolean",
            Self::NotADate => "is not a date",
            Self::NotAGeoPoint => "is not a geo point",
            Self::NotAnArray => "is not an array",
            Self::NotAnObject => "is not an object",
            Self::NotAnId => "is not a valid id",
            Self::IncrementNotAllowed => "cannot be incremented on create",
            Self::IncrementOnNonNumeric => "cannot be incremented, not a numeric column",
        };
        f.write_str(text)
    }
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_every_field() {
        let err = StoreError::Validation(vec![
            FieldError::new("age", FieldErrorKind::NotAnInteger),
            FieldError::new("active", FieldErrorKind::NotABoolean),
        ]);

        assert_eq!(
            err.to_string(),
            "validation failed: 'age' is not an integer, 'active' is not a boolean"
        );
    }

    #[test]
    fn test_taxonomy_messages() {
        assert_eq!(StoreError::InvalidId("id".into()).to_string(), "'id' is not a valid id");
        assert_eq!(StoreError::DuplicateKey("email".into()).to_string(), "duplicated email");
        assert!(StoreError::DuplicateKey("email".into()).is_duplicate());
    }
}
