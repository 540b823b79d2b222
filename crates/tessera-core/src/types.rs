//! Logical column types and backend capabilities.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Declared type of a column, independent of any backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalType {
    /// Bounded string; `None` uses the backend default length
    String { max_len: Option<u32> },
    /// Double precision float
    Number,
    /// 32-bit signed integer
    Integer,
    Boolean,
    Date,
    GeoPoint,
    /// Arbitrary JSON value
    Object,
    /// Unbounded string
    Text,
    /// Opaque id of another record in the same backend
    RecordId,
}

impl LogicalType {
    pub const STRING: Self = Self::String { max_len: None };

    pub fn name(&self) -> &'static str {
        match self {
            Self::String { .. } => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::GeoPoint => "geopoint",
            Self::Object => "object",
            Self::Text => "text",
            Self::RecordId => "recordid",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Number | Self::Integer)
    }

    pub fn is_textual(&self) -> bool {
        matches!(self, Self::String { .. } | Self::Text)
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String { max_len: Some(len) } => write!(f, "string({len})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Family a backend belongs to; selects the coercion rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendFamily {
    Sql,
    Document,
    KeyValue,
}

/// What a connected backend can store and evaluate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub family: BackendFamily,
    /// Logical type of the implicit `id` column
    pub key_type: LogicalType,
    pub geo_point: bool,
    pub regex: bool,
    /// Upsert is a single native operation
    pub native_upsert: bool,
    /// Unique and foreign key constraints are enforced by the backend
    pub constraints: bool,
    /// Conditions beyond id equality and membership can be evaluated
    pub filtering: bool,
}

impl Capabilities {
    pub fn sqlite() -> Self {
        Self {
            family: BackendFamily::Sql,
            key_type: LogicalType::Integer,
            geo_point: false,
            regex: true,
            native_upsert: false,
            constraints: true,
            filtering: true,
        }
    }

    pub fn postgres() -> Self {
        Self {
            geo_point: true,
            ..Self::sqlite()
        }
    }

    pub fn mysql() -> Self {
        Self {
            geo_point: true,
            native_upsert: true,
            ..Self::sqlite()
        }
    }

    pub fn document() -> Self {
        Self {
            family: BackendFamily::Document,
            key_type: LogicalType::RecordId,
            geo_point: true,
            regex: true,
            native_upsert: true,
            constraints: false,
            filtering: true,
        }
    }

    pub fn key_value() -> Self {
        Self {
            family: BackendFamily::KeyValue,
            key_type: LogicalType::Integer,
            geo_point: false,
            regex: false,
            native_upsert: false,
            constraints: false,
            filtering: false,
        }
    }

    /// Whether a column of this type can be stored.
    pub fn supports(&self, ty: LogicalType, is_array: bool) -> bool {
        match ty {
            LogicalType::GeoPoint => self.geo_point && !is_array,
            _ => true,
        }
    }
}
