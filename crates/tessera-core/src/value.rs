//! Dynamic values flowing through conditions, rows and coercion.

use std::fmt;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use indexmap::IndexMap;

/// A record, as an ordered column → value map.
pub type Row = IndexMap<String, Value>;

/// A backend-independent value.
///
/// `Regex` only has meaning inside a condition tree; rows never carry it.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Date(DateTime<Utc>),
    GeoPoint(GeoPoint),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
    Regex(Pattern),
}

/// A planar point, stored as `[x, y]` by backends without a native type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub x: f64,
    pub y: f64,
}

impl GeoPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A regular expression literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub source: String,
    pub case_insensitive: bool,
}

impl Pattern {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            case_insensitive: false,
        }
    }

    /// The same pattern with case-insensitive matching requested.
    pub fn ignore_case(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    /// Source with an inline `(?i)` flag when matching is case-insensitive.
    pub fn inline_source(&self) -> String {
        if self.case_insensitive {
            format!("(?i){}", self.source)
        } else {
            self.source.clone()
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.source)?;
        if self.case_insensitive {
            write!(f, "i")?;
        }
        Ok(())
    }
}

/// Identifier handed out by a backend on insert.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordId {
    /// Auto-increment key (SQL, key-value)
    Integer(i64),
    /// 24-character hexadecimal object id (document stores)
    ObjectId(String),
}

impl RecordId {
    /// Interpret a row value as an id, if it has an id shape.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(i) => Some(Self::Integer(*i)),
            Value::String(s) if is_object_id(s) => Some(Self::ObjectId(s.to_ascii_lowercase())),
            Value::String(s) => s.parse().ok().map(Self::Integer),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::ObjectId(_) => None,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::ObjectId(hex) => f.write_str(hex),
        }
    }
}

impl From<RecordId> for Value {
    fn from(id: RecordId) -> Self {
        match id {
            RecordId::Integer(i) => Value::Integer(i),
            RecordId::ObjectId(hex) => Value::String(hex),
        }
    }
}

/// Whether `s` looks like a 24-hex object id.
pub fn is_object_id(s: &str) -> bool {
    s.len() == 24 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl Value {
    /// Build a regex literal for condition trees.
    pub fn regex(source: impl Into<String>) -> Self {
        Value::Regex(Pattern::new(source))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Consume an object value into a row.
    pub fn into_row(self) -> Option<Row> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Short type name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::GeoPoint(_) => "geopoint",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Regex(_) => "regex",
        }
    }

    /// Scalar rendered as text, as used for pattern operands and string storage.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Date(d) => Some(format_timestamp(d)),
            _ => None,
        }
    }

    /// JSON rendering, used where a backend stores objects as text.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Integer(i) => Json::from(*i),
            Value::Number(n) => serde_json::Number::from_f64(*n).map_or(Json::Null, Json::Number),
            Value::String(s) => Json::String(s.clone()),
            Value::Date(d) => Json::String(format_timestamp(d)),
            Value::GeoPoint(p) => serde_json::json!([p.x, p.y]),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => Json::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            Value::Regex(pattern) => Json::String(pattern.to_string()),
        }
    }
}

/// RFC 3339 with millisecond precision, the text form used for stored dates.
pub fn format_timestamp(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored or user-supplied date string.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Date from epoch milliseconds.
pub fn timestamp_from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            Json::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

/// Build a row from a JSON object literal; anything else yields an empty row.
pub fn json_row(json: serde_json::Value) -> Row {
    Value::from(json).into_row().unwrap_or_default()
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(date: DateTime<Utc>) -> Self {
        Value::Date(date)
    }
}

impl From<GeoPoint> for Value {
    fn from(point: GeoPoint) -> Self {
        Value::GeoPoint(point)
    }
}

impl From<Pattern> for Value {
    fn from(pattern: Pattern) -> Self {
        Value::Regex(pattern)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Regex(pattern) => write!(f, "{pattern}"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}
