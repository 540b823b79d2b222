use chrono::{DateTime, Utc};

use super::{from_json_text, json_text, normalize_scalar, TypeCodec};
use crate::error::FieldErrorKind;
use crate::schema::Property;
use crate::types::{BackendFamily, LogicalType};
use crate::value::{parse_timestamp, timestamp_from_millis, GeoPoint, Value};

/// A statement parameter or column value of a SQL backend.
///
/// Drivers bind the typed variants in whatever form their engine expects;
/// values read back usually arrive as `Integer`, `Real`, `Text` or `Null`.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    /// Serialized JSON document
    Json(String),
    Point(GeoPoint),
}

impl SqlValue {
    /// Plain conversion used for aggregate and explain output.
    pub fn into_value(self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Integer(i) => Value::Integer(i),
            Self::Real(n) => Value::Number(n),
            Self::Text(s) | Self::Json(s) => Value::String(s),
            Self::Bool(b) => Value::Bool(b),
            Self::Timestamp(d) => Value::Date(d),
            Self::Point(p) => Value::GeoPoint(p),
        }
    }
}

/// Codec shared by every SQL dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlCodec;

impl SqlCodec {
    /// Convert a scalar of a known logical type.
    pub fn scalar_to_native(&self, ty: LogicalType, value: &Value) -> Result<SqlValue, FieldErrorKind> {
        Ok(match (ty, value) {
            (_, Value::Null) => SqlValue::Null,
            (LogicalType::String { .. } | LogicalType::Text, value) => {
                SqlValue::Text(value.to_text().ok_or(FieldErrorKind::NotAString)?)
            }
            (LogicalType::Number, value) => {
                SqlValue::Real(value.as_f64().ok_or(FieldErrorKind::NotANumber)?)
            }
            (LogicalType::Integer, value) => {
                SqlValue::Integer(value.as_i64().ok_or(FieldErrorKind::NotAnInteger)?)
            }
            (LogicalType::Boolean, Value::Bool(b)) => SqlValue::Bool(*b),
            (LogicalType::Boolean, _) => return Err(FieldErrorKind::NotABoolean),
            (LogicalType::Date, Value::Date(d)) => SqlValue::Timestamp(*d),
            (LogicalType::Date, _) => return Err(FieldErrorKind::NotADate),
            (LogicalType::GeoPoint, Value::GeoPoint(p)) => SqlValue::Point(*p),
            (LogicalType::GeoPoint, _) => return Err(FieldErrorKind::NotAGeoPoint),
            (LogicalType::Object, value) => SqlValue::Json(json_text(value)),
            (LogicalType::RecordId, value) => match value {
                Value::Integer(i) => SqlValue::Integer(*i),
                Value::String(s) => SqlValue::Integer(s.parse().map_err(|_| FieldErrorKind::NotAnId)?),
                _ => return Err(FieldErrorKind::NotAnId),
            },
        })
    }

    fn scalar_from_native(&self, ty: LogicalType, native: SqlValue) -> Result<Value, FieldErrorKind> {
        Ok(match (ty, native) {
            (_, SqlValue::Null) => Value::Null,
            (LogicalType::String { .. } | LogicalType::Text, SqlValue::Text(s) | SqlValue::Json(s)) => {
                Value::String(s)
            }
            (LogicalType::String { .. } | LogicalType::Text, other) => {
                normalize_scalar(ty, other.into_value())?
            }
            (LogicalType::Number, SqlValue::Real(n)) => Value::Number(n),
            (LogicalType::Number, SqlValue::Integer(i)) => Value::Number(i as f64),
            (LogicalType::Integer | LogicalType::RecordId, SqlValue::Integer(i)) => Value::Integer(i),
            (LogicalType::Boolean, SqlValue::Integer(i)) => Value::Bool(i != 0),
            (LogicalType::Boolean, SqlValue::Bool(b)) => Value::Bool(b),
            (LogicalType::Boolean, SqlValue::Text(s)) => match s.as_str() {
                "1" | "true" | "TRUE" => Value::Bool(true),
                "0" | "false" | "FALSE" => Value::Bool(false),
                _ => return Err(FieldErrorKind::NotABoolean),
            },
            (LogicalType::Date, SqlValue::Timestamp(d)) => Value::Date(d),
            (LogicalType::Date, SqlValue::Text(s)) => {
                Value::Date(parse_timestamp(&s).ok_or(FieldErrorKind::NotADate)?)
            }
            (LogicalType::Date, SqlValue::Integer(millis)) => {
                Value::Date(timestamp_from_millis(millis).ok_or(FieldErrorKind::NotADate)?)
            }
            (LogicalType::GeoPoint, SqlValue::Point(p)) => Value::GeoPoint(p),
            (LogicalType::GeoPoint, SqlValue::Text(s) | SqlValue::Json(s)) => {
                let json: serde_json::Value =
                    serde_json::from_str(&s).map_err(|_| FieldErrorKind::NotAGeoPoint)?;
                normalize_scalar(ty, json.into())?
            }
            (LogicalType::Object, SqlValue::Text(s) | SqlValue::Json(s)) => {
                let property = Property::new("", LogicalType::Object);
                from_json_text(&property, &s)
            }
            (LogicalType::Object, other) => other.into_value(),
            (ty, other) => normalize_scalar(ty, other.into_value())?,
        })
    }
}

impl TypeCodec for SqlCodec {
    type Native = SqlValue;

    fn family(&self) -> BackendFamily {
        BackendFamily::Sql
    }

    fn to_native(&self, property: &Property, value: &Value) -> Result<SqlValue, FieldErrorKind> {
        if value.is_null() {
            return Ok(SqlValue::Null);
        }
        if property.is_array {
            return match value {
                Value::Array(_) => Ok(SqlValue::Json(json_text(value))),
                _ => Err(FieldErrorKind::NotAnArray),
            };
        }
        self.scalar_to_native(property.logical_type, value)
    }

    fn from_native(&self, property: &Property, native: SqlValue) -> Result<Value, FieldErrorKind> {
        if property.is_array {
            return match native {
                SqlValue::Null => Ok(Value::Null),
                SqlValue::Text(s) | SqlValue::Json(s) => Ok(from_json_text(property, &s)),
                _ => Err(FieldErrorKind::NotAnArray),
            };
        }
        self.scalar_from_native(property.logical_type, native)
    }
}
