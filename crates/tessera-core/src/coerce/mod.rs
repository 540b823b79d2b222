//! Type coercion
//!
//! Two layers:
//!
//! - *validation* normalizes user-supplied values to the canonical [`Value`]
//!   shape of their declared [`LogicalType`], collecting every failing column
//!   into one [`StoreError::Validation`];
//! - a [`TypeCodec`] per backend family converts canonical values to the
//!   backend's native representation and back.

mod keyvalue;
mod sql;

pub use keyvalue::KeyValueCodec;
pub use sql::{SqlCodec, SqlValue};

use tracing::debug;

use crate::error::{FieldError, FieldErrorKind, StoreError, StoreResult};
use crate::schema::{Property, Schema, ID_FIELD};
use crate::types::{BackendFamily, LogicalType};
use crate::update::{FieldUpdate, PartialRow};
use crate::value::{is_object_id, parse_timestamp, timestamp_from_millis, GeoPoint, RecordId, Row, Value};

/// Conversion between canonical values and one backend family's native form.
pub trait TypeCodec: Send + Sync {
    type Native;

    fn family(&self) -> BackendFamily;

    /// Canonical → native. Expects a value already passed through [`normalize`].
    fn to_native(&self, property: &Property, value: &Value) -> Result<Self::Native, FieldErrorKind>;

    /// Native → canonical.
    fn from_native(&self, property: &Property, native: Self::Native) -> Result<Value, FieldErrorKind>;
}

/// Normalize a value to the canonical shape of `property`.
pub fn normalize(property: &Property, value: Value) -> Result<Value, FieldErrorKind> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    if property.is_array {
        let Value::Array(items) = value else {
            return Err(FieldErrorKind::NotAnArray);
        };
        return items
            .into_iter()
            .map(|item| normalize_scalar(property.logical_type, item))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array);
    }
    normalize_scalar(property.logical_type, value)
}

/// Normalize one scalar to the canonical shape of `ty`.
pub fn normalize_scalar(ty: LogicalType, value: Value) -> Result<Value, FieldErrorKind> {
    match (ty, value) {
        (_, Value::Null) => Ok(Value::Null),
        (LogicalType::String { .. } | LogicalType::Text, Value::String(s)) => Ok(Value::String(s)),
        (
            LogicalType::String { .. } | LogicalType::Text,
            value @ (Value::Integer(_) | Value::Number(_) | Value::Bool(_) | Value::Date(_)),
        ) => value
            .to_text()
            .map(Value::String)
            .ok_or(FieldErrorKind::NotAString),
        (LogicalType::String { .. } | LogicalType::Text, _) => Err(FieldErrorKind::NotAString),
        (LogicalType::Number, Value::Integer(i)) => Ok(Value::Number(i as f64)),
        (LogicalType::Number, Value::Number(n)) if n.is_finite() => Ok(Value::Number(n)),
        (LogicalType::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .map(Value::Number)
            .ok_or(FieldErrorKind::NotANumber),
        (LogicalType::Number, _) => Err(FieldErrorKind::NotANumber),
        (LogicalType::Integer, value) => integer(value).map(Value::Integer),
        (LogicalType::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
        (LogicalType::Boolean, _) => Err(FieldErrorKind::NotABoolean),
        (LogicalType::Date, Value::Date(d)) => Ok(Value::Date(d)),
        (LogicalType::Date, Value::String(s)) => parse_timestamp(&s)
            .map(Value::Date)
            .ok_or(FieldErrorKind::NotADate),
        (LogicalType::Date, Value::Integer(millis)) => timestamp_from_millis(millis)
            .map(Value::Date)
            .ok_or(FieldErrorKind::NotADate),
        (LogicalType::Date, _) => Err(FieldErrorKind::NotADate),
        (LogicalType::GeoPoint, Value::GeoPoint(p)) => Ok(Value::GeoPoint(p)),
        (LogicalType::GeoPoint, Value::Array(items)) => match items.as_slice() {
            [x, y] => match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => Ok(Value::GeoPoint(GeoPoint::new(x, y))),
                _ => Err(FieldErrorKind::NotAGeoPoint),
            },
            _ => Err(FieldErrorKind::NotAGeoPoint),
        },
        (LogicalType::GeoPoint, _) => Err(FieldErrorKind::NotAGeoPoint),
        (LogicalType::Object, Value::Regex(_)) => Err(FieldErrorKind::NotAnObject),
        (LogicalType::Object, value) => Ok(value),
        (LogicalType::RecordId, value @ (Value::Integer(_) | Value::String(_))) => Ok(value),
        (LogicalType::RecordId, _) => Err(FieldErrorKind::NotAnId),
    }
}

fn integer(value: Value) -> Result<i64, FieldErrorKind> {
    let candidate = match value {
        Value::Integer(i) => Some(i),
        Value::Number(n) if n.is_finite() && n.fract() == 0.0 => Some(n as i64),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    candidate
        .filter(|i| i32::try_from(*i).is_ok())
        .ok_or(FieldErrorKind::NotAnInteger)
}

/// Coerce an id literal to the key type of a backend.
pub fn coerce_id(key_type: LogicalType, value: &Value) -> Option<RecordId> {
    match (key_type, value) {
        (LogicalType::RecordId, Value::String(s)) if is_object_id(s) => {
            Some(RecordId::ObjectId(s.to_ascii_lowercase()))
        }
        (LogicalType::RecordId, _) => None,
        (_, Value::Integer(i)) => Some(RecordId::Integer(*i)),
        (_, Value::Number(n)) if n.fract() == 0.0 && n.is_finite() => Some(RecordId::Integer(*n as i64)),
        (_, Value::String(s)) => s.trim().parse().ok().map(RecordId::Integer),
        _ => None,
    }
}

fn lookup<'a>(row: &'a Row, name: &str) -> Option<&'a Value> {
    if let Some(value) = row.get(name) {
        return Some(value);
    }
    let mut segments = name.split('.');
    let mut current = row.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn is_increment_marker(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.len() == 1 && map.contains_key("$inc"))
}

/// Validate a row for insert or full replace.
///
/// The result holds every schema column present in `row` (nested objects are
/// looked up for dotted names) in schema order, normalized. Other keys are
/// dropped, except `id` which is carried through untouched.
pub fn validate_row(schema: &Schema, row: &Row) -> StoreResult<Row> {
    let mut errors = Vec::new();
    let mut validated = Row::with_capacity(row.len());

    if let Some(id) = row.get(ID_FIELD) {
        validated.insert(ID_FIELD.to_string(), id.clone());
    }
    for property in schema.properties() {
        let Some(value) = lookup(row, &property.name) else {
            continue;
        };
        if is_increment_marker(value) {
            errors.push(FieldError::new(&property.name, FieldErrorKind::IncrementNotAllowed));
            continue;
        }
        match normalize(property, value.clone()) {
            Ok(value) => {
                validated.insert(property.name.clone(), value);
            }
            Err(reason) => errors.push(FieldError::new(&property.name, reason)),
        }
    }

    let ignored = row
        .keys()
        .filter(|key| *key != ID_FIELD && schema.property(key).is_none())
        .count();
    if ignored > 0 {
        debug!(table = schema.table(), ignored, "Dropping columns absent from the schema");
    }

    if errors.is_empty() {
        Ok(validated)
    } else {
        Err(StoreError::Validation(errors))
    }
}

/// Validate a partial update; increments are accepted on numeric columns only.
pub fn validate_partial(schema: &Schema, partial: &PartialRow) -> StoreResult<PartialRow> {
    let mut errors = Vec::new();
    let mut validated = PartialRow::with_capacity(partial.len());

    for (column, update) in partial {
        let property = schema
            .property(column)
            .ok_or_else(|| StoreError::UnknownColumn(column.clone()))?;
        let checked = match update {
            FieldUpdate::Unset => Ok(FieldUpdate::Unset),
            FieldUpdate::Set(value) => normalize(property, value.clone()).map(FieldUpdate::Set),
            FieldUpdate::Increment(_) if !property.logical_type.is_numeric() || property.is_array => {
                Err(FieldErrorKind::IncrementOnNonNumeric)
            }
            FieldUpdate::Increment(amount) => {
                normalize_scalar(property.logical_type, amount.clone()).map(FieldUpdate::Increment)
            }
        };
        match checked {
            Ok(update) => {
                validated.insert(column.clone(), update);
            }
            Err(reason) => errors.push(FieldError::new(column, reason)),
        }
    }

    if errors.is_empty() {
        Ok(validated)
    } else {
        Err(StoreError::Validation(errors))
    }
}

/// Name of the first required property missing from a validated row.
pub fn missing_required<'a>(schema: &'a Schema, row: &Row) -> Option<&'a str> {
    schema
        .properties()
        .find(|property| property.required && row.get(&property.name).map_or(true, Value::is_null))
        .map(|property| property.name.as_str())
}

pub(crate) fn json_text(value: &Value) -> String {
    value.to_json().to_string()
}

/// Parse JSON text back into canonical values for `property`.
pub(crate) fn from_json_text(property: &Property, text: &str) -> Value {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(text) else {
        return Value::Null;
    };
    let value = Value::from(json);
    if property.logical_type == LogicalType::Object && !property.is_array {
        return value;
    }
    normalize(property, value).unwrap_or(Value::Null)
}
