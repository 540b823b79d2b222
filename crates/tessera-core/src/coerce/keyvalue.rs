use super::{from_json_text, json_text, normalize_scalar, TypeCodec};
use crate::error::FieldErrorKind;
use crate::schema::Property;
use crate::types::{BackendFamily, LogicalType};
use crate::value::{parse_timestamp, timestamp_from_millis, Value};

/// Codec for stores that keep every field as a string.
///
/// Numbers are decimal text, dates are epoch milliseconds, booleans are
/// `1`/`0`, objects, arrays and points are JSON. `None` is an absent field.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyValueCodec;

impl TypeCodec for KeyValueCodec {
    type Native = Option<String>;

    fn family(&self) -> BackendFamily {
        BackendFamily::KeyValue
    }

    fn to_native(&self, property: &Property, value: &Value) -> Result<Option<String>, FieldErrorKind> {
        if value.is_null() {
            return Ok(None);
        }
        if property.is_array {
            return match value {
                Value::Array(_) => Ok(Some(json_text(value))),
                _ => Err(FieldErrorKind::NotAnArray),
            };
        }
        let text = match (property.logical_type, value) {
            (LogicalType::Object | LogicalType::GeoPoint, value) => json_text(value),
            (LogicalType::Boolean, Value::Bool(b)) => if *b { "1" } else { "0" }.to_string(),
            (LogicalType::Boolean, _) => return Err(FieldErrorKind::NotABoolean),
            (LogicalType::Date, Value::Date(d)) => d.timestamp_millis().to_string(),
            (LogicalType::Date, _) => return Err(FieldErrorKind::NotADate),
            (_, value) => value.to_text().ok_or(FieldErrorKind::NotAString)?,
        };
        Ok(Some(text))
    }

    fn from_native(&self, property: &Property, native: Option<String>) -> Result<Value, FieldErrorKind> {
        let Some(text) = native else {
            return Ok(Value::Null);
        };
        if property.is_array || property.logical_type == LogicalType::Object {
            return Ok(from_json_text(property, &text));
        }
        match property.logical_type {
            LogicalType::Boolean => match text.as_str() {
                "1" | "true" => Ok(Value::Bool(true)),
                "0" | "false" => Ok(Value::Bool(false)),
                _ => Err(FieldErrorKind::NotABoolean),
            },
            LogicalType::Date => text
                .parse::<i64>()
                .ok()
                .and_then(timestamp_from_millis)
                .or_else(|| parse_timestamp(&text))
                .map(Value::Date)
                .ok_or(FieldErrorKind::NotADate),
            LogicalType::GeoPoint => {
                let json: serde_json::Value =
                    serde_json::from_str(&text).map_err(|_| FieldErrorKind::NotAGeoPoint)?;
                normalize_scalar(LogicalType::GeoPoint, json.into())
            }
            LogicalType::RecordId => Ok(text
                .parse::<i64>()
                .map(Value::Integer)
                .unwrap_or(Value::String(text))),
            ty => normalize_scalar(ty, Value::String(text)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::GeoPoint;
    use test_case::test_case;

    #[test_case(LogicalType::Integer, Value::Integer(-2147483648) ; "integer min")]
    #[test_case(LogicalType::Integer, Value::Integer(2147483647) ; "integer max")]
    #[test_case(LogicalType::Number, Value::Number(0.1) ; "number")]
    #[test_case(LogicalType::Boolean, Value::Bool(true) ; "boolean")]
    #[test_case(LogicalType::STRING, Value::from("a:b") ; "string")]
    #[test_case(LogicalType::Date, Value::Date(parse_timestamp("2023-12-31T23:59:59.001Z").unwrap()) ; "date")]
    #[test_case(LogicalType::GeoPoint, Value::GeoPoint(GeoPoint::new(1.0, -2.5)) ; "geopoint")]
    #[test_case(LogicalType::Object, Value::from(serde_json::json!({"k": "v"})) ; "object")]
    fn test_round_trip(ty: LogicalType, value: Value) {
        let property = Property::new("c", ty);

        let native = KeyValueCodec.to_native(&property, &value).unwrap();

        assert_eq!(KeyValueCodec.from_native(&property, native).unwrap(), value);
    }

    #[test]
    fn test_storage_forms() {
        let flag = Property::new("f", LogicalType::Boolean);
        let date = Property::new("d", LogicalType::Date);
        let when = Value::Date(parse_timestamp("1970-01-01T00:00:01.500Z").unwrap());

        assert_eq!(KeyValueCodec.to_native(&flag, &Value::Bool(false)).unwrap().as_deref(), Some("0"));
        assert_eq!(KeyValueCodec.to_native(&date, &when).unwrap().as_deref(), Some("1500"));
        assert_eq!(KeyValueCodec.to_native(&flag, &Value::Null).unwrap(), None);
    }

    #[test]
    fn test_array_of_integers() {
        let property = Property::new("c", LogicalType::Integer).array();
        let value = Value::from(vec![1, 2, 3]);

        let native = KeyValueCodec.to_native(&property, &value).unwrap();

        assert_eq!(native.as_deref(), Some("[1,2,3]"));
        assert_eq!(KeyValueCodec.from_native(&property, native).unwrap(), value);
    }
}
