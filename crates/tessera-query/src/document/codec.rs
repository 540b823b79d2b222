//! Canonical values ↔ BSON.

use bson::oid::ObjectId;
use bson::{Bson, Document};
use tracing::debug;

use tessera_core::coerce::{coerce_id, normalize, TypeCodec};
use tessera_core::{
    BackendFamily, FieldError, FieldErrorKind, LogicalType, Pattern, Property, Row, Schema,
    StoreError, StoreResult, Value, ID_FIELD,
};

/// Field holding the primary key of every document.
pub const DOCUMENT_ID: &str = "_id";

/// Untyped conversion, used for object columns and raw operands.
pub fn value_to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Integer(i) => match i32::try_from(*i) {
            Ok(small) => Bson::Int32(small),
            Err(_) => Bson::Int64(*i),
        },
        Value::Number(n) => Bson::Double(*n),
        Value::String(s) => Bson::String(s.clone()),
        Value::Date(d) => Bson::DateTime(bson::DateTime::from_chrono(*d)),
        Value::GeoPoint(p) => Bson::Array(vec![Bson::Double(p.x), Bson::Double(p.y)]),
        Value::Array(items) => Bson::Array(items.iter().map(value_to_bson).collect()),
        Value::Object(map) => Bson::Document(
            map.iter()
                .map(|(key, value)| (key.clone(), value_to_bson(value)))
                .collect(),
        ),
        Value::Regex(pattern) => regex_bson(pattern),
    }
}

pub(crate) fn regex_bson(pattern: &Pattern) -> Bson {
    Bson::RegularExpression(bson::Regex {
        pattern: pattern.source.clone(),
        options: if pattern.case_insensitive { "i" } else { "" }.to_string(),
    })
}

/// Untyped conversion back; object ids become their hex string.
pub fn bson_to_value(bson: Bson) -> Value {
    match bson {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(b),
        Bson::Int32(i) => Value::Integer(i64::from(i)),
        Bson::Int64(i) => Value::Integer(i),
        Bson::Double(n) => Value::Number(n),
        Bson::String(s) | Bson::Symbol(s) => Value::String(s),
        Bson::DateTime(d) => Value::Date(d.to_chrono()),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::Array(items) => Value::Array(items.into_iter().map(bson_to_value).collect()),
        Bson::Document(doc) => Value::Object(
            doc.into_iter()
                .map(|(key, value)| (key, bson_to_value(value)))
                .collect(),
        ),
        Bson::RegularExpression(re) => {
            let pattern = Pattern::new(re.pattern);
            Value::Regex(if re.options.contains('i') {
                pattern.ignore_case()
            } else {
                pattern
            })
        }
        other => {
            debug!(kind = ?other.element_type(), "Unmapped BSON value read as null");
            Value::Null
        }
    }
}

/// An id literal as an object id.
pub fn id_to_bson(value: &Value) -> Option<Bson> {
    let id = coerce_id(LogicalType::RecordId, value)?;
    ObjectId::parse_str(id.to_string()).ok().map(Bson::ObjectId)
}

/// Codec for document stores.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentCodec;

impl DocumentCodec {
    fn scalar_to_native(&self, ty: LogicalType, value: &Value) -> Result<Bson, FieldErrorKind> {
        Ok(match (ty, value) {
            (_, Value::Null) => Bson::Null,
            (LogicalType::String { .. } | LogicalType::Text, value) => {
                Bson::String(value.to_text().ok_or(FieldErrorKind::NotAString)?)
            }
            (LogicalType::Number, value) => Bson::Double(value.as_f64().ok_or(FieldErrorKind::NotANumber)?),
            (LogicalType::Integer, value) => {
                let i = value.as_i64().ok_or(FieldErrorKind::NotAnInteger)?;
                Bson::Int32(i32::try_from(i).map_err(|_| FieldErrorKind::NotAnInteger)?)
            }
            (LogicalType::Boolean, Value::Bool(b)) => Bson::Boolean(*b),
            (LogicalType::Boolean, _) => return Err(FieldErrorKind::NotABoolean),
            (LogicalType::Date, Value::Date(d)) => Bson::DateTime(bson::DateTime::from_chrono(*d)),
            (LogicalType::Date, _) => return Err(FieldErrorKind::NotADate),
            (LogicalType::GeoPoint, Value::GeoPoint(p)) => {
                Bson::Array(vec![Bson::Double(p.x), Bson::Double(p.y)])
            }
            (LogicalType::GeoPoint, _) => return Err(FieldErrorKind::NotAGeoPoint),
            (LogicalType::Object, value) => value_to_bson(value),
            (LogicalType::RecordId, value) => id_to_bson(value).ok_or(FieldErrorKind::NotAnId)?,
        })
    }
}

impl TypeCodec for DocumentCodec {
    type Native = Bson;

    fn family(&self) -> BackendFamily {
        BackendFamily::Document
    }

    fn to_native(&self, property: &Property, value: &Value) -> Result<Bson, FieldErrorKind> {
        if property.is_array {
            return match value {
                Value::Null => Ok(Bson::Null),
                Value::Array(items) => items
                    .iter()
                    .map(|item| self.scalar_to_native(property.logical_type, item))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Bson::Array),
                _ => Err(FieldErrorKind::NotAnArray),
            };
        }
        self.scalar_to_native(property.logical_type, value)
    }

    fn from_native(&self, property: &Property, native: Bson) -> Result<Value, FieldErrorKind> {
        let value = bson_to_value(native);
        if property.logical_type == LogicalType::Object && !property.is_array {
            return Ok(value);
        }
        normalize(property, value)
    }
}

/// Look up a dotted path through nested documents.
pub(crate) fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    if let Some(value) = doc.get(path) {
        return Some(value);
    }
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_document()?.get(segment)?;
    }
    Some(current)
}

/// Insert at a dotted path, creating intermediate documents.
fn insert_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(child)) = doc.get_mut(head) {
                insert_path(child, rest, value);
            }
        }
    }
}

/// Validated row → stored document. Dotted columns are nested.
pub fn row_to_document(schema: &Schema, row: &Row) -> StoreResult<Document> {
    let mut doc = Document::new();
    if let Some(id) = row.get(ID_FIELD) {
        let id = id_to_bson(id).ok_or_else(|| StoreError::InvalidId(ID_FIELD.to_string()))?;
        doc.insert(DOCUMENT_ID, id);
    }
    let mut errors = Vec::new();
    for property in schema.properties() {
        let Some(value) = row.get(&property.name) else {
            continue;
        };
        match DocumentCodec.to_native(property, value) {
            Ok(native) => insert_path(&mut doc, &property.name, native),
            Err(reason) => errors.push(FieldError::new(&property.name, reason)),
        }
    }
    if errors.is_empty() {
        Ok(doc)
    } else {
        Err(StoreError::Validation(errors))
    }
}

/// Stored document → row with `id` and the schema's columns that are present.
pub fn document_to_row(schema: &Schema, doc: &Document) -> Row {
    let mut row = Row::with_capacity(schema.properties().count() + 1);
    if let Some(id) = doc.get(DOCUMENT_ID) {
        row.insert(ID_FIELD.to_string(), bson_to_value(id.clone()));
    }
    for property in schema.properties() {
        let Some(native) = lookup(doc, &property.name) else {
            continue;
        };
        let value = DocumentCodec
            .from_native(property, native.clone())
            .unwrap_or_else(|reason| {
                debug!(table = schema.table(), column = %property.name, %reason, "Undecodable value read as null");
                Value::Null
            });
        row.insert(property.name.clone(), value);
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::value::parse_timestamp;
    use tessera_core::{json_row, Capabilities, GeoPoint};

    fn people() -> Schema {
        Schema::builder("people")
            .column("name", LogicalType::STRING)
            .column("age", LogicalType::Integer)
            .column("born", LogicalType::Date)
            .column("home", LogicalType::GeoPoint)
            .column("address.city", LogicalType::STRING)
            .column("manager", LogicalType::RecordId)
            .build(&Capabilities::document())
            .unwrap()
    }

    #[test]
    fn test_row_round_trip() {
        let born = parse_timestamp("1990-05-01T00:00:00.000Z").unwrap();
        let mut row = json_row(json!({
            "id": "507f1f77bcf86cd799439011",
            "name": "Ann",
            "age": 34,
            "address.city": "Oslo",
            "manager": "507f191e810c19729de860ea"
        }));
        row.insert("born".into(), Value::Date(born));
        row.insert("home".into(), Value::GeoPoint(GeoPoint::new(10.7, 59.9)));

        let doc = row_to_document(&people(), &row).unwrap();
        assert!(matches!(doc.get(DOCUMENT_ID), Some(Bson::ObjectId(_))));
        assert_eq!(doc.get_document("address").unwrap().get_str("city").unwrap(), "Oslo");
        assert_eq!(doc.get("age"), Some(&Bson::Int32(34)));

        let back = document_to_row(&people(), &doc);
        for (key, value) in &row {
            assert_eq!(back.get(key), Some(value), "{key}");
        }
    }

    #[test]
    fn test_invalid_object_id() {
        let row = json_row(json!({"id": "not-an-object-id"}));

        assert_eq!(
            row_to_document(&people(), &row).unwrap_err(),
            StoreError::InvalidId("id".to_string())
        );
    }

    #[test]
    fn test_missing_fields_are_absent() {
        let doc = bson::doc! {"name": "Bo", "extra": 1};

        let row = document_to_row(&people(), &doc);

        assert_eq!(row, json_row(json!({"name": "Bo"})));
    }
}
