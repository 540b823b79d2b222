//! Condition → document filter.

use bson::{doc, Bson, Document};

use tessera_core::coerce::{normalize_scalar, TypeCodec};
use tessera_core::{
    Condition, Conjunction, FieldRef, LogicalType, Near, Pattern, Property, QuerySpec, Schema,
    StoreError, StoreResult, Test, Value,
};

use super::codec::{id_to_bson, regex_bson, value_to_bson, DocumentCodec, DOCUMENT_ID};

/// Where field names in a condition are looked up.
#[derive(Clone, Copy)]
pub(crate) enum Namespace<'a> {
    Table(&'a Schema),
    /// Output of a `$group` stage: keys live under `_id`.
    Groups(&'a Schema, &'a QuerySpec),
}

struct Operand {
    field: String,
    path: String,
    ty: Option<LogicalType>,
}

/// Path of a group key inside `$group` output. A single key is `_id` itself.
pub(crate) fn group_key_path(spec: &QuerySpec, key: &str) -> String {
    match spec.group_keys() {
        [_] => DOCUMENT_ID.to_string(),
        _ => format!("{DOCUMENT_ID}.{key}"),
    }
}

pub(crate) struct FilterBuilder<'a> {
    namespace: Namespace<'a>,
}

impl<'a> FilterBuilder<'a> {
    pub(crate) fn new(namespace: Namespace<'a>) -> Self {
        Self { namespace }
    }

    pub(crate) fn build(&self, condition: Option<&Condition>) -> StoreResult<Document> {
        match condition {
            Some(condition) => self.node(condition),
            None => Ok(Document::new()),
        }
    }

    fn node(&self, condition: &Condition) -> StoreResult<Document> {
        match condition {
            Condition::Predicate(predicate) => {
                let operand = self.resolve(&predicate.field)?;
                let expression = self.expression(&operand, &predicate.test)?;
                let mut clause = Document::new();
                clause.insert(operand.path, expression);
                Ok(clause)
            }
            Condition::Group {
                conjunction,
                children,
            } => {
                let mut clauses = Vec::with_capacity(children.len());
                for child in children {
                    clauses.push(self.node(child)?);
                }
                Ok(match conjunction {
                    Conjunction::And => flatten_and(clauses),
                    Conjunction::Or => doc! {"$or": clauses},
                })
            }
        }
    }

    fn resolve(&self, field: &str) -> StoreResult<Operand> {
        let (schema, groups) = match self.namespace {
            Namespace::Table(schema) => (schema, None),
            Namespace::Groups(schema, spec) => (schema, Some(spec)),
        };
        if let Some(spec) = groups {
            if let Some(expr) = spec.group_fields.get(field) {
                let ty = match expr.column() {
                    None => Some(LogicalType::Integer),
                    Some(column) => schema
                        .resolve(column)
                        .ok()
                        .map(|resolved| resolved.logical_type(schema.key_type())),
                };
                return Ok(Operand {
                    field: field.to_string(),
                    path: field.to_string(),
                    ty,
                });
            }
            if !spec.group_keys().iter().any(|key| key == field) {
                return Err(StoreError::UnknownColumn(field.to_string()));
            }
        }

        let path = |name: &str| match groups {
            Some(spec) => group_key_path(spec, field),
            None => name.to_string(),
        };
        Ok(match schema.resolve(field)? {
            FieldRef::Id => Operand {
                field: field.to_string(),
                path: path(DOCUMENT_ID),
                ty: Some(schema.key_type()),
            },
            FieldRef::Column(property) => Operand {
                field: field.to_string(),
                path: path(&property.name),
                ty: (!property.is_array).then_some(property.logical_type),
            },
        })
    }

    /// The value placed under the field: a literal for equality, an operator
    /// document otherwise.
    fn expression(&self, operand: &Operand, test: &Test) -> StoreResult<Bson> {
        Ok(match test {
            Test::Eq(value) => self.operand(operand, value)?,
            Test::Ne(value) => Bson::Document(doc! {"$ne": self.operand(operand, value)?}),
            Test::Gt(value) => Bson::Document(doc! {"$gt": self.operand(operand, value)?}),
            Test::Lt(value) => Bson::Document(doc! {"$lt": self.operand(operand, value)?}),
            Test::Gte(value) => Bson::Document(doc! {"$gte": self.operand(operand, value)?}),
            Test::Lte(value) => Bson::Document(doc! {"$lte": self.operand(operand, value)?}),
            Test::In(values) => Bson::Document(doc! {"$in": self.operands(operand, values)?}),
            Test::Nin(values) => Bson::Document(doc! {"$nin": self.operands(operand, values)?}),
            Test::Contains(values) => match self.contains_patterns(operand, values)?.as_slice() {
                [single] => single.clone(),
                patterns => Bson::Document(doc! {"$in": patterns.to_vec()}),
            },
            Test::StartsWith(value) => regex_bson(
                &Pattern::new(format!("^{}", regex::escape(&text_operand(operand, value)?))).ignore_case(),
            ),
            Test::EndsWith(value) => regex_bson(
                &Pattern::new(format!("{}$", regex::escape(&text_operand(operand, value)?))).ignore_case(),
            ),
            Test::Regex(pattern) => regex_bson(pattern),
            Test::Not(inner) => match inner.as_ref() {
                Test::Eq(_) | Test::Ne(_) | Test::In(_) | Test::Nin(_) | Test::Not(_) => {
                    return self.expression(operand, &inner.as_ref().clone().negate())
                }
                Test::Contains(values) => {
                    Bson::Document(doc! {"$nin": self.contains_patterns(operand, values)?})
                }
                other => Bson::Document(doc! {"$not": self.expression(operand, other)?}),
            },
        })
    }

    fn contains_patterns(&self, operand: &Operand, values: &[Value]) -> StoreResult<Vec<Bson>> {
        values
            .iter()
            .map(|value| {
                let text = text_operand(operand, value)?;
                Ok(regex_bson(&Pattern::new(regex::escape(&text)).ignore_case()))
            })
            .collect()
    }

    fn operands(&self, operand: &Operand, values: &[Value]) -> StoreResult<Vec<Bson>> {
        values.iter().map(|value| self.operand(operand, value)).collect()
    }

    /// Type-directed operand coercion, matching the SQL translator's rules.
    fn operand(&self, operand: &Operand, value: &Value) -> StoreResult<Bson> {
        if value.is_null() {
            return Ok(Bson::Null);
        }
        if operand.ty == Some(LogicalType::RecordId) {
            return id_to_bson(value).ok_or_else(|| StoreError::InvalidId(operand.field.clone()));
        }
        let Some(ty) = operand.ty else {
            return Ok(value_to_bson(value));
        };
        let codec_value = |ty: LogicalType| {
            normalize_scalar(ty, value.clone())
                .ok()
                .and_then(|normalized| DocumentCodec.to_native(&probe(ty), &normalized).ok())
        };
        Ok(match ty {
            LogicalType::Number => codec_value(ty).unwrap_or(Bson::Double(f64::MAX)),
            LogicalType::Integer => codec_value(ty).unwrap_or(Bson::Int32(i32::MIN)),
            LogicalType::Date => codec_value(ty).ok_or_else(|| {
                StoreError::invalid_condition(format!("'{}' is not a date: {value}", operand.field))
            })?,
            LogicalType::Object => value_to_bson(value),
            other => codec_value(other).unwrap_or_else(|| value_to_bson(value)),
        })
    }
}

fn probe(ty: LogicalType) -> Property {
    Property::new("", ty)
}

fn text_operand(operand: &Operand, value: &Value) -> StoreResult<String> {
    value.to_text().ok_or_else(|| {
        StoreError::invalid_condition(format!("'{}' pattern must be text", operand.field))
    })
}

/// Merge AND-ed clauses into one document when no key collides and none is
/// an operator; otherwise keep an explicit `$and`.
fn flatten_and(clauses: Vec<Document>) -> Document {
    let total: usize = clauses.iter().map(Document::len).sum();
    let has_operator = clauses
        .iter()
        .any(|clause| clause.keys().any(|key| key.starts_with('$')));
    if !has_operator {
        let mut merged = Document::new();
        for clause in &clauses {
            for (key, value) in clause {
                merged.insert(key.clone(), value.clone());
            }
        }
        if merged.len() == total {
            return merged;
        }
    }
    doc! {"$and": clauses}
}

/// Add a `$near` clause for `near`, merging into an existing operator
/// document on the same field when there is one. A filter with a top-level
/// `$and`/`$or` gets the clause as a separate `$and` branch.
pub(crate) fn with_near(mut filter: Document, schema: &Schema, near: &Near) -> StoreResult<Document> {
    match schema.resolve(&near.field)? {
        FieldRef::Column(property) if property.logical_type == LogicalType::GeoPoint => {}
        _ => {
            return Err(StoreError::invalid_condition(format!(
                "'{}' is not a geopoint column",
                near.field
            )))
        }
    }
    let point = Bson::Array(vec![Bson::Double(near.point.x), Bson::Double(near.point.y)]);
    let conjunctive = filter.keys().any(|key| key.starts_with('$'));
    let mergeable = !conjunctive
        && match filter.get(&near.field) {
            None => true,
            Some(Bson::Document(operators)) => operators.keys().all(|key| key.starts_with('$')),
            Some(_) => false,
        };
    if !mergeable {
        let mut clause = Document::new();
        clause.insert(near.field.clone(), doc! {"$near": point});
        return Ok(doc! {"$and": [filter, clause]});
    }
    match filter.get_mut(&near.field) {
        Some(Bson::Document(operators)) => {
            operators.insert("$near", point);
        }
        _ => {
            filter.insert(near.field.clone(), doc! {"$near": point});
        }
    }
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::{Capabilities, GeoPoint, GroupExpr};
    use test_case::test_case;

    fn people() -> Schema {
        Schema::builder("people")
            .column("name", LogicalType::STRING)
            .column("age", LogicalType::Integer)
            .column("score", LogicalType::Number)
            .column("home", LogicalType::GeoPoint)
            .build(&Capabilities::document())
            .unwrap()
    }

    fn filter(tree: serde_json::Value) -> StoreResult<Document> {
        let schema = people();
        let condition = Condition::parse(&Value::from(tree))?;
        FilterBuilder::new(Namespace::Table(&schema)).build(condition.as_ref())
    }

    #[test_case(json!({"age": 3}), doc! {"age": 3} ; "equality")]
    #[test_case(json!({"name": null}), doc! {"name": null} ; "null")]
    #[test_case(json!({"age": {"ne": 3}}), doc! {"age": {"$ne": 3}} ; "not equal")]
    #[test_case(json!({"age": {"not": [1, 2]}}), doc! {"age": {"$nin": [1, 2]}} ; "not in")]
    #[test_case(json!({"age": {"in": []}}), doc! {"age": {"$in": []}} ; "empty in")]
    #[test_case(json!({"age": {"not": {"gt": 3}}}), doc! {"age": {"$not": {"$gt": 3}}} ; "negated range")]
    #[test_case(json!({"age": {"not": {"not": 3}}}), doc! {"age": 3} ; "double negation")]
    #[test_case(json!({"score": {"gt": "x"}}), doc! {"score": {"$gt": f64::MAX}} ; "clamped number")]
    fn test_predicates(tree: serde_json::Value, expected: Document) {
        assert_eq!(filter(tree).unwrap(), expected);
    }

    #[test]
    fn test_and_flattens_disjoint_fields() {
        assert_eq!(
            filter(json!({"age": {"gt": 1}, "name": "a"})).unwrap(),
            doc! {"age": {"$gt": 1}, "name": "a"}
        );
    }

    #[test]
    fn test_and_keeps_colliding_fields() {
        assert_eq!(
            filter(json!([{"age": {"gt": 1}}, {"age": {"lt": 9}}])).unwrap(),
            doc! {"$and": [{"age": {"$gt": 1}}, {"age": {"$lt": 9}}]}
        );
    }

    #[test]
    fn test_or() {
        assert_eq!(
            filter(json!({"or": [{"age": 1}, {"name": "b"}]})).unwrap(),
            doc! {"$or": [{"age": 1}, {"name": "b"}]}
        );
    }

    #[test]
    fn test_patterns_are_escaped_and_case_insensitive() {
        let built = filter(json!({"name": {"startswith": "a.b"}})).unwrap();

        let Some(Bson::RegularExpression(re)) = built.get("name") else {
            panic!("expected a regex, got {built:?}");
        };
        assert_eq!(re.pattern, r"^a\.b");
        assert_eq!(re.options, "i");
    }

    #[test]
    fn test_negated_contains_many() {
        let built = filter(json!({"name": {"not": {"contains": ["a", "b"]}}})).unwrap();

        let patterns = built.get_document("name").unwrap().get_array("$nin").unwrap();
        assert_eq!(patterns.len(), 2);
    }

    #[test]
    fn test_id_becomes_object_id() {
        let built = filter(json!({"id": "507f1f77bcf86cd799439011"})).unwrap();
        assert!(matches!(built.get("_id"), Some(Bson::ObjectId(_))));

        assert_eq!(
            filter(json!({"id": 5})).unwrap_err(),
            StoreError::InvalidId("id".to_string())
        );
    }

    #[test]
    fn test_group_namespace() {
        let schema = people();
        let spec = QuerySpec::new()
            .group_by(["name"])
            .group_field("total", GroupExpr::Sum("age".into()));
        let having = Condition::parse(&Value::from(json!({"total": {"gt": 10}, "name": "a"}))).unwrap();

        let built = FilterBuilder::new(Namespace::Groups(&schema, &spec))
            .build(having.as_ref())
            .unwrap();

        assert_eq!(built, doc! {"_id": "a", "total": {"$gt": 10}});
    }

    #[test]
    fn test_group_namespace_with_composite_key() {
        let schema = people();
        let spec = QuerySpec::new().group_by(["name", "age"]);
        let having = Condition::parse(&Value::from(json!({"name": "a", "age": 3}))).unwrap();

        let built = FilterBuilder::new(Namespace::Groups(&schema, &spec))
            .build(having.as_ref())
            .unwrap();

        assert_eq!(built, doc! {"_id.name": "a", "_id.age": 3});
    }

    #[test_case(doc! {"$and": [{"age": {"$gt": 1}}, {"age": {"$lt": 9}}]} ; "conjunction")]
    #[test_case(doc! {"$or": [{"age": 1}, {"name": "a"}]} ; "disjunction")]
    fn test_near_beside_top_level_operator_is_isolated(filter: Document) {
        let near = Near {
            field: "home".into(),
            point: GeoPoint::new(1.0, 2.0),
        };

        let built = with_near(filter.clone(), &people(), &near).unwrap();

        assert_eq!(built, doc! {"$and": [filter, {"home": {"$near": [1.0, 2.0]}}]});
    }

    #[test]
    fn test_near_merges_or_wraps() {
        let schema = people();
        let near = Near {
            field: "home".into(),
            point: GeoPoint::new(1.0, 2.0),
        };

        assert_eq!(
            with_near(doc! {"age": 1}, &schema, &near).unwrap(),
            doc! {"age": 1, "home": {"$near": [1.0, 2.0]}}
        );
        assert_eq!(
            with_near(doc! {"home": {"$ne": null}}, &schema, &near).unwrap(),
            doc! {"home": {"$ne": null, "$near": [1.0, 2.0]}}
        );
        assert_eq!(
            with_near(doc! {"home": {"x": 1}}, &schema, &near).unwrap(),
            doc! {"$and": [{"home": {"x": 1}}, {"home": {"$near": [1.0, 2.0]}}]}
        );
        assert!(matches!(
            with_near(Document::new(), &schema, &Near { field: "age".into(), point: GeoPoint::new(0.0, 0.0) }),
            Err(StoreError::InvalidCondition(_))
        ));
    }
}
