use bson::{doc, Bson, Document};

use tessera_core::coerce::TypeCodec;
use tessera_core::{
    Condition, FieldRef, FindOptions, GroupExpr, LogicalType, QuerySpec, Row, Schema, StoreError,
    StoreResult, Value, ID_FIELD,
};

use super::codec::{bson_to_value, id_to_bson, DocumentCodec, DOCUMENT_ID};
use super::filter::{group_key_path, with_near, FilterBuilder, Namespace};
use super::DocumentTranslator;

/// Field carrying the result of a count pipeline.
pub const COUNT_FIELD: &str = "count";

/// Arguments of a plain `find` on a collection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FindPlan {
    pub filter: Document,
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub skip: u64,
    pub limit: Option<u64>,
    pub explain: bool,
}

fn field_path(schema: &Schema, field: &str) -> StoreResult<String> {
    Ok(match schema.resolve(field)? {
        FieldRef::Id => DOCUMENT_ID.to_string(),
        FieldRef::Column(property) => property.name.clone(),
    })
}

fn accumulator(schema: &Schema, expr: &GroupExpr) -> StoreResult<Document> {
    let source = |column: &str| -> StoreResult<String> { Ok(format!("${}", field_path(schema, column)?)) };
    Ok(match expr {
        GroupExpr::Count => doc! {"$sum": 1},
        GroupExpr::Sum(column) => doc! {"$sum": source(column)?},
        GroupExpr::Min(column) => doc! {"$min": source(column)?},
        GroupExpr::Max(column) => doc! {"$max": source(column)?},
    })
}

impl DocumentTranslator {
    /// Plan for an ungrouped query.
    pub fn find(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<FindPlan> {
        if spec.is_grouped() {
            return Err(StoreError::unsupported("grouped queries need an aggregation pipeline"));
        }
        let mut filter = self.filter(schema, spec.conditions.as_ref())?;
        if let Some(near) = &spec.near {
            filter = with_near(filter, schema, near)?;
        }

        let projection = match &spec.select {
            Some(columns) => {
                let mut projection = Document::new();
                for column in columns {
                    if let FieldRef::Column(property) = schema.resolve(column)? {
                        projection.insert(property.name.clone(), 1);
                    }
                }
                Some(projection)
            }
            None => None,
        };

        let mut sort = Document::new();
        for order in &spec.orders {
            sort.insert(field_path(schema, &order.column)?, order.direction.signum());
        }

        Ok(FindPlan {
            filter,
            projection,
            sort: (!sort.is_empty()).then_some(sort),
            skip: spec.skip,
            limit: spec.limit,
            explain: spec.explain,
        })
    }

    /// Plan for `find_by_id`; `None` when `id` is not an object id.
    pub fn find_by_id(&self, schema: &Schema, id: &Value, options: &FindOptions) -> StoreResult<Option<FindPlan>> {
        if id_to_bson(id).is_none() {
            return Ok(None);
        }
        let spec = QuerySpec {
            conditions: Some(Condition::eq(ID_FIELD, id.clone())),
            select: options.select.clone(),
            limit: Some(1),
            explain: options.explain,
            ..QuerySpec::default()
        };
        self.find(schema, &spec).map(Some)
    }

    fn group_stage(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<Document> {
        let keys = spec.group_keys();
        let id = match keys {
            [] => Bson::Null,
            [key] => Bson::String(format!("${}", field_path(schema, key)?)),
            keys => {
                let mut id = Document::new();
                for key in keys {
                    id.insert(key.clone(), format!("${}", field_path(schema, key)?));
                }
                Bson::Document(id)
            }
        };
        let mut group = doc! {DOCUMENT_ID: id};
        for (name, expr) in &spec.group_fields {
            group.insert(name.clone(), accumulator(schema, expr)?);
        }
        Ok(doc! {"$group": group})
    }

    /// `$match`, `$group` and the group-level `$match`.
    fn grouped_stages(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<Vec<Document>> {
        if spec.near.is_some() {
            return Err(StoreError::unsupported("near combined with grouping"));
        }
        let mut stages = Vec::new();
        let filter = self.filter(schema, spec.conditions.as_ref())?;
        if !filter.is_empty() {
            stages.push(doc! {"$match": filter});
        }
        stages.push(self.group_stage(schema, spec)?);
        let having = FilterBuilder::new(Namespace::Groups(schema, spec)).build(spec.conditions_of_group.as_ref())?;
        if !having.is_empty() {
            stages.push(doc! {"$match": having});
        }
        Ok(stages)
    }

    /// Aggregation pipeline for a grouped query.
    pub fn pipeline(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<Vec<Document>> {
        let mut stages = self.grouped_stages(schema, spec)?;

        let mut sort = Document::new();
        for order in &spec.orders {
            let path = if spec.group_fields.contains_key(&order.column) {
                order.column.clone()
            } else if spec.group_keys().contains(&order.column) {
                group_key_path(spec, &order.column)
            } else {
                return Err(StoreError::UnknownColumn(order.column.clone()));
            };
            sort.insert(path, order.direction.signum());
        }
        if !sort.is_empty() {
            stages.push(doc! {"$sort": sort});
        }
        if spec.skip > 0 {
            stages.push(doc! {"$skip": spec.skip as i64});
        }
        if let Some(limit) = spec.limit {
            stages.push(doc! {"$limit": limit as i64});
        }
        Ok(stages)
    }

    /// Pipeline counting the groups of a grouped query.
    pub fn count_pipeline(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<Vec<Document>> {
        let mut stages = self.grouped_stages(schema, spec)?;
        stages.push(doc! {"$group": {DOCUMENT_ID: null, COUNT_FIELD: {"$sum": 1}}});
        Ok(stages)
    }
}

/// Decode one `$group` output document into a row keyed by group keys and
/// group field names.
pub fn group_row(schema: &Schema, spec: &QuerySpec, doc: &Document) -> Row {
    let mut row = Row::new();
    let single = spec.group_keys().len() == 1;
    for key in spec.group_keys() {
        let native = match doc.get(DOCUMENT_ID) {
            Some(id) if single => Some(id),
            Some(Bson::Document(keys)) => keys.get(key),
            _ => None,
        };
        let native = native.cloned().unwrap_or(Bson::Null);
        let value = match schema.resolve(key) {
            Ok(FieldRef::Column(property)) => DocumentCodec
                .from_native(property, native.clone())
                .unwrap_or_else(|_| bson_to_value(native)),
            _ => bson_to_value(native),
        };
        row.insert(key.clone(), value);
    }
    for (name, expr) in &spec.group_fields {
        let value = doc.get(name).cloned().map_or(Value::Null, bson_to_value);
        let integral = match expr {
            GroupExpr::Count => true,
            other => other
                .column()
                .and_then(|column| schema.property(column))
                .is_some_and(|property| property.logical_type == LogicalType::Integer),
        };
        let value = match (integral, value.as_i64()) {
            (true, Some(i)) => Value::Integer(i),
            (_, _) => value,
        };
        row.insert(name.clone(), value);
    }
    row
}
