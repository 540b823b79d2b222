use bson::{doc, Bson, Document};

use tessera_core::coerce::{normalize, TypeCodec};
use tessera_core::{
    Condition, FieldError, FieldUpdate, PartialRow, Row, Schema, StoreError, StoreResult, ID_FIELD,
};

use super::codec::{id_to_bson, row_to_document, DocumentCodec, DOCUMENT_ID};
use super::DocumentTranslator;

/// Arguments of an `update_many`/`update_one` call.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePlan {
    pub filter: Document,
    pub update: Document,
    pub upsert: bool,
}

impl DocumentTranslator {
    /// `$set`/`$unset`/`$inc` operators for a validated partial row.
    pub fn update_document(&self, schema: &Schema, partial: &PartialRow) -> StoreResult<Document> {
        let mut set = Document::new();
        let mut unset = Document::new();
        let mut inc = Document::new();
        let mut errors = Vec::new();

        for (column, update) in partial {
            if column == ID_FIELD {
                continue;
            }
            let property = schema
                .property(column)
                .ok_or_else(|| StoreError::UnknownColumn(column.clone()))?;
            match update {
                FieldUpdate::Unset => {
                    unset.insert(column.clone(), "");
                }
                FieldUpdate::Set(value) => match DocumentCodec.to_native(property, value) {
                    Ok(native) => {
                        set.insert(column.clone(), native);
                    }
                    Err(reason) => errors.push(FieldError::new(column, reason)),
                },
                FieldUpdate::Increment(amount) => match DocumentCodec.to_native(property, amount) {
                    Ok(native) => {
                        inc.insert(column.clone(), native);
                    }
                    Err(reason) => errors.push(FieldError::new(column, reason)),
                },
            }
        }
        if !errors.is_empty() {
            return Err(StoreError::Validation(errors));
        }

        let mut update = Document::new();
        for (operator, fields) in [("$set", set), ("$unset", unset), ("$inc", inc)] {
            if !fields.is_empty() {
                update.insert(operator, fields);
            }
        }
        Ok(update)
    }

    /// Multi-document update; `None` when the partial changes nothing.
    pub fn update_partial(
        &self,
        schema: &Schema,
        partial: &PartialRow,
        condition: Option<&Condition>,
    ) -> StoreResult<Option<UpdatePlan>> {
        let update = self.update_document(schema, partial)?;
        if update.is_empty() {
            return Ok(None);
        }
        Ok(Some(UpdatePlan {
            filter: self.filter(schema, condition)?,
            update,
            upsert: false,
        }))
    }

    /// Single-document upsert. Equality conditions are copied into `$set` so
    /// an inserted document satisfies the conditions it was matched by.
    pub fn upsert(
        &self,
        schema: &Schema,
        partial: &PartialRow,
        condition: Option<&Condition>,
    ) -> StoreResult<UpdatePlan> {
        let mut update = self.update_document(schema, partial)?;

        let mut seeded = Document::new();
        if let Some(condition) = condition {
            for (field, value) in condition.equalities() {
                if field == ID_FIELD || partial.contains_key(field) {
                    continue;
                }
                let Some(property) = schema.property(field) else {
                    return Err(StoreError::UnknownColumn(field.to_string()));
                };
                let native = normalize(property, value.clone())
                    .and_then(|value| DocumentCodec.to_native(property, &value))
                    .map_err(|reason| StoreError::Validation(vec![FieldError::new(field, reason)]))?;
                seeded.insert(field, native);
            }
        }
        if !seeded.is_empty() {
            match update.get_mut("$set") {
                Some(Bson::Document(set)) => {
                    for (field, native) in seeded {
                        set.insert(field, native);
                    }
                }
                _ => {
                    update.insert("$set", seeded);
                }
            }
        }
        if update.is_empty() {
            update.insert("$setOnInsert", Document::new());
        }

        Ok(UpdatePlan {
            filter: self.filter(schema, condition)?,
            update,
            upsert: true,
        })
    }

    /// Filter and replacement document for a full update of `row["id"]`.
    pub fn replacement(&self, schema: &Schema, row: &Row) -> StoreResult<(Document, Document)> {
        let id = row
            .get(ID_FIELD)
            .and_then(id_to_bson)
            .ok_or_else(|| StoreError::InvalidId(ID_FIELD.to_string()))?;
        let mut replacement = row_to_document(schema, row)?;
        replacement.remove(DOCUMENT_ID);
        Ok((doc! {DOCUMENT_ID: id}, replacement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::{json_row, partial_from_row, Capabilities, LogicalType, Value};

    fn people() -> Schema {
        Schema::builder("people")
            .column("name", LogicalType::STRING)
            .column("age", LogicalType::Integer)
            .build(&Capabilities::document())
            .unwrap()
    }

    #[test]
    fn test_update_operators() {
        let partial = partial_from_row(json_row(json!({"age": {"$inc": 2}, "name": null})));

        let update = DocumentTranslator.update_document(&people(), &partial).unwrap();

        assert_eq!(update, doc! {"$unset": {"name": ""}, "$inc": {"age": 2}});
    }

    #[test]
    fn test_empty_partial_is_no_update() {
        assert!(DocumentTranslator
            .update_partial(&people(), &PartialRow::new(), None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_upsert_seeds_equalities() {
        let partial = partial_from_row(json_row(json!({"age": {"$inc": 1}})));
        let condition = Condition::parse(&Value::from(json!({"name": "Ann"}))).unwrap();

        let plan = DocumentTranslator
            .upsert(&people(), &partial, condition.as_ref())
            .unwrap();

        assert!(plan.upsert);
        assert_eq!(plan.filter, doc! {"name": "Ann"});
        assert_eq!(plan.update, doc! {"$inc": {"age": 1}, "$set": {"name": "Ann"}});
    }

    #[test]
    fn test_replacement_needs_object_id() {
        let row = json_row(json!({"id": "507f1f77bcf86cd799439011", "name": "Bo"}));

        let (filter, replacement) = DocumentTranslator.replacement(&people(), &row).unwrap();

        assert!(matches!(filter.get(DOCUMENT_ID), Some(Bson::ObjectId(_))));
        assert_eq!(replacement, doc! {"name": "Bo"});
        assert_eq!(
            DocumentTranslator
                .replacement(&people(), &json_row(json!({"name": "Bo"})))
                .unwrap_err(),
            StoreError::InvalidId("id".to_string())
        );
    }
}
