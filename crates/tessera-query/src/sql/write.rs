use tessera_core::coerce::{coerce_id, SqlCodec, SqlValue, TypeCodec};
use tessera_core::{
    Condition, FieldError, FieldUpdate, LogicalType, PartialRow, Property, Row, Schema, StoreError,
    StoreResult, Value, ID_FIELD,
};

use super::filter::ParamSink;
use super::{RenderedQuery, SqlTranslator};

impl SqlTranslator {
    /// Bind one value, expanding points through the dialect's constructor.
    fn bind(&self, value: SqlValue, sink: &mut ParamSink<'_>) -> String {
        match (value, self.dialect.point_constructor()) {
            (SqlValue::Point(point), Some(constructor)) => {
                let x = sink.push(SqlValue::Real(point.x));
                let y = sink.push(SqlValue::Real(point.y));
                format!("{constructor}({x}, {y})")
            }
            (value, _) => sink.push(value),
        }
    }

    fn native(&self, property: &Property, value: &Value) -> StoreResult<SqlValue> {
        SqlCodec
            .to_native(property, value)
            .map_err(|reason| StoreError::Validation(vec![FieldError::new(&property.name, reason)]))
    }

    fn row_id(&self, row: &Row) -> StoreResult<i64> {
        row.get(ID_FIELD)
            .and_then(|id| coerce_id(LogicalType::Integer, id))
            .and_then(|id| id.as_i64())
            .ok_or_else(|| StoreError::InvalidId(ID_FIELD.to_string()))
    }

    /// `INSERT` of a validated row. Every schema column is written; absent
    /// ones as `NULL`. An explicit `id` is kept.
    pub fn insert(&self, schema: &Schema, row: &Row) -> StoreResult<RenderedQuery> {
        let mut sink = ParamSink::new(self.dialect());
        let mut names = Vec::new();
        let mut placeholders = Vec::new();

        if row.contains_key(ID_FIELD) {
            let id = self.row_id(row)?;
            names.push(self.dialect.quote("id"));
            placeholders.push(sink.push(SqlValue::Integer(id)));
        }
        for property in schema.properties() {
            let value = row.get(&property.name).unwrap_or(&Value::Null);
            names.push(self.dialect.quote(&property.dbname));
            placeholders.push(self.bind(self.native(property, value)?, &mut sink));
        }

        let mut sql = if names.is_empty() {
            self.dialect.empty_insert(&self.table(schema))
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.table(schema),
                names.join(", "),
                placeholders.join(", ")
            )
        };
        if self.dialect.returning_id() {
            sql.push_str(&format!(" RETURNING {}", self.dialect.quote("id")));
        }
        Ok(RenderedQuery {
            sql,
            params: sink.params,
        })
    }

    /// Full replace of the row identified by `row["id"]`.
    pub fn update(&self, schema: &Schema, row: &Row) -> StoreResult<RenderedQuery> {
        let id = self.row_id(row)?;
        let mut sink = ParamSink::new(self.dialect());
        let mut assignments = Vec::new();
        for property in schema.properties() {
            let value = row.get(&property.name).unwrap_or(&Value::Null);
            let placeholder = self.bind(self.native(property, value)?, &mut sink);
            assignments.push(format!("{} = {placeholder}", self.dialect.quote(&property.dbname)));
        }
        if assignments.is_empty() {
            let id_column = self.dialect.quote("id");
            assignments.push(format!("{id_column} = {id_column}"));
        }
        let placeholder = sink.push(SqlValue::Integer(id));
        Ok(RenderedQuery {
            sql: format!(
                "UPDATE {} SET {} WHERE {} = {placeholder}",
                self.table(schema),
                assignments.join(", "),
                self.dialect.quote("id")
            ),
            params: sink.params,
        })
    }

    fn assignment(
        &self,
        property: &Property,
        update: &FieldUpdate,
        sink: &mut ParamSink<'_>,
    ) -> StoreResult<String> {
        let column = self.dialect.quote(&property.dbname);
        Ok(match update {
            FieldUpdate::Set(value) => {
                format!("{column} = {}", self.bind(self.native(property, value)?, sink))
            }
            FieldUpdate::Increment(amount) => {
                let amount = self.native(property, amount)?;
                format!("{column} = {column} + {}", sink.push(amount))
            }
            FieldUpdate::Unset => format!("{column} = NULL"),
        })
    }

    /// `UPDATE ... SET` for a validated partial row. `None` when there is
    /// nothing to change.
    pub fn update_partial(
        &self,
        schema: &Schema,
        partial: &PartialRow,
        condition: Option<&Condition>,
    ) -> StoreResult<Option<RenderedQuery>> {
        let mut sink = ParamSink::new(self.dialect());
        let mut assignments = Vec::with_capacity(partial.len());
        for (column, update) in partial {
            if column == ID_FIELD {
                continue;
            }
            let property = schema
                .property(column)
                .ok_or_else(|| StoreError::UnknownColumn(column.clone()))?;
            assignments.push(self.assignment(property, update, &mut sink)?);
        }
        if assignments.is_empty() {
            return Ok(None);
        }
        let mut sql = format!("UPDATE {} SET {}", self.table(schema), assignments.join(", "));
        self.push_where(&mut sql, schema, condition, &mut sink)?;
        Ok(Some(RenderedQuery {
            sql,
            params: sink.params,
        }))
    }

    /// Single-statement upsert, for dialects with a native clause.
    ///
    /// `insert_row` is the validated row to create when nothing conflicts;
    /// on conflict the partial's changes are applied instead.
    pub fn upsert(
        &self,
        schema: &Schema,
        insert_row: &Row,
        partial: &PartialRow,
    ) -> StoreResult<Option<RenderedQuery>> {
        let Some(clause) = self.dialect.upsert_clause() else {
            return Ok(None);
        };
        let mut insert = self.insert(schema, insert_row)?;
        let mut assignments = Vec::with_capacity(partial.len());
        for (column, update) in partial {
            let Some(property) = schema.property(column) else {
                return Err(StoreError::UnknownColumn(column.clone()));
            };
            let quoted = self.dialect.quote(&property.dbname);
            assignments.push(match update {
                FieldUpdate::Set(_) => format!("{quoted} = VALUES({quoted})"),
                FieldUpdate::Increment(_) => format!("{quoted} = {quoted} + VALUES({quoted})"),
                FieldUpdate::Unset => format!("{quoted} = NULL"),
            });
        }
        if assignments.is_empty() {
            let id_column = self.dialect.quote("id");
            assignments.push(format!("{id_column} = {id_column}"));
        }
        insert.sql = format!("{} {clause} {}", insert.sql, assignments.join(", "));
        Ok(Some(insert))
    }

    pub fn delete(&self, schema: &Schema, condition: Option<&Condition>) -> StoreResult<RenderedQuery> {
        let mut sink = ParamSink::new(self.dialect());
        let mut sql = format!("DELETE FROM {}", self.table(schema));
        self.push_where(&mut sql, schema, condition, &mut sink)?;
        Ok(RenderedQuery {
            sql,
            params: sink.params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{AnsiDialect, MySqlDialect, PostgresDialect, SqliteDialect};
    use serde_json::json;
    use tessera_core::{json_row, partial_from_row, Capabilities, GeoPoint};

    fn people() -> Schema {
        Schema::builder("people")
            .column("name", LogicalType::STRING)
            .column("age", LogicalType::Integer)
            .build(&Capabilities::sqlite())
            .unwrap()
    }

    #[test]
    fn test_insert_writes_every_column() {
        let rendered = SqlTranslator::new(AnsiDialect)
            .insert(&people(), &json_row(json!({"name": "Ann"})))
            .unwrap();

        assert_eq!(rendered.sql, r#"INSERT INTO "people" ("name", "age") VALUES (?, ?)"#);
        assert_eq!(rendered.params, vec![SqlValue::Text("Ann".into()), SqlValue::Null]);
    }

    #[test]
    fn test_insert_returning_on_postgres() {
        let rendered = SqlTranslator::new(PostgresDialect)
            .insert(&people(), &json_row(json!({"id": 4, "name": "Ann", "age": 3})))
            .unwrap();

        assert_eq!(
            rendered.sql,
            r#"INSERT INTO "people" ("id", "name", "age") VALUES ($1, $2, $3) RETURNING "id""#
        );
    }

    #[test]
    fn test_insert_without_columns() {
        let schema = Schema::builder("empty").build(&Capabilities::sqlite()).unwrap();

        assert_eq!(
            SqlTranslator::new(SqliteDialect).insert(&schema, &Row::new()).unwrap().sql,
            r#"INSERT INTO "empty" DEFAULT VALUES"#
        );
        assert_eq!(
            SqlTranslator::new(MySqlDialect::default()).insert(&schema, &Row::new()).unwrap().sql,
            "INSERT INTO `empty` () VALUES ()"
        );
    }

    #[test]
    fn test_insert_point_uses_constructor() {
        let schema = Schema::builder("places")
            .column("at", LogicalType::GeoPoint)
            .build(&Capabilities::mysql())
            .unwrap();
        let mut row = Row::new();
        row.insert("at".into(), Value::GeoPoint(GeoPoint::new(1.0, 2.0)));

        let rendered = SqlTranslator::new(MySqlDialect::default()).insert(&schema, &row).unwrap();

        assert_eq!(rendered.sql, "INSERT INTO `places` (`at`) VALUES (POINT(?, ?))");
        assert_eq!(rendered.params, vec![SqlValue::Real(1.0), SqlValue::Real(2.0)]);
    }

    #[test]
    fn test_update_requires_valid_id() {
        let translator = SqlTranslator::new(AnsiDialect);

        let rendered = translator
            .update(&people(), &json_row(json!({"id": 3, "name": "Bo"})))
            .unwrap();
        assert_eq!(
            rendered.sql,
            r#"UPDATE "people" SET "name" = ?, "age" = ? WHERE "id" = ?"#
        );
        assert_eq!(rendered.params.last(), Some(&SqlValue::Integer(3)));

        assert_eq!(
            translator.update(&people(), &json_row(json!({"name": "Bo"}))).unwrap_err(),
            StoreError::InvalidId("id".to_string())
        );
    }

    #[test]
    fn test_update_partial_with_increment_and_unset() {
        let partial = partial_from_row(json_row(json!({"age": {"$inc": 1}, "name": null})));
        let condition = Condition::parse(&Value::from(json!({"name": "Ann"}))).unwrap();

        let rendered = SqlTranslator::new(PostgresDialect)
            .update_partial(&people(), &partial, condition.as_ref())
            .unwrap()
            .unwrap();

        assert_eq!(
            rendered.sql,
            r#"UPDATE "people" SET "age" = "age" + $1, "name" = NULL WHERE "name" = $2"#
        );
        assert_eq!(
            rendered.params,
            vec![SqlValue::Integer(1), SqlValue::Text("Ann".into())]
        );
    }

    #[test]
    fn test_empty_partial_renders_nothing() {
        let rendered = SqlTranslator::new(AnsiDialect)
            .update_partial(&people(), &PartialRow::new(), None)
            .unwrap();

        assert!(rendered.is_none());
    }

    #[test]
    fn test_native_upsert_only_on_mysql() {
        let partial = partial_from_row(json_row(json!({"age": {"$inc": 2}})));
        let insert_row = json_row(json!({"name": "Ann", "age": 2}));

        let rendered = SqlTranslator::new(MySqlDialect::default())
            .upsert(&people(), &insert_row, &partial)
            .unwrap()
            .unwrap();
        assert_eq!(
            rendered.sql,
            "INSERT INTO `people` (`name`, `age`) VALUES (?, ?) ON DUPLICATE KEY UPDATE `age` = `age` + VALUES(`age`)"
        );

        assert!(SqlTranslator::new(SqliteDialect)
            .upsert(&people(), &insert_row, &partial)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_delete() {
        let condition = Condition::parse(&Value::from(json!({"age": {"lt": 5}}))).unwrap();

        let rendered = SqlTranslator::new(AnsiDialect)
            .delete(&people(), condition.as_ref())
            .unwrap();
        assert_eq!(rendered.sql, r#"DELETE FROM "people" WHERE "age" < ?"#);

        let all = SqlTranslator::new(AnsiDialect).delete(&people(), None).unwrap();
        assert_eq!(all.sql, r#"DELETE FROM "people""#);
    }
}
