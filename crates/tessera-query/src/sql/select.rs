use tessera_core::coerce::{coerce_id, normalize_scalar, SqlCodec, SqlValue, TypeCodec};
use tessera_core::{
    Condition, FieldRef, FindOptions, LogicalType, Property, QuerySpec, Row, Schema, StoreError,
    StoreResult, Value, ID_FIELD,
};

use super::filter::{aggregate_expression, aggregate_type, FilterCompiler, Namespace, ParamSink};
use super::{RenderedQuery, SqlTranslator};

/// How a selected column is decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnKind {
    Id,
    Value(Property),
    Aggregate(Option<LogicalType>),
    Distance,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    /// Key in the decoded row
    pub name: String,
    pub kind: ColumnKind,
}

/// A `SELECT` plus the recipe for turning its result rows back into [`Row`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectPlan {
    pub query: RenderedQuery,
    /// Empty for `EXPLAIN` statements, whose columns are engine-defined.
    pub columns: Vec<OutputColumn>,
}

impl SelectPlan {
    pub fn is_explain(&self) -> bool {
        self.columns.is_empty()
    }

    /// Decode one result row, positionally.
    pub fn decode_row(&self, values: Vec<SqlValue>) -> StoreResult<Row> {
        if values.len() != self.columns.len() {
            return Err(StoreError::UnexpectedResult(format!(
                "expected {} columns, got {}",
                self.columns.len(),
                values.len()
            )));
        }
        let mut row = Row::with_capacity(values.len());
        for (column, native) in self.columns.iter().zip(values) {
            let value = match &column.kind {
                ColumnKind::Id => native.into_value(),
                ColumnKind::Value(property) => {
                    SqlCodec.from_native(property, native).map_err(|reason| {
                        StoreError::UnexpectedResult(format!("column '{}' {reason}", column.name))
                    })?
                }
                ColumnKind::Aggregate(Some(ty)) if ty.is_numeric() => {
                    let raw = native.into_value();
                    normalize_scalar(LogicalType::Number, raw.clone())
                        .map(|n| match (ty, n.as_i64()) {
                            (LogicalType::Integer, Some(i)) => Value::Integer(i),
                            _ => n,
                        })
                        .unwrap_or(raw)
                }
                ColumnKind::Aggregate(Some(ty)) => {
                    let raw = native.into_value();
                    normalize_scalar(*ty, raw.clone()).unwrap_or(raw)
                }
                ColumnKind::Aggregate(None) => native.into_value(),
                ColumnKind::Distance => match native {
                    SqlValue::Integer(i) => Value::Number(i as f64),
                    other => other.into_value(),
                },
            };
            row.insert(column.name.clone(), value);
        }
        Ok(row)
    }
}

/// Name values from an engine-defined result (explain output).
pub fn raw_row(names: &[String], values: Vec<SqlValue>) -> Row {
    names
        .iter()
        .cloned()
        .zip(values.into_iter().map(SqlValue::into_value))
        .collect()
}

impl SqlTranslator {
    fn column_expr(&self, property: &Property) -> String {
        let quoted = self.dialect.quote(&property.dbname);
        if property.logical_type == LogicalType::GeoPoint && !property.is_array {
            format!("{} AS {quoted}", self.dialect.point_select(&quoted))
        } else {
            quoted
        }
    }

    fn projection(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<(Vec<String>, Vec<OutputColumn>)> {
        let mut exprs = vec![self.dialect.quote("id")];
        let mut columns = vec![OutputColumn {
            name: ID_FIELD.to_string(),
            kind: ColumnKind::Id,
        }];
        let properties: Vec<&Property> = match &spec.select {
            Some(names) => {
                let mut selected = Vec::with_capacity(names.len());
                for name in names {
                    if let FieldRef::Column(property) = schema.resolve(name)? {
                        selected.push(property);
                    }
                }
                selected
            }
            None => schema.properties().collect(),
        };
        for property in properties {
            exprs.push(self.column_expr(property));
            columns.push(OutputColumn {
                name: property.name.clone(),
                kind: ColumnKind::Value(property.clone()),
            });
        }
        Ok((exprs, columns))
    }

    fn group_projection(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<(Vec<String>, Vec<OutputColumn>)> {
        let mut exprs = Vec::new();
        let mut columns = Vec::new();
        for key in spec.group_keys() {
            match schema.resolve(key)? {
                FieldRef::Id => {
                    exprs.push(self.dialect.quote("id"));
                    columns.push(OutputColumn {
                        name: key.clone(),
                        kind: ColumnKind::Id,
                    });
                }
                FieldRef::Column(property) => {
                    exprs.push(self.column_expr(property));
                    columns.push(OutputColumn {
                        name: key.clone(),
                        kind: ColumnKind::Value(property.clone()),
                    });
                }
            }
        }
        for (name, expr) in &spec.group_fields {
            exprs.push(format!(
                "{} AS {}",
                aggregate_expression(self.dialect(), schema, expr)?,
                self.dialect.quote(name)
            ));
            columns.push(OutputColumn {
                name: name.clone(),
                kind: ColumnKind::Aggregate(aggregate_type(schema, expr)),
            });
        }
        Ok((exprs, columns))
    }

    fn group_clause(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<String> {
        let mut keys = Vec::with_capacity(spec.group_keys().len());
        for key in spec.group_keys() {
            keys.push(match schema.resolve(key)? {
                FieldRef::Id => self.dialect.quote("id"),
                FieldRef::Column(property) => self.dialect.quote(&property.dbname),
            });
        }
        Ok(if keys.is_empty() {
            String::new()
        } else {
            format!(" GROUP BY {}", keys.join(", "))
        })
    }

    /// Grouped statements: `SELECT ... WHERE ... GROUP BY ... HAVING ...`.
    fn grouped_body(
        &self,
        schema: &Schema,
        spec: &QuerySpec,
        exprs: &[String],
        sink: &mut ParamSink<'_>,
    ) -> StoreResult<String> {
        let mut sql = format!("SELECT {} FROM {}", exprs.join(", "), self.table(schema));
        self.push_where(&mut sql, schema, spec.conditions.as_ref(), sink)?;
        sql.push_str(&self.group_clause(schema, spec)?);
        if let Some(having) = &spec.conditions_of_group {
            let compiled = FilterCompiler::new(self.dialect(), Namespace::Groups(schema, spec))
                .compile(having, sink)?;
            sql.push_str(" HAVING ");
            sql.push_str(&compiled);
        }
        Ok(sql)
    }

    fn order_clause(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<String> {
        let mut terms = Vec::with_capacity(spec.orders.len() + 1);
        for order in &spec.orders {
            let expr = if spec.is_grouped() {
                if spec.group_fields.contains_key(&order.column) {
                    self.dialect.quote(&order.column)
                } else if spec.group_keys().contains(&order.column) {
                    self.resolved_column(schema, &order.column)?
                } else {
                    return Err(StoreError::UnknownColumn(order.column.clone()));
                }
            } else {
                self.resolved_column(schema, &order.column)?
            };
            terms.push(format!("{expr} {}", order.direction.sql()));
        }
        if let Some(near) = &spec.near {
            terms.push(format!("{} ASC", self.dialect.quote(&distance_alias(&near.field))));
        }
        Ok(if terms.is_empty() {
            String::new()
        } else {
            format!(" ORDER BY {}", terms.join(", "))
        })
    }

    fn resolved_column(&self, schema: &Schema, field: &str) -> StoreResult<String> {
        Ok(match schema.resolve(field)? {
            FieldRef::Id => self.dialect.quote("id"),
            FieldRef::Column(property) => self.dialect.quote(&property.dbname),
        })
    }

    fn page_clause(&self, spec: &QuerySpec) -> String {
        match (spec.limit, spec.skip) {
            (Some(limit), 0) => format!(" LIMIT {limit}"),
            (Some(limit), skip) => format!(" LIMIT {limit} OFFSET {skip}"),
            (None, 0) => String::new(),
            (None, skip) => format!(" LIMIT {} OFFSET {skip}", self.dialect.unbounded_limit()),
        }
    }

    /// Distance from `near.point`, selected under `<field>_distance`.
    fn near_column(
        &self,
        schema: &Schema,
        spec: &QuerySpec,
        sink: &mut ParamSink<'_>,
    ) -> StoreResult<Option<(String, OutputColumn)>> {
        let Some(near) = &spec.near else {
            return Ok(None);
        };
        if spec.is_grouped() {
            return Err(StoreError::unsupported("near combined with grouping"));
        }
        let property = match schema.resolve(&near.field)? {
            FieldRef::Column(property) if property.logical_type == LogicalType::GeoPoint => property,
            _ => {
                return Err(StoreError::invalid_condition(format!(
                    "'{}' is not a geopoint column",
                    near.field
                )))
            }
        };
        let constructor = self
            .dialect
            .point_constructor()
            .ok_or_else(|| StoreError::unsupported(format!("near on {}", self.dialect.name())))?;
        let x = sink.push(SqlValue::Real(near.point.x));
        let y = sink.push(SqlValue::Real(near.point.y));
        let alias = distance_alias(&near.field);
        let expr = format!(
            "{} AS {}",
            self.dialect
                .distance_function(&self.dialect.quote(&property.dbname), &format!("{constructor}({x}, {y})")),
            self.dialect.quote(&alias)
        );
        Ok(Some((
            expr,
            OutputColumn {
                name: alias,
                kind: ColumnKind::Distance,
            },
        )))
    }

    /// Build the statement for `find`/`stream`.
    pub fn select(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<SelectPlan> {
        let mut sink = ParamSink::new(self.dialect());
        let (mut exprs, mut columns, grouped) = if spec.is_grouped() {
            let (exprs, columns) = self.group_projection(schema, spec)?;
            (exprs, columns, true)
        } else {
            let (exprs, columns) = self.projection(schema, spec)?;
            (exprs, columns, false)
        };
        if let Some((expr, column)) = self.near_column(schema, spec, &mut sink)? {
            exprs.push(expr);
            columns.push(column);
        }

        let mut sql = if grouped {
            self.grouped_body(schema, spec, &exprs, &mut sink)?
        } else {
            let mut sql = format!("SELECT {} FROM {}", exprs.join(", "), self.table(schema));
            self.push_where(&mut sql, schema, spec.conditions.as_ref(), &mut sink)?;
            sql
        };
        sql.push_str(&self.order_clause(schema, spec)?);
        sql.push_str(&self.page_clause(spec));

        if spec.explain {
            sql = format!("{} {sql}", self.dialect.explain_prefix());
            columns.clear();
        }
        Ok(SelectPlan {
            query: RenderedQuery {
                sql,
                params: sink.params,
            },
            columns,
        })
    }

    /// Build the statement for `find_by_id`; `None` when `id` cannot be a key.
    pub fn select_by_id(
        &self,
        schema: &Schema,
        id: &Value,
        options: &FindOptions,
    ) -> StoreResult<Option<SelectPlan>> {
        let Some(id) = coerce_id(LogicalType::Integer, id) else {
            return Ok(None);
        };
        let spec = QuerySpec {
            conditions: Some(Condition::eq(ID_FIELD, id)),
            select: options.select.clone(),
            limit: Some(1),
            explain: options.explain,
            ..QuerySpec::default()
        };
        self.select(schema, &spec).map(Some)
    }

    /// `SELECT COUNT(*)`; grouped queries count their groups.
    pub fn count(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<RenderedQuery> {
        let mut sink = ParamSink::new(self.dialect());
        let sql = if spec.is_grouped() {
            let (exprs, _) = self.group_projection(schema, spec)?;
            let inner = self.grouped_body(schema, spec, &exprs, &mut sink)?;
            format!("SELECT COUNT(*) FROM ({inner}) AS {}", self.dialect.quote("groups"))
        } else {
            let mut sql = format!("SELECT COUNT(*) FROM {}", self.table(schema));
            self.push_where(&mut sql, schema, spec.conditions.as_ref(), &mut sink)?;
            sql
        };
        Ok(RenderedQuery {
            sql,
            params: sink.params,
        })
    }
}

fn distance_alias(field: &str) -> String {
    format!("{field}_distance")
}
