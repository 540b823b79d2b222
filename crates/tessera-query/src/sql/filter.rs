//! Predicate compiler shared by `WHERE` and `HAVING`.

use tessera_core::coerce::{coerce_id, normalize_scalar, SqlValue};
use tessera_core::{
    Condition, FieldRef, GroupExpr, LogicalType, QuerySpec, Schema, StoreError, StoreResult, Test,
    Value,
};

use super::dialect::SqlDialect;

/// Parameters collected while rendering one statement.
pub(crate) struct ParamSink<'d> {
    dialect: &'d dyn SqlDialect,
    pub(crate) params: Vec<SqlValue>,
}

impl<'d> ParamSink<'d> {
    pub(crate) fn new(dialect: &'d dyn SqlDialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    /// Record a parameter and return its placeholder.
    pub(crate) fn push(&mut self, value: SqlValue) -> String {
        self.params.push(value);
        self.dialect.placeholder(self.params.len())
    }
}

/// Where field names in a condition are looked up.
#[derive(Clone, Copy)]
pub(crate) enum Namespace<'a> {
    /// Table columns, for `WHERE`
    Table(&'a Schema),
    /// Group keys and group fields, for `HAVING`
    Groups(&'a Schema, &'a QuerySpec),
}

/// A resolved left-hand side.
struct Operand {
    field: String,
    expr: String,
    ty: Option<LogicalType>,
    is_id: bool,
}

pub(crate) fn aggregate_expression(
    dialect: &dyn SqlDialect,
    schema: &Schema,
    expr: &GroupExpr,
) -> StoreResult<String> {
    let column = |name: &str| -> StoreResult<String> {
        Ok(match schema.resolve(name)? {
            FieldRef::Id => dialect.quote("id"),
            FieldRef::Column(property) => dialect.quote(&property.dbname),
        })
    };
    Ok(match expr {
        GroupExpr::Count => "COUNT(*)".to_string(),
        GroupExpr::Sum(name) => format!("SUM({})", column(name)?),
        GroupExpr::Min(name) => format!("MIN({})", column(name)?),
        GroupExpr::Max(name) => format!("MAX({})", column(name)?),
    })
}

/// Logical type produced by an aggregate.
pub(crate) fn aggregate_type(schema: &Schema, expr: &GroupExpr) -> Option<LogicalType> {
    match expr {
        GroupExpr::Count => Some(LogicalType::Integer),
        other => other
            .column()
            .and_then(|name| schema.resolve(name).ok())
            .map(|field| field.logical_type(schema.key_type())),
    }
}

pub(crate) struct FilterCompiler<'a, 'd> {
    dialect: &'d dyn SqlDialect,
    namespace: Namespace<'a>,
}

impl<'a, 'd> FilterCompiler<'a, 'd> {
    pub(crate) fn new(dialect: &'d dyn SqlDialect, namespace: Namespace<'a>) -> Self {
        Self { dialect, namespace }
    }

    /// Render a condition. The outermost group is not parenthesized.
    pub(crate) fn compile(&self, condition: &Condition, sink: &mut ParamSink<'_>) -> StoreResult<String> {
        self.compile_node(condition, sink, false)
    }

    fn compile_node(
        &self,
        condition: &Condition,
        sink: &mut ParamSink<'_>,
        nested: bool,
    ) -> StoreResult<String> {
        match condition {
            Condition::Group {
                conjunction,
                children,
            } => {
                let mut parts = Vec::with_capacity(children.len());
                for child in children {
                    parts.push(self.compile_node(child, sink, true)?);
                }
                let joined = parts.join(&format!(" {} ", conjunction.sql()));
                Ok(if nested && parts.len() > 1 {
                    format!("({joined})")
                } else {
                    joined
                })
            }
            Condition::Predicate(predicate) => {
                let operand = self.resolve(&predicate.field)?;
                self.compile_test(&operand, &predicate.test, sink)
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
                return Ok(Operand {
                    field: field.to_string(),
                    expr: aggregate_expression(self.dialect, schema, expr)?,
                    ty: aggregate_type(schema, expr),
                    is_id: false,
                });
            }
            if !spec.group_keys().iter().any(|key| key == field) {
                return Err(StoreError::UnknownColumn(field.to_string()));
            }
        }

        Ok(match schema.resolve(field)? {
            FieldRef::Id => Operand {
                field: field.to_string(),
                expr: self.dialect.quote("id"),
                ty: Some(schema.key_type()),
                is_id: true,
            },
            FieldRef::Column(property) => Operand {
                field: field.to_string(),
                expr: self.dialect.quote(&property.dbname),
                ty: (!property.is_array).then_some(property.logical_type),
                is_id: false,
            },
        })
    }

    fn compile_test(&self, operand: &Operand, test: &Test, sink: &mut ParamSink<'_>) -> StoreResult<String> {
        let column = &operand.expr;
        Ok(match test {
            Test::Eq(Value::Null) => format!("{column} IS NULL"),
            Test::Eq(value) => format!("{column} = {}", sink.push(self.coerce(operand, value)?)),
            Test::Ne(Value::Null) => format!("{column} IS NOT NULL"),
            Test::Ne(value) => {
                let placeholder = sink.push(self.coerce(operand, value)?);
                format!("(NOT ({column} = {placeholder}) OR {column} IS NULL)")
            }
            Test::Gt(value) => format!("{column} > {}", sink.push(self.coerce(operand, value)?)),
            Test::Lt(value) => format!("{column} < {}", sink.push(self.coerce(operand, value)?)),
            Test::Gte(value) => format!("{column} >= {}", sink.push(self.coerce(operand, value)?)),
            Test::Lte(value) => format!("{column} <= {}", sink.push(self.coerce(operand, value)?)),
            Test::In(values) if values.is_empty() => self.dialect.false_literal().to_string(),
            Test::In(values) => format!("{column} IN ({})", self.push_all(operand, values, sink)?),
            Test::Nin(values) if values.is_empty() => self.dialect.true_literal().to_string(),
            Test::Nin(values) => format!(
                "({column} NOT IN ({}) OR {column} IS NULL)",
                self.push_all(operand, values, sink)?
            ),
            Test::Contains(values) if values.is_empty() => self.dialect.false_literal().to_string(),
            Test::Contains(values) => {
                let mut parts = Vec::with_capacity(values.len());
                for value in values {
                    let pattern = format!("%{}%", escape_like(&text_operand(operand, value)?));
                    parts.push(self.like(column, pattern, sink));
                }
                if parts.len() == 1 {
                    parts.remove(0)
                } else {
                    format!("({})", parts.join(" OR "))
                }
            }
            Test::StartsWith(value) => {
                let pattern = format!("{}%", escape_like(&text_operand(operand, value)?));
                self.like(column, pattern, sink)
            }
            Test::EndsWith(value) => {
                let pattern = format!("%{}", escape_like(&text_operand(operand, value)?));
                self.like(column, pattern, sink)
            }
            Test::Regex(pattern) => {
                let operator = self
                    .dialect
                    .regex_operator()
                    .ok_or_else(|| StoreError::unsupported(format!("regex on {}", self.dialect.name())))?;
                let placeholder = sink.push(SqlValue::Text(self.dialect.regex_param(pattern)));
                format!("{column} {operator} {placeholder}")
            }
            Test::Not(inner) => match inner.as_ref() {
                Test::Eq(_) | Test::Ne(_) | Test::In(_) | Test::Nin(_) | Test::Not(_) => {
                    return self.compile_test(operand, &inner.as_ref().clone().negate(), sink)
                }
                other => {
                    let inner = self.compile_test(operand, other, sink)?;
                    format!("(NOT ({inner}) OR {column} IS NULL)")
                }
            },
        })
    }

    fn like(&self, column: &str, pattern: String, sink: &mut ParamSink<'_>) -> String {
        let placeholder = sink.push(SqlValue::Text(pattern));
        format!(
            "{column} {} {placeholder}{}",
            self.dialect.like_operator(),
            self.dialect.like_escape()
        )
    }

    fn push_all(&self, operand: &Operand, values: &[Value], sink: &mut ParamSink<'_>) -> StoreResult<String> {
        let mut placeholders = Vec::with_capacity(values.len());
        for value in values {
            placeholders.push(sink.push(self.coerce(operand, value)?));
        }
        Ok(placeholders.join(", "))
    }

    /// Type-directed operand coercion.
    ///
    /// Invalid numeric operands clamp to a sentinel so the filter matches
    /// nothing instead of failing; invalid ids are rejected.
    fn coerce(&self, operand: &Operand, value: &Value) -> StoreResult<SqlValue> {
        if value.is_null() {
            return Ok(SqlValue::Null);
        }
        if operand.is_id || operand.ty == Some(LogicalType::RecordId) {
            return match coerce_id(LogicalType::Integer, value).and_then(|id| id.as_i64()) {
                Some(id) => Ok(SqlValue::Integer(id)),
                None => Err(StoreError::InvalidId(operand.field.clone())),
            };
        }
        match operand.ty {
            Some(LogicalType::Number) => Ok(SqlValue::Real(
                normalize_scalar(LogicalType::Number, value.clone())
                    .ok()
                    .and_then(|n| n.as_f64())
                    .unwrap_or(f64::MAX),
            )),
            Some(LogicalType::Integer) => Ok(SqlValue::Integer(
                normalize_scalar(LogicalType::Integer, value.clone())
                    .ok()
                    .and_then(|i| i.as_i64())
                    .unwrap_or(i64::from(i32::MIN)),
            )),
            Some(LogicalType::Date) => match normalize_scalar(LogicalType::Date, value.clone()) {
                Ok(Value::Date(date)) => Ok(SqlValue::Timestamp(date)),
                _ => Err(StoreError::invalid_condition(format!(
                    "'{}' is not a date: {value}",
                    operand.field
                ))),
            },
            _ => raw_param(&operand.field, value),
        }
    }
}

fn raw_param(field: &str, value: &Value) -> StoreResult<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Bool(*b),
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Number(n) => SqlValue::Real(*n),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Date(d) => SqlValue::Timestamp(*d),
        Value::Object(_) | Value::Array(_) => SqlValue::Json(value.to_json().to_string()),
        Value::GeoPoint(_) | Value::Regex(_) => {
            return Err(StoreError::invalid_condition(format!(
                "'{field}' cannot be compared with a {}",
                value.type_name()
            )))
        }
    })
}

fn text_operand(operand: &Operand, value: &Value) -> StoreResult<String> {
    value.to_text().ok_or_else(|| {
        StoreError::invalid_condition(format!("'{}' pattern must be text", operand.field))
    })
}

/// Escape `LIKE` wildcards with backslash.
pub fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
