//! Partial updates.

use indexmap::IndexMap;

use crate::condition::Condition;
use crate::value::{Row, Value};

/// Change applied to one column by `update_partial`/`upsert`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Set(Value),
    /// Atomic `column = column + amount`
    Increment(Value),
    Unset,
}

/// Ordered column → change map.
pub type PartialRow = IndexMap<String, FieldUpdate>;

impl From<Value> for FieldUpdate {
    /// `{"$inc": n}` is an increment marker, `null` unsets, anything else sets.
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Unset,
            Value::Object(map) if map.len() == 1 && map.contains_key("$inc") => {
                Self::Increment(map.into_values().next().unwrap_or(Value::Null))
            }
            other => Self::Set(other),
        }
    }
}

/// Interpret a row of plain values as a partial update.
pub fn partial_from_row(row: Row) -> PartialRow {
    row.into_iter()
        .map(|(column, value)| (column, FieldUpdate::from(value)))
        .collect()
}

/// Row inserted when an upsert matches nothing: equality predicates of the
/// conditions, then set values and increment amounts.
pub fn upsert_insert_row(partial: &PartialRow, conditions: Option<&Condition>) -> Row {
    let mut row = Row::new();
    if let Some(conditions) = conditions {
        for (field, value) in conditions.equalities() {
            row.insert(field.to_string(), value.clone());
        }
    }
    for (column, update) in partial {
        match update {
            FieldUpdate::Set(value) | FieldUpdate::Increment(value) => {
                row.insert(column.clone(), value.clone());
            }
            FieldUpdate::Unset => {
                row.shift_remove(column);
            }
        }
    }
    row.shift_remove(crate::schema::ID_FIELD);
    row
}
