//! Key enumeration for stores without a query language.
//!
//! Only identity predicates select records: `id = v` and `id in [...]`
//! become explicit keys. Any other predicate is logged and selects no keys,
//! so a filter without an identity branch touches nothing.

use indexmap::IndexSet;
use tracing::warn;

use tessera_core::coerce::coerce_id;
use tessera_core::{Condition, LogicalType, Schema, StoreError, StoreResult, Test, Value, ID_FIELD};

use crate::ConditionTranslator;

/// Counter key handing out ids for `table`.
pub fn counter_key(table: &str) -> String {
    format!("{table}:_lastid")
}

/// Key of one record.
pub fn record_key(table: &str, id: i64) -> String {
    format!("{table}:{id}")
}

/// Glob matching every key of `table`.
pub fn table_pattern(table: &str) -> String {
    format!("{table}:*")
}

/// Which keys a read or write touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPlan {
    /// Scan the keyspace with a glob pattern
    All { pattern: String },
    /// Exactly these keys, deduplicated, in first-mention order
    Keys(Vec<String>),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeyspaceTranslator;

impl KeyspaceTranslator {
    fn keys_of(&self, schema: &Schema, condition: &Condition) -> StoreResult<IndexSet<String>> {
        match condition {
            Condition::Predicate(predicate) => {
                let ids: &[Value] = match (&predicate.field[..], &predicate.test) {
                    (ID_FIELD, Test::Eq(value)) => std::slice::from_ref(value),
                    (ID_FIELD, Test::In(values)) => values,
                    (field, test) => {
                        warn!(
                            table = schema.table(),
                            field,
                            operator = %test.operator(),
                            "Key-value backend cannot filter on this predicate; it selects no keys"
                        );
                        return Ok(IndexSet::new());
                    }
                };
                let mut keys = IndexSet::with_capacity(ids.len());
                for id in ids {
                    let id = coerce_id(LogicalType::Integer, id)
                        .and_then(|id| id.as_i64())
                        .ok_or_else(|| StoreError::InvalidId(predicate.field.clone()))?;
                    keys.insert(record_key(schema.table(), id));
                }
                Ok(keys)
            }
            Condition::Group { children, .. } => {
                let mut union = IndexSet::new();
                for child in children {
                    union.extend(self.keys_of(schema, child)?);
                }
                Ok(union)
            }
        }
    }
}

impl ConditionTranslator for KeyspaceTranslator {
    type Output = KeyPlan;

    fn name(&self) -> &str {
        "keyspace"
    }

    fn translate(&self, schema: &Schema, condition: Option<&Condition>) -> StoreResult<KeyPlan> {
        Ok(match condition {
            Some(condition) => KeyPlan::Keys(self.keys_of(schema, condition)?.into_iter().collect()),
            None => KeyPlan::All {
                pattern: table_pattern(schema.table()),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::Capabilities;
    use tracing_test::traced_test;

    fn plan(tree: serde_json::Value) -> StoreResult<KeyPlan> {
        let schema = Schema::builder("users")
            .column("name", LogicalType::STRING)
            .build(&Capabilities::key_value())
            .unwrap();
        let condition = Condition::parse(&Value::from(tree))?;
        KeyspaceTranslator.translate(&schema, condition.as_ref())
    }

    fn keys(names: &[&str]) -> KeyPlan {
        KeyPlan::Keys(names.iter().map(|name| name.to_string()).collect())
    }

    #[test]
    fn test_no_condition_scans_table() {
        assert_eq!(
            plan(json!({})).unwrap(),
            KeyPlan::All {
                pattern: "users:*".to_string()
            }
        );
    }

    #[test]
    fn test_identity_predicates() {
        assert_eq!(plan(json!({"id": 4})).unwrap(), keys(&["users:4"]));
        assert_eq!(plan(json!({"id": [1, "2", 1]})).unwrap(), keys(&["users:1", "users:2"]));
        assert_eq!(plan(json!({"id": {"in": []}})).unwrap(), keys(&[]));
    }

    #[test]
    fn test_branches_are_unioned() {
        assert_eq!(
            plan(json!({"or": [{"id": 1}, {"id": [2, 1]}]})).unwrap(),
            keys(&["users:1", "users:2"])
        );
    }

    #[test]
    #[traced_test]
    fn test_unsupported_predicates_select_nothing() {
        assert_eq!(
            plan(json!({"id": 3, "name": "x"})).unwrap(),
            keys(&["users:3"])
        );
        assert_eq!(plan(json!({"name": {"startswith": "x"}})).unwrap(), keys(&[]));
        assert_eq!(plan(json!({"name": "x"})).unwrap(), keys(&[]));
        assert_eq!(
            plan(json!({"or": [{"name": "x"}, {"id": 2}]})).unwrap(),
            keys(&["users:2"])
        );
        assert!(logs_contain("cannot filter on this predicate"));
    }

    #[test]
    fn test_invalid_id() {
        assert_eq!(
            plan(json!({"id": "abc"})).unwrap_err(),
            StoreError::InvalidId("id".to_string())
        );
    }
}
