//! # Tessera Query
//!
//! Translators from a [`Condition`] tree and a [`QuerySpec`] to the native
//! query form of each backend family.
//!
//! ```text
//! Condition / QuerySpec
//!        │
//!        ├── sql::SqlTranslator       → RenderedQuery { sql, params }
//!        ├── document::DocumentTranslator → bson filters and pipelines
//!        └── keyspace::KeyspaceTranslator → KeyPlan
//! ```
//!
//! [`QuerySpec`]: tessera_core::QuerySpec

pub mod document;
pub mod keyspace;
pub mod sql;

pub use document::{DocumentTranslator, FindPlan, UpdatePlan};
pub use keyspace::{KeyPlan, KeyspaceTranslator};
pub use sql::{RenderedQuery, SelectPlan, SqlDialect, SqlTranslator};

use tessera_core::{Condition, Schema, StoreResult};

/// Translates a condition tree into one backend family's filter form.
pub trait ConditionTranslator: Send + Sync {
    type Output;

    /// Unique name for this translator
    fn name(&self) -> &str;

    /// Translate `condition`; `None` means "match everything".
    fn translate(&self, schema: &Schema, condition: Option<&Condition>) -> StoreResult<Self::Output>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::{Capabilities, LogicalType, Value};

    #[test]
    fn test_translators_share_one_condition() {
        let schema = Schema::builder("people")
            .column("age", LogicalType::Integer)
            .build(&Capabilities::sqlite())
            .unwrap();
        let condition = Condition::parse(&Value::from(json!({"age": {"gt": 18}}))).unwrap();

        let sql = SqlTranslator::new(sql::AnsiDialect)
            .translate(&schema, condition.as_ref())
            .unwrap();
        let document = DocumentTranslator
            .translate(&schema, condition.as_ref())
            .unwrap();

        assert_eq!(sql.sql, r#""age" > ?"#);
        assert_eq!(document, bson::doc! {"age": {"$gt": 18}});
    }
}
