//! One condition tree rendered by every SQL dialect.

use serde_json::json;
use test_case::test_case;

use tessera_core::coerce::SqlValue;
use tessera_core::{Capabilities, Condition, LogicalType, Schema, Value};
use tessera_query::sql::{AnsiDialect, MySqlDialect, PostgresDialect, SqliteDialect};
use tessera_query::{ConditionTranslator, RenderedQuery, SqlTranslator};

fn people() -> Schema {
    Schema::builder("people")
        .column("name", LogicalType::STRING)
        .column("age", LogicalType::Integer)
        .build(&Capabilities::sqlite())
        .unwrap()
}

fn render(translator: SqlTranslator, tree: serde_json::Value) -> RenderedQuery {
    let condition = Condition::parse(&Value::from(tree)).unwrap();
    translator.translate(&people(), condition.as_ref()).unwrap()
}

#[test_case(SqlTranslator::new(AnsiDialect), r#""name" LIKE ? AND "age" > ?"# ; "ansi")]
#[test_case(SqlTranslator::new(PostgresDialect), r#""name" ILIKE $1 AND "age" > $2"# ; "postgres")]
#[test_case(SqlTranslator::new(MySqlDialect::default()), "`name` LIKE ? AND `age` > ?" ; "mysql")]
#[test_case(SqlTranslator::new(SqliteDialect), r#""name" LIKE ? ESCAPE '\' AND "age" > ?"# ; "sqlite")]
fn test_same_tree_every_dialect(translator: SqlTranslator, expected: &str) {
    let rendered = render(translator, json!({"name": {"startswith": "A"}, "age": {"gt": 18}}));

    assert_eq!(rendered.sql, expected);
    assert_eq!(
        rendered.params,
        vec![SqlValue::Text("A%".to_string()), SqlValue::Integer(18)]
    );
}

#[test_case(SqlTranslator::new(AnsiDialect), "FALSE" ; "ansi")]
#[test_case(SqlTranslator::new(PostgresDialect), "FALSE" ; "postgres")]
#[test_case(SqlTranslator::new(MySqlDialect::default()), "FALSE" ; "mysql")]
#[test_case(SqlTranslator::new(SqliteDialect), "0" ; "sqlite")]
fn test_empty_membership_literal(translator: SqlTranslator, expected: &str) {
    let rendered = render(translator, json!({"age": {"in": []}}));

    assert_eq!(rendered.sql, expected);
    assert!(rendered.params.is_empty());
}
