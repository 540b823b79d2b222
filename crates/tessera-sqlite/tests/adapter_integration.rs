//! Integration tests for the SQLite adapter
//!
//! Every test runs against a real SQLite database, in memory unless it checks
//! persistence.

use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use serde_json::json;
use tempfile::TempDir;

use tessera_config::SqliteSettings;
use tessera_core::value::parse_timestamp;
use tessera_core::{
    json_row, partial_from_row, Adapter, Capabilities, Condition, FindOptions, ForeignKeyDescriptor,
    GroupExpr, IndexDescriptor, LogicalType, OnDelete, Property, QuerySpec, RecordId, Row, Schema,
    StoreError, Value,
};
use tessera_sqlite::SqliteAdapter;

fn people() -> Schema {
    Schema::builder("people")
        .property(Property::new("name", LogicalType::String { max_len: Some(64) }).required())
        .column("email", LogicalType::STRING)
        .column("age", LogicalType::Integer)
        .column("score", LogicalType::Number)
        .column("active", LogicalType::Boolean)
        .column("born", LogicalType::Date)
        .column("meta", LogicalType::Object)
        .property(Property::new("tags", LogicalType::Integer).array())
        .index(IndexDescriptor::new(["email"]).unique().named("people_email"))
        .build(&Capabilities::sqlite())
        .unwrap()
}

fn condition(tree: serde_json::Value) -> Option<Condition> {
    Condition::parse(&Value::from(tree)).unwrap()
}

fn names(rows: &[Row]) -> Vec<String> {
    rows.iter()
        .map(|row| row["name"].as_str().unwrap_or_default().to_string())
        .collect()
}

/// Setup helper: connected in-memory adapter with the people table
async fn setup() -> (SqliteAdapter, Schema) {
    let adapter = SqliteAdapter::memory();
    adapter.connect().await.unwrap();
    let schema = people();
    adapter.create_table(&schema).await.unwrap();
    (adapter, schema)
}

/// Setup helper: four people with distinct names and ages
async fn setup_with_people() -> (SqliteAdapter, Schema) {
    let (adapter, schema) = setup().await;
    for person in [
        json!({"name": "Ann", "age": 30, "email": "ann@example.com"}),
        json!({"name": "Bob", "age": 17, "email": "bob@example.com"}),
        json!({"name": "Alice", "age": 22}),
        json!({"name": "Carl"}),
    ] {
        adapter.create(&schema, json_row(person)).await.unwrap();
    }
    (adapter, schema)
}

#[tokio::test]
async fn test_round_trip_every_type() {
    let (adapter, schema) = setup().await;
    let born = parse_timestamp("1990-01-02T03:04:05.123Z").unwrap();
    let mut row = json_row(json!({
        "name": "Ann",
        "age": i32::MIN,
        "score": 0.1,
        "active": true,
        "meta": {"k": [1, 2]},
        "tags": [1, 2, 3]
    }));
    row.insert("born".to_string(), Value::Date(born));

    let id = adapter.create(&schema, row).await.unwrap();
    let stored = adapter
        .find_by_id(&schema, &Value::from(id), &FindOptions::default())
        .await
        .unwrap();

    assert_eq!(stored["age"], Value::Integer(i64::from(i32::MIN)));
    assert_eq!(stored["score"], Value::Number(0.1));
    assert_eq!(stored["active"], Value::Bool(true));
    assert_eq!(stored["born"], Value::Date(born));
    assert_eq!(stored["meta"], Value::from(json!({"k": [1, 2]})));
    assert_eq!(stored["tags"], Value::from(json!([1, 2, 3])));
    assert_eq!(stored["email"], Value::Null);
}

#[tokio::test]
async fn test_ids_are_sequential() {
    let (adapter, schema) = setup().await;

    let first = adapter.create(&schema, json_row(json!({"name": "a"}))).await.unwrap();
    let second = adapter.create(&schema, json_row(json!({"name": "b"}))).await.unwrap();

    assert_eq!(first, RecordId::Integer(1));
    assert_eq!(second, RecordId::Integer(2));
}

#[tokio::test]
async fn test_missing_required_column() {
    let (adapter, schema) = setup().await;

    let err = adapter
        .create(&schema, json_row(json!({"age": 3})))
        .await
        .unwrap_err();

    assert_eq!(err, StoreError::ColumnRequired("name".to_string()));
}

#[tokio::test]
async fn test_unique_index_reports_column() {
    let (adapter, schema) = setup_with_people().await;

    let err = adapter
        .create(&schema, json_row(json!({"name": "Ann 2", "email": "ann@example.com"})))
        .await
        .unwrap_err();

    assert_eq!(err, StoreError::DuplicateKey("email".to_string()));
}

#[tokio::test]
async fn test_validation_failures_are_aggregated() {
    let (adapter, schema) = setup().await;

    let err = adapter
        .create(&schema, json_row(json!({"name": "x", "age": "abc", "active": "yes"})))
        .await
        .unwrap_err();

    let StoreError::Validation(fields) = err else {
        panic!("expected a validation error, got {err:?}");
    };
    let failed: Vec<&str> = fields.iter().map(|field| field.field.as_str()).collect();
    assert_eq!(failed, ["age", "active"]);
}

#[tokio::test]
async fn test_find_with_conditions_order_and_paging() {
    let (adapter, schema) = setup_with_people().await;

    let spec = QuerySpec::new()
        .where_tree(json!({"age": {"gt": 18}, "name": {"startswith": "A"}}))
        .unwrap()
        .order("name");
    assert_eq!(names(&adapter.find(&schema, &spec).await.unwrap()), ["Alice", "Ann"]);

    let spec = QuerySpec::new().order("-age").skip(1).limit(2);
    assert_eq!(names(&adapter.find(&schema, &spec).await.unwrap()), ["Alice", "Bob"]);

    let spec = QuerySpec::new().order("name").skip(3);
    assert_eq!(names(&adapter.find(&schema, &spec).await.unwrap()), ["Carl"]);
}

#[tokio::test]
async fn test_null_and_negation() {
    let (adapter, schema) = setup_with_people().await;

    let spec = QuerySpec::new().where_tree(json!({"age": null})).unwrap();
    assert_eq!(names(&adapter.find(&schema, &spec).await.unwrap()), ["Carl"]);

    let spec = QuerySpec::new()
        .where_tree(json!({"age": {"not": 30}}))
        .unwrap()
        .order("name");
    assert_eq!(
        names(&adapter.find(&schema, &spec).await.unwrap()),
        ["Alice", "Bob", "Carl"]
    );

    let spec = QuerySpec::new()
        .where_tree(json!({"age": {"not": {"gt": 20}}}))
        .unwrap()
        .order("name");
    assert_eq!(names(&adapter.find(&schema, &spec).await.unwrap()), ["Bob", "Carl"]);
}

#[tokio::test]
async fn test_pattern_predicates() {
    let (adapter, schema) = setup_with_people().await;

    let spec = QuerySpec::new()
        .where_tree(json!({"name": {"contains": "L"}}))
        .unwrap()
        .order("name");
    assert_eq!(names(&adapter.find(&schema, &spec).await.unwrap()), ["Alice", "Carl"]);

    let spec = QuerySpec::new().where_tree(json!({"name": {"endswith": "b"}})).unwrap();
    assert_eq!(names(&adapter.find(&schema, &spec).await.unwrap()), ["Bob"]);

    let spec = QuerySpec::new()
        .where_tree(json!({"email": {"contains": "_"}}))
        .unwrap();
    assert!(adapter.find(&schema, &spec).await.unwrap().is_empty());

    let spec = QuerySpec::new()
        .filter(Condition::predicate(
            "name",
            tessera_core::Test::Regex(tessera_core::Pattern::new("^a").ignore_case()),
        ))
        .order("name");
    assert_eq!(names(&adapter.find(&schema, &spec).await.unwrap()), ["Alice", "Ann"]);
}

#[tokio::test]
async fn test_empty_membership_matches_nothing() {
    let (adapter, schema) = setup_with_people().await;

    let spec = QuerySpec::new().where_tree(json!({"id": {"in": []}})).unwrap();
    assert!(adapter.find(&schema, &spec).await.unwrap().is_empty());

    let spec = QuerySpec::new().where_tree(json!({"age": {"nin": []}})).unwrap();
    assert_eq!(adapter.find(&schema, &spec).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_find_by_id_misses() {
    let (adapter, schema) = setup_with_people().await;
    let options = FindOptions::default();

    for id in [Value::Integer(99), Value::from("abc")] {
        let err = adapter.find_by_id(&schema, &id, &options).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound);
    }
}

#[tokio::test]
async fn test_find_by_id_projection() {
    let (adapter, schema) = setup_with_people().await;
    let options = FindOptions {
        select: Some(vec!["name".to_string()]),
        explain: false,
    };

    let row = adapter.find_by_id(&schema, &Value::from("2"), &options).await.unwrap();

    assert_eq!(row, json_row(json!({"id": 2, "name": "Bob"})));
}

#[tokio::test]
async fn test_update_replaces_row() {
    let (adapter, schema) = setup_with_people().await;

    adapter
        .update(&schema, json_row(json!({"id": 1, "name": "Anna"})))
        .await
        .unwrap();
    let row = adapter
        .find_by_id(&schema, &Value::Integer(1), &FindOptions::default())
        .await
        .unwrap();

    assert_eq!(row["name"], Value::from("Anna"));
    assert_eq!(row["age"], Value::Null);
    assert_eq!(
        adapter
            .update(&schema, json_row(json!({"id": 42, "name": "x"})))
            .await
            .unwrap_err(),
        StoreError::NotFound
    );
}

#[tokio::test]
async fn test_partial_update_and_increment() {
    let (adapter, schema) = setup_with_people().await;

    let affected = adapter
        .update_partial(
            &schema,
            partial_from_row(json_row(json!({"age": {"$inc": 1}, "active": true}))),
            condition(json!({"age": {"lt": 25}})).as_ref(),
        )
        .await
        .unwrap();

    assert_eq!(affected, 2);
    let spec = QuerySpec::new().where_tree(json!({"active": true})).unwrap().order("age");
    let rows = adapter.find(&schema, &spec).await.unwrap();
    assert_eq!(names(&rows), ["Bob", "Alice"]);
    assert_eq!(rows[0]["age"], Value::Integer(18));
    assert_eq!(rows[1]["age"], Value::Integer(23));
}

#[tokio::test]
async fn test_upsert_inserts_then_updates() {
    let (adapter, schema) = setup().await;
    let key = condition(json!({"email": "dee@example.com"}));
    let partial = partial_from_row(json_row(json!({"name": "Dee", "age": {"$inc": 5}})));

    adapter.upsert(&schema, partial.clone(), key.as_ref()).await.unwrap();
    adapter.upsert(&schema, partial, key.as_ref()).await.unwrap();

    let spec = QuerySpec::new().filter(key.clone().unwrap());
    let rows = adapter.find(&schema, &spec).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["age"], Value::Integer(10));
}

#[tokio::test]
async fn test_concurrent_upserts_converge() {
    let (adapter, schema) = setup().await;
    let adapter = Arc::new(adapter);
    let key = condition(json!({"email": "race@example.com"}));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let adapter = Arc::clone(&adapter);
            let schema = schema.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let partial = partial_from_row(json_row(json!({"name": "Racer"})));
                adapter.upsert(&schema, partial, key.as_ref()).await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(adapter.count(&schema, &QuerySpec::new()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_delete_reports_removed_rows() {
    let (adapter, schema) = setup_with_people().await;

    let removed = adapter
        .delete(&schema, condition(json!({"age": {"lt": 25}})).as_ref())
        .await
        .unwrap();

    assert_eq!(removed, 2);
    assert_eq!(adapter.delete(&schema, None).await.unwrap(), 2);
    assert_eq!(adapter.count(&schema, &QuerySpec::new()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_group_sum_per_key() {
    let adapter = SqliteAdapter::memory();
    adapter.connect().await.unwrap();
    let staff = Schema::builder("staff")
        .column("dept", LogicalType::STRING)
        .column("salary", LogicalType::Integer)
        .build(&Capabilities::sqlite())
        .unwrap();
    adapter.create_table(&staff).await.unwrap();
    let rows = [("eng", 100), ("eng", 150), ("ops", 70), ("sales", 40), ("sales", 60)]
        .into_iter()
        .map(|(dept, salary)| json_row(json!({"dept": dept, "salary": salary})))
        .collect();
    adapter.create_bulk(&staff, rows).await.unwrap();

    let spec = QuerySpec::new()
        .group_by(["dept"])
        .group_field("total", GroupExpr::Sum("salary".into()))
        .order("dept");
    let groups = adapter.find(&staff, &spec).await.unwrap();

    assert_eq!(
        groups,
        vec![
            json_row(json!({"dept": "eng", "total": 250})),
            json_row(json!({"dept": "ops", "total": 70})),
            json_row(json!({"dept": "sales", "total": 100})),
        ]
    );

    let having = spec.having_tree(json!({"total": {"gte": 100}})).unwrap();
    assert_eq!(adapter.count(&staff, &having).await.unwrap(), 2);
}

#[tokio::test]
async fn test_bulk_preserves_order_across_chunks() {
    let (adapter, schema) = setup().await;
    let rows: Vec<Row> = (0..2500)
        .map(|i| json_row(json!({"name": format!("p{i}"), "age": i})))
        .collect();

    let ids = adapter.create_bulk(&schema, rows).await.unwrap();

    assert_eq!(ids.len(), 2500);
    assert!(ids.windows(2).all(|pair| pair[0].as_i64() < pair[1].as_i64()));
    let last = adapter
        .find_by_id(&schema, &Value::from(ids[2499].clone()), &FindOptions::default())
        .await
        .unwrap();
    assert_eq!(last["age"], Value::Integer(2499));
}

#[tokio::test]
async fn test_failed_chunk_keeps_earlier_chunks() {
    let (adapter, schema) = setup().await;
    let mut rows: Vec<Row> = (0..1500)
        .map(|i| json_row(json!({"name": format!("p{i}")})))
        .collect();
    rows[1200] = json_row(json!({"age": 1}));

    let err = adapter.create_bulk(&schema, rows).await.unwrap_err();

    assert_eq!(err, StoreError::ColumnRequired("name".to_string()));
    assert_eq!(adapter.count(&schema, &QuerySpec::new()).await.unwrap(), 1000);
}

#[tokio::test]
async fn test_stream_yields_rows_lazily() {
    let (adapter, schema) = setup_with_people().await;
    let schema = Arc::new(schema);

    let rows: Vec<Row> = adapter
        .stream(Arc::clone(&schema), QuerySpec::new().order("name"))
        .try_collect()
        .await
        .unwrap();
    assert_eq!(names(&rows), ["Alice", "Ann", "Bob", "Carl"]);

    let mut partial = adapter.stream(Arc::clone(&schema), QuerySpec::new());
    assert!(partial.next().await.is_some());
    drop(partial);
    assert_eq!(adapter.count(&schema, &QuerySpec::new()).await.unwrap(), 4);
}

#[tokio::test]
async fn test_stream_reports_translation_errors_as_items() {
    let (adapter, schema) = setup().await;

    let mut stream = adapter.stream(Arc::new(schema), QuerySpec::new().order("nope"));

    assert_eq!(
        stream.next().await,
        Some(Err(StoreError::UnknownColumn("nope".to_string())))
    );
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_introspection() {
    let (adapter, people) = setup().await;
    let posts = Schema::builder("posts")
        .column("title", LogicalType::Text)
        .column("author", LogicalType::RecordId)
        .foreign_key(ForeignKeyDescriptor::new("author", "people", OnDelete::Restrict))
        .build(&Capabilities::sqlite())
        .unwrap();
    adapter.create_table(&posts).await.unwrap();
    adapter
        .add_column(&people, &Property::new("nickname", LogicalType::Text))
        .await
        .unwrap();

    assert_eq!(adapter.list_tables().await.unwrap(), ["people", "posts"]);

    let columns = adapter.describe_schema("people").await.unwrap();
    assert_eq!(columns["name"].logical_type, Some(LogicalType::String { max_len: Some(64) }));
    assert!(columns["name"].required);
    assert!(!columns["age"].required);
    assert_eq!(columns["nickname"].logical_type, Some(LogicalType::Text));

    let descriptor = adapter.introspect().await.unwrap();
    assert_eq!(descriptor.indexes["people"]["people_email"]["email"], 1);
    assert_eq!(descriptor.foreign_keys["posts"]["author"], "people");
    assert_eq!(
        adapter.describe_schema("missing").await.unwrap_err(),
        StoreError::TableNotFound("missing".to_string())
    );
}

#[tokio::test]
async fn test_create_table_twice_is_harmless() {
    let (adapter, schema) = setup().await;

    adapter.create_table(&schema).await.unwrap();

    assert_eq!(adapter.list_indexes().await.unwrap()["people"].len(), 1);
}

#[tokio::test]
async fn test_foreign_key_restricts_delete() {
    let (adapter, people) = setup_with_people().await;
    let fk = ForeignKeyDescriptor::new("author", "people", OnDelete::Restrict);
    let posts = Schema::builder("posts")
        .column("author", LogicalType::RecordId)
        .foreign_key(fk.clone())
        .build(&Capabilities::sqlite())
        .unwrap();
    adapter.create_table(&posts).await.unwrap();
    adapter.create_foreign_key(&posts, &fk).await.unwrap();
    adapter
        .create(&posts, json_row(json!({"author": 1})))
        .await
        .unwrap();

    let err = adapter
        .delete(&people, condition(json!({"id": 1})).as_ref())
        .await
        .unwrap_err();

    assert_eq!(err, StoreError::IntegrityViolation);
}

#[tokio::test]
async fn test_drop_table() {
    let (adapter, schema) = setup_with_people().await;

    adapter.drop_table("people").await.unwrap();

    assert!(adapter.list_tables().await.unwrap().is_empty());
    assert_eq!(
        adapter.find(&schema, &QuerySpec::new()).await.unwrap_err(),
        StoreError::TableNotFound("people".to_string())
    );
}

#[tokio::test]
async fn test_file_database_persists() {
    let dir = TempDir::new().unwrap();
    let settings = SqliteSettings::new(dir.path().join("app.db"));
    let schema = people();

    let first = SqliteAdapter::new(settings.clone());
    first.connect().await.unwrap();
    first.create_table(&schema).await.unwrap();
    first.create(&schema, json_row(json!({"name": "Ann"}))).await.unwrap();
    first.close().await.unwrap();

    let second = SqliteAdapter::new(settings);
    second.connect().await.unwrap();
    let rows = second.find(&schema, &QuerySpec::new()).await.unwrap();

    assert_eq!(names(&rows), ["Ann"]);
}
