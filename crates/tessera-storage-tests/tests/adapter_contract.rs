//! Adapter contract tests
//!
//! The same operations run against every enabled backend. Condition trees
//! must select the same rows wherever the backend filters at all; identity
//! lookups, bulk inserts, upserts and error kinds must agree everywhere.

use std::collections::HashSet;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use serde_json::json;
use test_case::test_case;

use tessera_core::{
    json_row, partial_from_row, Adapter, Condition, FindOptions, GroupExpr,
    LogicalType, QuerySpec, Row, Schema, StoreError, Value,
};
use tessera_storage_tests::{
    backends, empty_people, filters, is_key_value, seeded_people, sorted_names,
};

fn condition(tree: serde_json::Value) -> Option<Condition> {
    Condition::parse(&Value::from(tree)).unwrap()
}

async fn names_matching(adapter: &dyn Adapter, schema: &Schema, tree: serde_json::Value) -> Vec<String> {
    let spec = QuerySpec::new().where_tree(tree).unwrap();
    let rows = adapter
        .find(schema, &spec)
        .await
        .unwrap_or_else(|err| panic!("{}: find failed: {err}", adapter.name()));
    sorted_names(&rows)
}

#[test_case(json!({"age": {"gte": 18}}), &["Alice", "Ann"] ; "range")]
#[test_case(json!({"or": [{"name": "Bob"}, {"age": {"gt": 25}}]}), &["Ann", "Bob"] ; "disjunction")]
#[test_case(json!({"and": [{"age": {"gt": 15}}, {"age": {"lt": 25}}]}), &["Alice", "Bob"] ; "conjunction")]
#[test_case(json!({"name": ["Ann", "Carl", "Zed"]}), &["Ann", "Carl"] ; "array membership")]
#[test_case(json!({"name": {"nin": ["Ann"]}}), &["Alice", "Bob", "Carl"] ; "negated membership")]
#[test_case(json!({"age": null}), &["Carl"] ; "null")]
#[test_case(json!({"age": {"not": null}}), &["Alice", "Ann", "Bob"] ; "not null")]
#[test_case(json!({"age": {"not": 30}}), &["Alice", "Bob", "Carl"] ; "negated equality keeps nulls")]
#[test_case(json!({"age": {"not": {"gt": 20}}}), &["Bob", "Carl"] ; "negated range keeps nulls")]
#[test_case(json!({"name": {"startswith": "A"}}), &["Alice", "Ann"] ; "prefix")]
#[test_case(json!({"name": {"contains": "L"}}), &["Alice", "Carl"] ; "substring ignores case")]
#[test_case(json!({"email": {"endswith": "@example.com"}}), &["Ann", "Bob"] ; "suffix")]
#[test_case(json!({"name": {"contains": "%"}}), &[] ; "wildcards are literal")]
#[test_case(json!({"active": true, "age": {"lt": 25}}), &["Alice"] ; "implicit and")]
#[tokio::test]
async fn test_same_tree_same_rows(tree: serde_json::Value, expected: &[&str]) {
    for adapter in backends().await {
        if !filters(adapter.as_ref()) {
            continue;
        }
        let schema = seeded_people(adapter.as_ref()).await;

        assert_eq!(
            names_matching(adapter.as_ref(), &schema, tree.clone()).await,
            expected,
            "{} disagrees on {tree}",
            adapter.name()
        );
    }
}

#[test_case(json!({"gt": 20}) ; "range")]
#[test_case(json!(30) ; "equality")]
#[test_case(json!([30, 17]) ; "membership")]
#[tokio::test]
async fn test_double_negation_is_identity(test: serde_json::Value) {
    for adapter in backends().await {
        if !filters(adapter.as_ref()) {
            continue;
        }
        let schema = seeded_people(adapter.as_ref()).await;

        let plain = names_matching(adapter.as_ref(), &schema, json!({"age": test.clone()})).await;
        let doubled = names_matching(
            adapter.as_ref(),
            &schema,
            json!({"age": {"not": {"not": test.clone()}}}),
        )
        .await;

        assert_eq!(plain, doubled, "{} on {test}", adapter.name());
    }
}

#[tokio::test]
async fn test_empty_membership() {
    for adapter in backends().await {
        let schema = seeded_people(adapter.as_ref()).await;

        assert!(
            names_matching(adapter.as_ref(), &schema, json!({"id": {"in": []}}))
                .await
                .is_empty(),
            "{}",
            adapter.name()
        );
        if filters(adapter.as_ref()) {
            assert_eq!(
                names_matching(adapter.as_ref(), &schema, json!({"age": {"nin": []}}))
                    .await
                    .len(),
                4,
                "{}",
                adapter.name()
            );
        }
    }
}

#[tokio::test]
async fn test_writes_matching_nothing_leave_rows_alone() {
    for adapter in backends().await {
        let schema = seeded_people(adapter.as_ref()).await;
        let nobody = condition(json!({"name": "nobody"}));

        let affected = adapter
            .update_partial(
                &schema,
                partial_from_row(json_row(json!({"age": 1}))),
                nobody.as_ref(),
            )
            .await
            .unwrap();
        let removed = adapter.delete(&schema, nobody.as_ref()).await.unwrap();

        assert_eq!((affected, removed), (0, 0), "{}", adapter.name());
        assert_eq!(
            adapter.count(&schema, &QuerySpec::new()).await.unwrap(),
            4,
            "{}",
            adapter.name()
        );
    }
}

#[tokio::test]
async fn test_identity_lookups() {
    for adapter in backends().await {
        let schema = empty_people(adapter.as_ref()).await;
        let ann = adapter
            .create(&schema, json_row(json!({"name": "Ann"})))
            .await
            .unwrap();
        let bob = adapter
            .create(&schema, json_row(json!({"name": "Bob"})))
            .await
            .unwrap();

        let row = adapter
            .find_by_id(&schema, &Value::from(bob.clone()), &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(row["name"], Value::from("Bob"), "{}", adapter.name());
        assert_eq!(row["id"], Value::from(bob.clone()), "{}", adapter.name());

        let mut tree = Row::new();
        tree.insert(
            "id".to_string(),
            Value::Array(vec![Value::from(ann), Value::from(bob)]),
        );
        let spec = QuerySpec::new().where_tree(Value::Object(tree)).unwrap();
        let rows = adapter.find(&schema, &spec).await.unwrap();
        assert_eq!(sorted_names(&rows), ["Ann", "Bob"], "{}", adapter.name());

        assert_eq!(
            adapter
                .find_by_id(&schema, &Value::from("nope"), &FindOptions::default())
                .await
                .unwrap_err(),
            StoreError::NotFound,
            "{}",
            adapter.name()
        );
    }
}

#[test_case(0 ; "empty")]
#[test_case(1 ; "single")]
#[test_case(1000 ; "one full chunk")]
#[test_case(1001 ; "chunk plus one")]
#[test_case(2500 ; "several chunks")]
#[tokio::test]
async fn test_bulk_sizes(size: usize) {
    for adapter in backends().await {
        let schema = empty_people(adapter.as_ref()).await;
        let rows: Vec<Row> = (0..size)
            .map(|i| json_row(json!({"name": format!("p{i}"), "age": i})))
            .collect();

        let ids = adapter.create_bulk(&schema, rows).await.unwrap();

        assert_eq!(ids.len(), size, "{}", adapter.name());
        assert_eq!(
            ids.iter().collect::<HashSet<_>>().len(),
            size,
            "{} returned duplicate ids",
            adapter.name()
        );
        assert_eq!(
            adapter.count(&schema, &QuerySpec::new()).await.unwrap(),
            size as u64,
            "{}",
            adapter.name()
        );
        if let Some(last) = ids.last() {
            let row = adapter
                .find_by_id(&schema, &Value::from(last.clone()), &FindOptions::default())
                .await
                .unwrap();
            assert_eq!(row["name"], Value::from(format!("p{}", size - 1)), "{}", adapter.name());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_upserts_converge() {
    for adapter in backends().await {
        let schema = empty_people(adapter.as_ref()).await;
        let key = condition(json!({"email": "race@example.com"}));

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let adapter = Arc::clone(&adapter);
                let schema = schema.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    let partial = partial_from_row(json_row(json!({"name": format!("racer {i}")})));
                    adapter.upsert(&schema, partial, key.as_ref()).await
                })
            })
            .collect();
        for task in tasks {
            task.await
                .unwrap()
                .unwrap_or_else(|err| panic!("{}: upsert failed: {err}", adapter.name()));
        }

        // Key-value upserts match on identity only, so every one inserts.
        let expected = if is_key_value(adapter.as_ref()) { 8 } else { 1 };
        assert_eq!(
            adapter.count(&schema, &QuerySpec::new()).await.unwrap(),
            expected,
            "{}",
            adapter.name()
        );
    }
}

#[tokio::test]
async fn test_increment_on_identity_condition() {
    for adapter in backends().await {
        let schema = seeded_people(adapter.as_ref()).await;
        let bob = adapter
            .find(&schema, &QuerySpec::new())
            .await
            .unwrap()
            .into_iter()
            .find(|row| row["name"] == Value::from("Bob"))
            .unwrap();
        let mut tree = Row::new();
        tree.insert("id".to_string(), bob["id"].clone());
        let key = Condition::parse(&Value::Object(tree)).unwrap();

        let affected = adapter
            .update_partial(
                &schema,
                partial_from_row(json_row(json!({"age": {"$inc": 2}}))),
                key.as_ref(),
            )
            .await
            .unwrap();

        assert_eq!(affected, 1, "{}", adapter.name());
        let row = adapter
            .find_by_id(&schema, &bob["id"], &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(row["age"], Value::Integer(19), "{}", adapter.name());
    }
}

#[tokio::test]
async fn test_group_sum() {
    for adapter in backends().await {
        let staff = Schema::builder("staff")
            .column("dept", LogicalType::STRING)
            .column("salary", LogicalType::Integer)
            .build(adapter.capabilities())
            .unwrap();
        adapter.create_table(&staff).await.unwrap();
        let rows = [("eng", 100), ("eng", 150), ("ops", 70)]
            .into_iter()
            .map(|(dept, salary)| json_row(json!({"dept": dept, "salary": salary})))
            .collect();
        adapter.create_bulk(&staff, rows).await.unwrap();
        let spec = QuerySpec::new()
            .group_by(["dept"])
            .group_field("total", GroupExpr::Sum("salary".into()))
            .order("dept");

        let result = adapter.find(&staff, &spec).await;

        if is_key_value(adapter.as_ref()) {
            assert!(matches!(result, Err(StoreError::Unsupported(_))));
            continue;
        }
        assert_eq!(
            result.unwrap(),
            vec![
                json_row(json!({"dept": "eng", "total": 250})),
                json_row(json!({"dept": "ops", "total": 70})),
            ],
            "{}",
            adapter.name()
        );
    }
}

#[tokio::test]
async fn test_error_kinds_agree() {
    for adapter in backends().await {
        let schema = seeded_people(adapter.as_ref()).await;

        assert_eq!(
            adapter
                .create(&schema, json_row(json!({"age": 1})))
                .await
                .unwrap_err(),
            StoreError::ColumnRequired("name".to_string()),
            "{}",
            adapter.name()
        );

        let mut stream = adapter.stream(Arc::new(schema.clone()), QuerySpec::new().order("nope"));
        assert_eq!(
            stream.next().await,
            Some(Err(StoreError::UnknownColumn("nope".to_string()))),
            "{}",
            adapter.name()
        );

        if !is_key_value(adapter.as_ref()) {
            assert_eq!(
                adapter
                    .create(&schema, json_row(json!({"name": "Ann 2", "email": "ann@example.com"})))
                    .await
                    .unwrap_err(),
                StoreError::DuplicateKey("email".to_string()),
                "{}",
                adapter.name()
            );
        }
    }
}

#[tokio::test]
async fn test_stream_matches_find() {
    for adapter in backends().await {
        let schema = Arc::new(seeded_people(adapter.as_ref()).await);

        let streamed: Vec<Row> = adapter
            .stream(Arc::clone(&schema), QuerySpec::new())
            .try_collect()
            .await
            .unwrap();
        let found = adapter.find(&schema, &QuerySpec::new()).await.unwrap();

        assert_eq!(sorted_names(&streamed), sorted_names(&found), "{}", adapter.name());
        assert_eq!(streamed.len(), 4, "{}", adapter.name());
    }
}

#[tokio::test]
async fn test_drop_removes_rows() {
    for adapter in backends().await {
        let schema = seeded_people(adapter.as_ref()).await;

        adapter.drop_table("people").await.unwrap();

        assert!(
            !adapter.list_tables().await.unwrap().contains(&"people".to_string()),
            "{}",
            adapter.name()
        );
        if let Ok(rows) = adapter.find(&schema, &QuerySpec::new()).await {
            assert!(rows.is_empty(), "{}", adapter.name());
        }
    }
}
