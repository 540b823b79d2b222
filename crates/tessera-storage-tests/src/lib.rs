//! Shared fixtures for the cross-backend contract tests.
//!
//! Every enabled backend gets the same schema and the same rows, so a
//! condition tree can be checked for the same result everywhere it is
//! supported.

use std::sync::Arc;

use serde_json::json;

use tessera_core::{
    json_row, Adapter, BackendFamily, Capabilities, IndexDescriptor, LogicalType, Property, Row,
    Schema,
};

/// The people every seeded backend holds.
pub fn people_rows() -> Vec<Row> {
    [
        json!({"name": "Ann", "age": 30, "email": "ann@example.com", "active": true}),
        json!({"name": "Bob", "age": 17, "email": "bob@example.com", "active": false}),
        json!({"name": "Alice", "age": 22, "active": true}),
        json!({"name": "Carl"}),
    ]
    .into_iter()
    .map(json_row)
    .collect()
}

/// People schema finalized for one backend.
pub fn people(capabilities: &Capabilities) -> Schema {
    Schema::builder("people")
        .property(Property::new("name", LogicalType::STRING).required())
        .column("email", LogicalType::STRING)
        .column("age", LogicalType::Integer)
        .column("active", LogicalType::Boolean)
        .index(IndexDescriptor::new(["email"]).unique())
        .build(capabilities)
        .expect("people schema is valid on every backend")
}

/// Connected adapters for every enabled backend, each with its own store.
pub async fn backends() -> Vec<Arc<dyn Adapter>> {
    let mut adapters: Vec<Arc<dyn Adapter>> = Vec::new();

    #[cfg(feature = "sqlite")]
    adapters.push(Arc::new(tessera_sqlite::SqliteAdapter::memory()));

    #[cfg(feature = "document")]
    adapters.push(Arc::new(tessera_document::DocumentAdapter::memory(
        tessera_config::DocumentSettings {
            database: "contract".to_string(),
            ..Default::default()
        },
    )));

    #[cfg(feature = "keyvalue")]
    adapters.push(Arc::new(tessera_keyvalue::KeyValueAdapter::memory(
        tessera_config::KeyValueSettings::default(),
    )));

    for adapter in &adapters {
        adapter
            .connect()
            .await
            .unwrap_or_else(|err| panic!("{} failed to connect: {err}", adapter.name()));
    }
    adapters
}

/// Create the people table on `adapter` and return its schema.
pub async fn empty_people(adapter: &dyn Adapter) -> Schema {
    let schema = people(adapter.capabilities());
    adapter
        .create_table(&schema)
        .await
        .unwrap_or_else(|err| panic!("{}: create_table failed: {err}", adapter.name()));
    schema
}

/// Create the people table on `adapter` and insert [`people_rows`].
pub async fn seeded_people(adapter: &dyn Adapter) -> Schema {
    let schema = empty_people(adapter).await;
    adapter
        .create_bulk(&schema, people_rows())
        .await
        .unwrap_or_else(|err| panic!("{}: seeding failed: {err}", adapter.name()));
    schema
}

/// Whether `adapter` evaluates conditions beyond id lookups.
pub fn filters(adapter: &dyn Adapter) -> bool {
    adapter.capabilities().filtering
}

pub fn is_key_value(adapter: &dyn Adapter) -> bool {
    adapter.capabilities().family == BackendFamily::KeyValue
}

/// Names of `rows`, sorted, so backends with different natural orders
/// compare equal.
pub fn sorted_names(rows: &[Row]) -> Vec<String> {
    let mut names: Vec<String> = rows
        .iter()
        .filter_map(|row| row.get("name").and_then(|name| name.as_str()))
        .map(str::to_string)
        .collect();
    names.sort();
    names
}
