//! Adapter contract
//!
//! The uniform operation surface every backend implements on top of its
//! translator. One adapter owns one backend connection and moves through
//! [`ConnectionState`]s:
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected --close--> Closed
//!                               |
//!                               +--error--> Disconnected
//! ```
//!
//! Every data and schema operation requires `Connected`.
//!
//! # Example
//!
//! ```ignore
//! use tessera_core::{Adapter, Condition, QuerySpec};
//!
//! async fn adults(adapter: &dyn Adapter, schema: &Schema) -> StoreResult<Vec<Row>> {
//!     let spec = QuerySpec::new()
//!         .where_tree(json!({"age": {"gte": 18}}))?
//!         .order("-age")
//!         .limit(10);
//!     adapter.find(schema, &spec).await
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream, Stream, StreamExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::condition::Condition;
use crate::error::{StoreError, StoreResult};
use crate::query::{FindOptions, QuerySpec};
use crate::schema::{
    ForeignKeyDescriptor, IndexDescriptor, Property, Schema, SchemaDescriptor, TableDescriptor,
};
use crate::types::Capabilities;
use crate::update::{upsert_insert_row, PartialRow};
use crate::value::{RecordId, Row, Value};

/// Rows per round-trip for backends with payload limits.
pub const BULK_CHUNK_SIZE: usize = 1000;

/// Lazy, finite, non-restartable sequence of rows.
pub type RowStream = Pin<Box<dyn Stream<Item = StoreResult<Row>> + Send>>;

/// table → index name → column → 1
pub type IndexListing = IndexMap<String, IndexMap<String, IndexMap<String, i32>>>;

/// table → column → referenced table
pub type ForeignKeyListing = IndexMap<String, IndexMap<String, String>>;

// ============================================================================
// Connection state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Shared connection state machine used by every adapter.
#[derive(Debug)]
pub struct ConnectionCell {
    state: Mutex<ConnectionState>,
}

impl Default for ConnectionCell {
    fn default() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }
}

impl ConnectionCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Run `attempt` as the Connecting phase.
    ///
    /// Connecting an already connected cell is a no-op; a closed cell can
    /// never reconnect.
    pub async fn connect<F, Fut>(&self, backend: &str, attempt: F) -> StoreResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<()>>,
    {
        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
                other => return Err(StoreError::NotConnected(other)),
            }
        }

        match attempt().await {
            Ok(()) => {
                *self.state.lock() = ConnectionState::Connected;
                info!(backend, "Connected");
                Ok(())
            }
            Err(err) => {
                *self.state.lock() = ConnectionState::Disconnected;
                warn!(backend, error = %err, "Connect attempt failed");
                Err(err)
            }
        }
    }

    pub fn close(&self) {
        *self.state.lock() = ConnectionState::Closed;
    }

    pub fn ensure_connected(&self) -> StoreResult<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            other => Err(StoreError::NotConnected(other)),
        }
    }
}

// ============================================================================
// Streams and bulk helpers
// ============================================================================

/// A stream whose only event is `err`.
pub fn error_stream(err: StoreError) -> RowStream {
    stream::once(async move { Err(err) }).boxed()
}

/// A stream over rows already in memory.
pub fn rows_stream(rows: Vec<Row>) -> RowStream {
    stream::iter(rows.into_iter().map(Ok)).boxed()
}

/// Run `insert` over consecutive chunks of `rows`, strictly in order.
///
/// A failing chunk stops the sequence: earlier chunks stay committed and
/// later ones are never attempted.
pub async fn insert_in_chunks<F, Fut>(
    rows: Vec<Row>,
    chunk_size: usize,
    mut insert: F,
) -> StoreResult<Vec<RecordId>>
where
    F: FnMut(Vec<Row>) -> Fut,
    Fut: Future<Output = StoreResult<Vec<RecordId>>>,
{
    let mut ids = Vec::with_capacity(rows.len());
    let mut remaining = rows.into_iter().peekable();
    let mut chunk_index = 0usize;
    while remaining.peek().is_some() {
        let chunk: Vec<Row> = remaining.by_ref().take(chunk_size.max(1)).collect();
        let expected = chunk.len();
        let inserted = insert(chunk).await?;
        if inserted.len() != expected {
            return Err(StoreError::UnexpectedResult(format!(
                "chunk {chunk_index} returned {} ids for {expected} rows",
                inserted.len()
            )));
        }
        ids.extend(inserted);
        chunk_index += 1;
    }
    debug!(chunks = chunk_index, rows = ids.len(), "Bulk insert finished");
    Ok(ids)
}

// ============================================================================
// Adapter trait
// ============================================================================

/// Operations every backend provides.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Short backend name used in logs
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> &Capabilities;

    fn state(&self) -> ConnectionState;

    async fn connect(&self) -> StoreResult<()>;

    /// Release the connection. Terminal.
    async fn close(&self) -> StoreResult<()>;

    // ---- writes ----

    async fn create(&self, schema: &Schema, row: Row) -> StoreResult<RecordId>;

    /// Insert many rows, returning ids in input order.
    ///
    /// The default inserts one row at a time.
    async fn create_bulk(&self, schema: &Schema, rows: Vec<Row>) -> StoreResult<Vec<RecordId>> {
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(self.create(schema, row).await?);
        }
        Ok(ids)
    }

    /// Replace every column of the row identified by `row["id"]`.
    async fn update(&self, schema: &Schema, row: Row) -> StoreResult<()>;

    /// Apply only the supplied fields to every matching row.
    async fn update_partial(
        &self,
        schema: &Schema,
        partial: PartialRow,
        conditions: Option<&Condition>,
    ) -> StoreResult<u64>;

    /// Update matching rows, or insert one when nothing matches.
    ///
    /// The default runs `update_partial`, falls back to `create`, and retries
    /// `update_partial` once when `create` loses a duplicate-key race.
    async fn upsert(
        &self,
        schema: &Schema,
        partial: PartialRow,
        conditions: Option<&Condition>,
    ) -> StoreResult<()> {
        let affected = self
            .update_partial(schema, partial.clone(), conditions)
            .await?;
        if affected > 0 {
            return Ok(());
        }

        let row = upsert_insert_row(&partial, conditions);
        match self.create(schema, row).await {
            Ok(_) => Ok(()),
            Err(StoreError::DuplicateKey(key)) => {
                debug!(table = schema.table(), %key, "Upsert lost insert race, updating instead");
                self.update_partial(schema, partial, conditions).await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn delete(&self, schema: &Schema, conditions: Option<&Condition>) -> StoreResult<u64>;

    // ---- reads ----

    /// Fails with `NotFound` when absent or when `id` is not a valid id.
    async fn find_by_id(&self, schema: &Schema, id: &Value, options: &FindOptions) -> StoreResult<Row>;

    async fn find(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<Vec<Row>>;

    /// Rows are produced on demand; translation errors arrive as the first item.
    fn stream(&self, schema: Arc<Schema>, spec: QuerySpec) -> RowStream;

    async fn count(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<u64>;

    // ---- schema ----

    async fn list_tables(&self) -> StoreResult<Vec<String>>;

    async fn describe_schema(&self, table: &str) -> StoreResult<TableDescriptor>;

    async fn list_indexes(&self) -> StoreResult<IndexListing>;

    async fn list_foreign_keys(&self) -> StoreResult<ForeignKeyListing>;

    /// Everything introspection knows, in one descriptor.
    async fn introspect(&self) -> StoreResult<SchemaDescriptor> {
        let mut descriptor = SchemaDescriptor::default();
        for table in self.list_tables().await? {
            let columns = self.describe_schema(&table).await?;
            descriptor.tables.insert(table, columns);
        }
        descriptor.indexes = self.list_indexes().await?;
        descriptor.foreign_keys = self.list_foreign_keys().await?;
        Ok(descriptor)
    }

    /// Create the table with its columns, indexes and foreign keys.
    async fn create_table(&self, schema: &Schema) -> StoreResult<()>;

    async fn add_column(&self, schema: &Schema, property: &Property) -> StoreResult<()>;

    async fn create_index(&self, schema: &Schema, index: &IndexDescriptor) -> StoreResult<()>;

    async fn create_foreign_key(&self, schema: &Schema, foreign_key: &ForeignKeyDescriptor) -> StoreResult<()>;

    /// Remove the table and all its rows.
    async fn drop_table(&self, table: &str) -> StoreResult<()>;
}

#[async_trait]
impl<T: Adapter + ?Sized> Adapter for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn capabilities(&self) -> &Capabilities {
        (**self).capabilities()
    }

    fn state(&self) -> ConnectionState {
        (**self).state()
    }

    async fn connect(&self) -> StoreResult<()> {
        (**self).connect().await
    }

    async fn close(&self) -> StoreResult<()> {
        (**self).close().await
    }

    async fn create(&self, schema: &Schema, row: Row) -> StoreResult<RecordId> {
        (**self).create(schema, row).await
    }

    async fn create_bulk(&self, schema: &Schema, rows: Vec<Row>) -> StoreResult<Vec<RecordId>> {
        (**self).create_bulk(schema, rows).await
    }

    async fn update(&self, schema: &Schema, row: Row) -> StoreResult<()> {
        (**self).update(schema, row).await
    }

    async fn update_partial(
        &self,
        schema: &Schema,
        partial: PartialRow,
        conditions: Option<&Condition>,
    ) -> StoreResult<u64> {
        (**self).update_partial(schema, partial, conditions).await
    }

    async fn upsert(
        &self,
        schema: &Schema,
        partial: PartialRow,
        conditions: Option<&Condition>,
    ) -> StoreResult<()> {
        (**self).upsert(schema, partial, conditions).await
    }

    async fn delete(&self, schema: &Schema, conditions: Option<&Condition>) -> StoreResult<u64> {
        (**self).delete(schema, conditions).await
    }

    async fn find_by_id(&self, schema: &Schema, id: &Value, options: &FindOptions) -> StoreResult<Row> {
        (**self).find_by_id(schema, id, options).await
    }

    async fn find(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<Vec<Row>> {
        (**self).find(schema, spec).await
    }

    fn stream(&self, schema: Arc<Schema>, spec: QuerySpec) -> RowStream {
        (**self).stream(schema, spec)
    }

    async fn count(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<u64> {
        (**self).count(schema, spec).await
    }

    async fn list_tables(&self) -> StoreResult<Vec<String>> {
        (**self).list_tables().await
    }

    async fn describe_schema(&self, table: &str) -> StoreResult<TableDescriptor> {
        (**self).describe_schema(table).await
    }

    async fn list_indexes(&self) -> StoreResult<IndexListing> {
        (**self).list_indexes().await
    }

    async fn list_foreign_keys(&self) -> StoreResult<ForeignKeyListing> {
        (**self).list_foreign_keys().await
    }

    async fn introspect(&self) -> StoreResult<SchemaDescriptor> {
        (**self).introspect().await
    }

    async fn create_table(&self, schema: &Schema) -> StoreResult<()> {
        (**self).create_table(schema).await
    }

    async fn add_column(&self, schema: &Schema, property: &Property) -> StoreResult<()> {
        (**self).add_column(schema, property).await
    }

    async fn create_index(&self, schema: &Schema, index: &IndexDescriptor) -> StoreResult<()> {
        (**self).create_index(schema, index).await
    }

    async fn create_foreign_key(&self, schema: &Schema, foreign_key: &ForeignKeyDescriptor) -> StoreResult<()> {
        (**self).create_foreign_key(schema, foreign_key).await
    }

    async fn drop_table(&self, table: &str) -> StoreResult<()> {
        (**self).drop_table(table).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_connect_transitions() {
        let cell = ConnectionCell::new();
        assert_eq!(cell.state(), ConnectionState::Disconnected);
        assert!(cell.ensure_connected().is_err());

        cell.connect("test", || async { Ok(()) }).await.unwrap();
        assert_eq!(cell.state(), ConnectionState::Connected);
        assert!(cell.ensure_connected().is_ok());

        cell.close();
        assert_eq!(
            cell.ensure_connected().unwrap_err(),
            StoreError::NotConnected(ConnectionState::Closed)
        );
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_disconnected() {
        let cell = ConnectionCell::new();

        let err = cell
            .connect("test", || async {
                Err(StoreError::ConnectionFailure("refused".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::ConnectionFailure(_)));
        assert_eq!(cell.state(), ConnectionState::Disconnected);
        cell.connect("test", || async { Ok(()) }).await.unwrap();
        assert_eq!(cell.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_closed_cell_cannot_reconnect() {
        let cell = ConnectionCell::new();
        cell.close();

        let err = cell.connect("test", || async { Ok(()) }).await.unwrap_err();

        assert_eq!(err, StoreError::NotConnected(ConnectionState::Closed));
    }

    #[tokio::test]
    async fn test_chunks_run_in_order() {
        let rows: Vec<Row> = (0..2500)
            .map(|i| Row::from([("n".to_string(), Value::Integer(i))]))
            .collect();
        let mut sizes = Vec::new();

        let ids = insert_in_chunks(rows, BULK_CHUNK_SIZE, |chunk| {
            sizes.push(chunk.len());
            let ids = chunk
                .iter()
                .map(|row| RecordId::Integer(row["n"].as_i64().unwrap_or_default()))
                .collect();
            async move { Ok(ids) }
        })
        .await
        .unwrap();

        assert_eq!(sizes, [1000, 1000, 500]);
        assert_eq!(ids.len(), 2500);
        assert!(ids.windows(2).all(|pair| pair[0].as_i64() < pair[1].as_i64()));
    }

    #[tokio::test]
    async fn test_failed_chunk_stops_sequence() {
        let rows: Vec<Row> = (0..2500).map(|_| Row::new()).collect();
        let mut attempts = 0;

        let err = insert_in_chunks(rows, BULK_CHUNK_SIZE, |chunk| {
            attempts += 1;
            let fail = attempts == 2;
            let ids = (0..chunk.len() as i64).map(RecordId::Integer).collect();
            async move {
                if fail {
                    Err(StoreError::DuplicateKey("email".into()))
                } else {
                    Ok(ids)
                }
            }
        })
        .await
        .unwrap_err();

        assert!(err.is_duplicate());
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_empty_bulk_makes_no_round_trip() {
        let mut calls = 0;

        let ids = insert_in_chunks(Vec::new(), BULK_CHUNK_SIZE, |_| {
            calls += 1;
            async { Ok(Vec::new()) }
        })
        .await
        .unwrap();

        assert!(ids.is_empty());
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn test_error_stream_yields_one_error() {
        let items: Vec<StoreResult<Row>> = error_stream(StoreError::NotFound).collect().await;

        assert_eq!(items, vec![Err(StoreError::NotFound)]);
        let rows: Vec<Row> = rows_stream(vec![Row::new()]).try_collect().await.unwrap();
        assert_eq!(rows.len(), 1);
    }
}
