//! [`Adapter`] over an embedded SQLite database.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use rusqlite::{params_from_iter, Connection};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use tessera_config::SqliteSettings;
use tessera_core::coerce::{validate_partial, validate_row};
use tessera_core::{
    error_stream, insert_in_chunks, Adapter, Capabilities, Condition, ConnectionCell,
    ConnectionState, FindOptions, ForeignKeyDescriptor, ForeignKeyListing, IndexDescriptor,
    IndexListing, PartialRow, Property, QuerySpec, RecordId, Row, RowStream, Schema, StoreError,
    StoreResult, TableDescriptor, Value, BULK_CHUNK_SIZE,
};
use tessera_query::sql::{raw_row, SqliteDialect};
use tessera_query::{RenderedQuery, SelectPlan, SqlTranslator};

use crate::connection::SqlitePool;
use crate::error::{SqliteError, SqliteResult};
use crate::introspect;
use crate::statement::{self, ResultSet};

/// SQL adapter for SQLite.
///
/// Statements run one at a time on a single connection, each inside
/// `spawn_blocking`.
pub struct SqliteAdapter {
    settings: SqliteSettings,
    capabilities: Capabilities,
    translator: SqlTranslator,
    cell: ConnectionCell,
    pool: RwLock<Option<SqlitePool>>,
}

impl SqliteAdapter {
    pub fn new(settings: SqliteSettings) -> Self {
        Self {
            settings,
            capabilities: Capabilities::sqlite(),
            translator: SqlTranslator::new(SqliteDialect),
            cell: ConnectionCell::new(),
            pool: RwLock::new(None),
        }
    }

    /// Adapter over a private in-memory database.
    pub fn memory() -> Self {
        Self::new(SqliteSettings::memory())
    }

    pub fn translator(&self) -> &SqlTranslator {
        &self.translator
    }

    fn pool(&self) -> StoreResult<SqlitePool> {
        self.cell.ensure_connected()?;
        self.pool
            .read()
            .clone()
            .ok_or_else(|| StoreError::NotConnected(self.cell.state()))
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> SqliteResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool()?;
        tokio::task::spawn_blocking(move || pool.with_connection_mut(f))
            .await
            .map_err(SqliteError::from)?
            .map_err(Into::into)
    }

    async fn execute(&self, query: RenderedQuery) -> StoreResult<usize> {
        self.run(move |conn| statement::execute(conn, &query)).await
    }

    async fn select(&self, plan: SelectPlan) -> StoreResult<Vec<Row>> {
        let query = plan.query.clone();
        let ResultSet { columns, rows } = self.run(move |conn| statement::query(conn, &query)).await?;
        if plan.is_explain() {
            return Ok(rows.into_iter().map(|values| raw_row(&columns, values)).collect());
        }
        rows.into_iter().map(|values| plan.decode_row(values)).collect()
    }
}

fn insert_row(conn: &Connection, query: &RenderedQuery) -> SqliteResult<RecordId> {
    if statement::execute(conn, query)? == 0 {
        return Err(SqliteError::Unexpected("insert returned no id".to_string()));
    }
    Ok(RecordId::Integer(conn.last_insert_rowid()))
}

#[async_trait]
impl Adapter for SqliteAdapter {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn state(&self) -> ConnectionState {
        self.cell.state()
    }

    async fn connect(&self) -> StoreResult<()> {
        self.cell
            .connect(self.name(), || async {
                let settings = self.settings.clone();
                let pool = tokio::task::spawn_blocking(move || SqlitePool::new(settings))
                    .await
                    .map_err(SqliteError::from)??;
                *self.pool.write() = Some(pool);
                Ok(())
            })
            .await
    }

    async fn close(&self) -> StoreResult<()> {
        self.cell.close();
        self.pool.write().take();
        info!(backend = self.name(), "Closed");
        Ok(())
    }

    async fn create(&self, schema: &Schema, row: Row) -> StoreResult<RecordId> {
        let row = validate_row(schema, &row)?;
        let query = self.translator.insert(schema, &row)?;
        let id = self.run(move |conn| insert_row(conn, &query)).await?;
        debug!(table = schema.table(), %id, "Created row");
        Ok(id)
    }

    /// Chunks of [`BULK_CHUNK_SIZE`] rows, each chunk in its own transaction.
    async fn create_bulk(&self, schema: &Schema, rows: Vec<Row>) -> StoreResult<Vec<RecordId>> {
        insert_in_chunks(rows, BULK_CHUNK_SIZE, |chunk| async move {
            let mut queries = Vec::with_capacity(chunk.len());
            for row in &chunk {
                let row = validate_row(schema, row)?;
                queries.push(self.translator.insert(schema, &row)?);
            }
            self.run(move |conn| {
                let tx = conn.transaction()?;
                let ids = queries
                    .iter()
                    .map(|query| insert_row(&tx, query))
                    .collect::<SqliteResult<Vec<_>>>()?;
                tx.commit()?;
                Ok(ids)
            })
            .await
        })
        .await
    }

    async fn update(&self, schema: &Schema, row: Row) -> StoreResult<()> {
        let row = validate_row(schema, &row)?;
        let query = self.translator.update(schema, &row)?;
        match self.execute(query).await? {
            0 => Err(StoreError::NotFound),
            _ => Ok(()),
        }
    }

    async fn update_partial(
        &self,
        schema: &Schema,
        partial: PartialRow,
        conditions: Option<&Condition>,
    ) -> StoreResult<u64> {
        let partial = validate_partial(schema, &partial)?;
        let Some(query) = self.translator.update_partial(schema, &partial, conditions)? else {
            return Ok(0);
        };
        let affected = self.execute(query).await?;
        debug!(table = schema.table(), affected, "Partial update");
        Ok(affected as u64)
    }

    async fn delete(&self, schema: &Schema, conditions: Option<&Condition>) -> StoreResult<u64> {
        let query = self.translator.delete(schema, conditions)?;
        let removed = self.execute(query).await?;
        debug!(table = schema.table(), removed, "Deleted rows");
        Ok(removed as u64)
    }

    async fn find_by_id(&self, schema: &Schema, id: &Value, options: &FindOptions) -> StoreResult<Row> {
        let Some(plan) = self.translator.select_by_id(schema, id, options)? else {
            return Err(StoreError::NotFound);
        };
        self.select(plan)
            .await?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound)
    }

    async fn find(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<Vec<Row>> {
        let plan = self.translator.select(schema, spec)?;
        let rows = self.select(plan).await?;
        debug!(table = schema.table(), count = rows.len(), "Found rows");
        Ok(rows)
    }

    /// The connection stays locked until the stream is drained or dropped.
    fn stream(&self, schema: Arc<Schema>, spec: QuerySpec) -> RowStream {
        let prepared = self
            .pool()
            .and_then(|pool| Ok((pool, self.translator.select(&schema, &spec)?)));
        let (pool, plan) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => return error_stream(err),
        };

        let (tx, rx) = mpsc::channel(1);
        tokio::task::spawn_blocking(move || {
            let produced = pool.with_connection(|conn| {
                let mut stmt = conn.prepare(&plan.query.sql)?;
                let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
                let params = plan
                    .query
                    .params
                    .iter()
                    .map(statement::to_sqlite)
                    .collect::<SqliteResult<Vec<_>>>()?;
                let mut rows = stmt.query(params_from_iter(params))?;
                while let Some(row) = rows.next()? {
                    let values = statement::read_row(row, columns.len())?;
                    let decoded = if plan.is_explain() {
                        Ok(raw_row(&columns, values))
                    } else {
                        plan.decode_row(values)
                    };
                    if tx.blocking_send(decoded).is_err() {
                        debug!("Stream consumer went away");
                        break;
                    }
                }
                Ok(())
            });
            if let Err(err) = produced {
                let _ = tx.blocking_send(Err(err.into()));
            }
        });
        ReceiverStream::new(rx).boxed()
    }

    async fn count(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<u64> {
        let query = self.translator.count(schema, spec)?;
        let count = self.run(move |conn| statement::query_scalar(conn, &query)).await?;
        Ok(count.max(0) as u64)
    }

    async fn list_tables(&self) -> StoreResult<Vec<String>> {
        self.run(|conn| introspect::list_tables(conn)).await
    }

    async fn describe_schema(&self, table: &str) -> StoreResult<TableDescriptor> {
        let name = table.to_string();
        self.run(move |conn| introspect::describe(conn, &name))
            .await?
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))
    }

    async fn list_indexes(&self) -> StoreResult<IndexListing> {
        self.run(|conn| introspect::list_indexes(conn)).await
    }

    async fn list_foreign_keys(&self) -> StoreResult<ForeignKeyListing> {
        self.run(|conn| introspect::list_foreign_keys(conn)).await
    }

    /// Foreign keys are declared inline; indexes that already exist on the
    /// table are skipped, so creating a table twice is harmless.
    async fn create_table(&self, schema: &Schema) -> StoreResult<()> {
        let create = self.translator.create_table(schema)?;
        let mut indexes = Vec::with_capacity(schema.indexes().len());
        for index in schema.indexes() {
            indexes.push((index.name.clone(), self.translator.create_index(schema, index)?));
        }
        let table = schema.table().to_string();

        self.run(move |conn| {
            let tx = conn.transaction()?;
            debug!(sql = %create, "Creating table");
            tx.execute_batch(&create)?;
            for (name, sql) in &indexes {
                if introspect::has_index(&tx, &table, name)? {
                    continue;
                }
                debug!(sql = %sql, "Creating index");
                tx.execute_batch(sql)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        info!(table = schema.table(), "Table ready");
        Ok(())
    }

    async fn add_column(&self, schema: &Schema, property: &Property) -> StoreResult<()> {
        let sql = self.translator.add_column(schema, property)?;
        self.execute(RenderedQuery::new(sql)).await?;
        Ok(())
    }

    async fn create_index(&self, schema: &Schema, index: &IndexDescriptor) -> StoreResult<()> {
        let sql = self.translator.create_index(schema, index)?;
        self.execute(RenderedQuery::new(sql)).await?;
        Ok(())
    }

    async fn create_foreign_key(&self, schema: &Schema, foreign_key: &ForeignKeyDescriptor) -> StoreResult<()> {
        self.cell.ensure_connected()?;
        if let Some(sql) = self.translator.create_foreign_key(schema, foreign_key)? {
            self.execute(RenderedQuery::new(sql)).await?;
            return Ok(());
        }
        if schema.foreign_keys().contains(foreign_key) {
            debug!(table = schema.table(), column = %foreign_key.column, "Foreign key declared with the table");
            return Ok(());
        }
        Err(StoreError::unsupported(
            "adding a foreign key to an existing SQLite table",
        ))
    }

    async fn drop_table(&self, table: &str) -> StoreResult<()> {
        self.execute(RenderedQuery::new(self.translator.drop_table(table)))
            .await?;
        info!(table, "Dropped table");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::{json_row, LogicalType};

    async fn connected() -> SqliteAdapter {
        let adapter = SqliteAdapter::memory();
        adapter.connect().await.unwrap();
        adapter
    }

    fn notes() -> Schema {
        Schema::builder("notes")
            .column("title", LogicalType::STRING)
            .build(&Capabilities::sqlite())
            .unwrap()
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let adapter = SqliteAdapter::memory();

        let err = adapter.find(&notes(), &QuerySpec::new()).await.unwrap_err();

        assert_eq!(err, StoreError::NotConnected(ConnectionState::Disconnected));
    }

    #[tokio::test]
    async fn test_closed_adapter_rejects_operations() {
        let adapter = connected().await;
        adapter.close().await.unwrap();

        assert_eq!(adapter.state(), ConnectionState::Closed);
        assert_eq!(
            adapter.list_tables().await.unwrap_err(),
            StoreError::NotConnected(ConnectionState::Closed)
        );
    }

    #[tokio::test]
    async fn test_missing_table_is_normalized() {
        let adapter = connected().await;

        let err = adapter
            .create(&notes(), json_row(json!({"title": "a"})))
            .await
            .unwrap_err();

        assert_eq!(err, StoreError::TableNotFound("notes".to_string()));
    }

    #[tokio::test]
    async fn test_explain_returns_plan_rows() {
        let adapter = connected().await;
        adapter.create_table(&notes()).await.unwrap();

        let plan = adapter
            .find(&notes(), &QuerySpec::new().explain())
            .await
            .unwrap();

        assert!(!plan.is_empty());
        assert!(plan[0].contains_key("detail"));
    }
}
