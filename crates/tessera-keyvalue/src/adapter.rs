//! [`Adapter`] over a key-value store.
//!
//! Each record is a hash at `<table>:<id>` with every field stored as text;
//! ids come from an `INCR` on `<table>:_lastid`. The store cannot evaluate
//! conditions, so reads and writes touch the keys the
//! [`KeyspaceTranslator`] enumerates and return records in id order.

use std::collections::BTreeSet;
use std::future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use tessera_config::KeyValueSettings;
use tessera_core::coerce::{coerce_id, missing_required, validate_partial, validate_row, KeyValueCodec, TypeCodec};
use tessera_core::normalize::KeyValueErrors;
use tessera_core::update::upsert_insert_row;
use tessera_core::{
    error_stream, insert_in_chunks, Adapter, BackendFailure, Capabilities, ColumnDescriptor,
    Condition, ConnectionCell, ConnectionState, ErrorNormalizer, FieldError, FieldErrorKind,
    FieldUpdate, FindOptions, ForeignKeyDescriptor, ForeignKeyListing, IndexDescriptor,
    IndexListing, LogicalType, PartialRow, Property, QuerySpec, RecordId, Row, RowStream, Schema,
    StoreError, StoreResult, TableDescriptor, Value, BULK_CHUNK_SIZE, ID_FIELD,
};
use tessera_query::keyspace::{counter_key, record_key, table_pattern};
use tessera_query::{ConditionTranslator, KeyPlan, KeyspaceTranslator};

use crate::memory::MemoryKeyValueStore;
use crate::store::{DriverResult, Hash, KeyValueStore};

/// Field present in every record hash so that no hash is ever empty.
pub const SENTINEL: &str = "$_$";

const COUNTER_SUFFIX: &str = "_lastid";

/// Records sampled when describing a table.
const DESCRIBE_SAMPLE: usize = 100;

fn normalized(table: &str) -> impl Fn(BackendFailure) -> StoreError + '_ {
    move |failure| KeyValueErrors.normalize(&failure.on_table(table))
}

/// Id of a record key of `table`; `None` for the counter and foreign keys.
fn record_id(table: &str, key: &str) -> Option<i64> {
    key.strip_prefix(table)?.strip_prefix(':')?.parse().ok()
}

/// Record keys a plan resolves to, in id order.
async fn record_keys(store: &dyn KeyValueStore, table: &str, plan: KeyPlan) -> DriverResult<Vec<(i64, String)>> {
    let keys = match plan {
        KeyPlan::All { pattern } => store.keys(&pattern).await?,
        KeyPlan::Keys(keys) => keys,
    };
    let mut records: Vec<(i64, String)> = keys
        .into_iter()
        .filter_map(|key| record_id(table, &key).map(|id| (id, key)))
        .collect();
    records.sort_by_key(|(id, _)| *id);
    Ok(records)
}

/// Hash fields for a validated row, sentinel included.
fn encode(schema: &Schema, row: &Row) -> StoreResult<Vec<(String, String)>> {
    let mut fields = Vec::with_capacity(row.len() + 1);
    let mut errors = Vec::new();
    for property in schema.properties() {
        let Some(value) = row.get(&property.name) else {
            continue;
        };
        match KeyValueCodec.to_native(property, value) {
            Ok(Some(text)) => fields.push((property.dbname.clone(), text)),
            Ok(None) => {}
            Err(reason) => errors.push(FieldError::new(&property.name, reason)),
        }
    }
    if !errors.is_empty() {
        return Err(StoreError::Validation(errors));
    }
    fields.push((SENTINEL.to_string(), String::new()));
    Ok(fields)
}

/// Row for the hash of record `id`. Absent fields read as null.
fn decode(schema: &Schema, id: i64, mut hash: Hash, select: Option<&[String]>) -> StoreResult<Row> {
    let mut row = Row::with_capacity(hash.len());
    row.insert(ID_FIELD.to_string(), Value::Integer(id));
    for property in schema.properties() {
        if select.is_some_and(|columns| !columns.iter().any(|column| *column == property.name)) {
            continue;
        }
        let value = KeyValueCodec
            .from_native(property, hash.shift_remove(&property.dbname))
            .map_err(|reason| {
                StoreError::UnexpectedResult(format!(
                    "{} field '{}' {reason}",
                    record_key(schema.table(), id),
                    property.name
                ))
            })?;
        row.insert(property.name.clone(), value);
    }
    Ok(row)
}

/// `current + amount` for an increment on `property`.
fn incremented(property: &Property, current: Value, amount: &Value) -> Result<Value, FieldErrorKind> {
    match property.logical_type {
        LogicalType::Integer => {
            let current = match current {
                Value::Null => 0,
                other => other.as_i64().ok_or(FieldErrorKind::NotAnInteger)?,
            };
            amount
                .as_i64()
                .and_then(|amount| current.checked_add(amount))
                .map(Value::Integer)
                .ok_or(FieldErrorKind::NotAnInteger)
        }
        _ => {
            let current = match current {
                Value::Null => 0.0,
                other => other.as_f64().ok_or(FieldErrorKind::NotANumber)?,
            };
            amount
                .as_f64()
                .map(|amount| Value::Number(current + amount))
                .ok_or(FieldErrorKind::NotANumber)
        }
    }
}

/// Key-value adapter over a [`KeyValueStore`] driver.
///
/// Upserts issued through one adapter are serialized; the store has no
/// unique constraints to arbitrate concurrent inserts.
pub struct KeyValueAdapter {
    settings: KeyValueSettings,
    capabilities: Capabilities,
    translator: KeyspaceTranslator,
    cell: ConnectionCell,
    store: Arc<dyn KeyValueStore>,
    upserts: tokio::sync::Mutex<()>,
}

impl KeyValueAdapter {
    pub fn new(settings: KeyValueSettings, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            settings,
            capabilities: Capabilities::key_value(),
            translator: KeyspaceTranslator,
            cell: ConnectionCell::new(),
            store,
            upserts: tokio::sync::Mutex::new(()),
        }
    }

    /// Adapter over an in-process store.
    pub fn memory(settings: KeyValueSettings) -> Self {
        Self::new(settings, Arc::new(MemoryKeyValueStore::new()))
    }

    /// Key plan for a read, rejecting what the store cannot do.
    fn plan(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<KeyPlan> {
        if spec.is_grouped() {
            return Err(StoreError::unsupported("grouping on a key-value store"));
        }
        if spec.near.is_some() {
            return Err(StoreError::unsupported("near queries on a key-value store"));
        }
        if spec.explain {
            return Err(StoreError::unsupported("explain on a key-value store"));
        }
        for order in &spec.orders {
            schema.resolve(&order.column)?;
        }
        if !spec.orders.is_empty() {
            warn!(table = schema.table(), "Key-value reads come back in id order; ignoring orders");
        }
        self.translator.translate(schema, spec.conditions.as_ref())
    }

    async fn keys_for(&self, schema: &Schema, conditions: Option<&Condition>) -> StoreResult<Vec<(i64, String)>> {
        self.cell.ensure_connected()?;
        let table = schema.table();
        let plan = self.translator.translate(schema, conditions)?;
        record_keys(self.store.as_ref(), table, plan)
            .await
            .map_err(normalized(table))
    }

    async fn insert(&self, schema: &Schema, rows: &[Row]) -> StoreResult<Vec<RecordId>> {
        self.cell.ensure_connected()?;
        let mut encoded = Vec::with_capacity(rows.len());
        for row in rows {
            let row = validate_row(schema, row)?;
            if let Some(column) = missing_required(schema, &row) {
                return Err(StoreError::ColumnRequired(column.to_string()));
            }
            encoded.push(encode(schema, &row)?);
        }

        let table = schema.table();
        let counter = counter_key(table);
        let mut ids = Vec::with_capacity(encoded.len());
        for fields in encoded {
            let id = self.store.incr(&counter).await.map_err(normalized(table))?;
            self.store
                .hset(&record_key(table, id), &fields)
                .await
                .map_err(normalized(table))?;
            ids.push(RecordId::Integer(id));
        }
        Ok(ids)
    }

    /// Apply a validated partial update to one existing record.
    async fn apply(&self, schema: &Schema, key: &str, id: i64, partial: &PartialRow) -> StoreResult<bool> {
        let table = schema.table();
        let Some(current) = self.store.hgetall(key).await.map_err(normalized(table))? else {
            return Ok(false);
        };

        let mut sets = Vec::with_capacity(partial.len() + 1);
        let mut unsets = Vec::new();
        let mut errors = Vec::new();
        for (column, update) in partial {
            let Some(property) = schema.property(column) else {
                continue;
            };
            let value = match update {
                FieldUpdate::Unset => Ok(Value::Null),
                FieldUpdate::Set(value) => Ok(value.clone()),
                FieldUpdate::Increment(amount) => KeyValueCodec
                    .from_native(property, current.get(&property.dbname).cloned())
                    .and_then(|value| incremented(property, value, amount)),
            };
            match value.and_then(|value| KeyValueCodec.to_native(property, &value)) {
                Ok(Some(text)) => sets.push((property.dbname.clone(), text)),
                Ok(None) => unsets.push(property.dbname.clone()),
                Err(reason) => errors.push(FieldError::new(column, reason)),
            }
        }
        if !errors.is_empty() {
            return Err(StoreError::Validation(errors));
        }

        if !unsets.is_empty() {
            self.store.hdel(key, &unsets).await.map_err(normalized(table))?;
        }
        sets.push((SENTINEL.to_string(), String::new()));
        self.store.hset(key, &sets).await.map_err(normalized(table))?;
        debug!(table, id, set = sets.len() - 1, unset = unsets.len(), "Updated record");
        Ok(true)
    }
}

#[async_trait]
impl Adapter for KeyValueAdapter {
    fn name(&self) -> &'static str {
        "keyvalue"
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
                debug!(
                    host = %self.settings.host,
                    port = self.settings.port,
                    database = self.settings.database,
                    "Selecting key-value database"
                );
                let normalize = |failure: BackendFailure| KeyValueErrors.normalize(&failure);
                self.store.ping().await.map_err(normalize)?;
                self.store.select(self.settings.database).await.map_err(normalize)
            })
            .await
    }

    async fn close(&self) -> StoreResult<()> {
        self.cell.close();
        info!(backend = self.name(), "Closed");
        Ok(())
    }

    async fn create(&self, schema: &Schema, row: Row) -> StoreResult<RecordId> {
        let id = self
            .insert(schema, std::slice::from_ref(&row))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::UnexpectedResult("insert returned no id".to_string()))?;
        debug!(table = schema.table(), %id, "Created record");
        Ok(id)
    }

    /// Chunks of [`BULK_CHUNK_SIZE`] rows; a chunk is validated before any
    /// of its rows is written.
    async fn create_bulk(&self, schema: &Schema, rows: Vec<Row>) -> StoreResult<Vec<RecordId>> {
        insert_in_chunks(rows, BULK_CHUNK_SIZE, |chunk| async move { self.insert(schema, &chunk).await }).await
    }

    async fn update(&self, schema: &Schema, row: Row) -> StoreResult<()> {
        self.cell.ensure_connected()?;
        let id = row
            .get(ID_FIELD)
            .and_then(|id| coerce_id(LogicalType::Integer, id))
            .and_then(|id| id.as_i64())
            .ok_or_else(|| StoreError::InvalidId(ID_FIELD.to_string()))?;
        let row = validate_row(schema, &row)?;
        if let Some(column) = missing_required(schema, &row) {
            return Err(StoreError::ColumnRequired(column.to_string()));
        }
        let fields = encode(schema, &row)?;

        let table = schema.table();
        let key = record_key(table, id);
        if !self.store.exists(&key).await.map_err(normalized(table))? {
            return Err(StoreError::NotFound);
        }
        self.store.del(std::slice::from_ref(&key)).await.map_err(normalized(table))?;
        self.store.hset(&key, &fields).await.map_err(normalized(table))?;
        debug!(table, id, "Replaced record");
        Ok(())
    }

    /// Touches only keys that exist. Increments are read-modify-write.
    async fn update_partial(
        &self,
        schema: &Schema,
        partial: PartialRow,
        conditions: Option<&Condition>,
    ) -> StoreResult<u64> {
        let partial = validate_partial(schema, &partial)?;
        let keys = self.keys_for(schema, conditions).await?;
        let mut affected = 0;
        for (id, key) in &keys {
            if self.apply(schema, key, *id, &partial).await? {
                affected += 1;
            }
        }
        debug!(table = schema.table(), affected, "Partial update");
        Ok(affected)
    }

    async fn upsert(
        &self,
        schema: &Schema,
        partial: PartialRow,
        conditions: Option<&Condition>,
    ) -> StoreResult<()> {
        let _serialized = self.upserts.lock().await;
        let affected = self
            .update_partial(schema, partial.clone(), conditions)
            .await?;
        if affected > 0 {
            return Ok(());
        }
        self.create(schema, upsert_insert_row(&partial, conditions))
            .await
            .map(|_| ())
    }

    async fn delete(&self, schema: &Schema, conditions: Option<&Condition>) -> StoreResult<u64> {
        let keys: Vec<String> = self
            .keys_for(schema, conditions)
            .await?
            .into_iter()
            .map(|(_, key)| key)
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }
        let table = schema.table();
        let removed = self.store.del(&keys).await.map_err(normalized(table))?;
        debug!(table, removed, "Deleted records");
        Ok(removed)
    }

    async fn find_by_id(&self, schema: &Schema, id: &Value, options: &FindOptions) -> StoreResult<Row> {
        self.cell.ensure_connected()?;
        if options.explain {
            return Err(StoreError::unsupported("explain on a key-value store"));
        }
        let Some(id) = coerce_id(LogicalType::Integer, id).and_then(|id| id.as_i64()) else {
            return Err(StoreError::NotFound);
        };
        let table = schema.table();
        let hash = self
            .store
            .hgetall(&record_key(table, id))
            .await
            .map_err(normalized(table))?
            .ok_or(StoreError::NotFound)?;
        decode(schema, id, hash, options.select.as_deref())
    }

    async fn find(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<Vec<Row>> {
        let rows: Vec<Row> = self
            .stream(Arc::new(schema.clone()), spec.clone())
            .try_collect()
            .await?;
        debug!(table = schema.table(), count = rows.len(), "Found records");
        Ok(rows)
    }

    /// One `HGETALL` per record, issued as the consumer pulls.
    fn stream(&self, schema: Arc<Schema>, spec: QuerySpec) -> RowStream {
        let plan = self
            .cell
            .ensure_connected()
            .and_then(|()| self.plan(&schema, &spec));
        let plan = match plan {
            Ok(plan) => plan,
            Err(err) => return error_stream(err),
        };

        let table = schema.table().to_string();
        let skip = usize::try_from(spec.skip).unwrap_or(usize::MAX);
        let limit = spec
            .limit
            .map_or(usize::MAX, |limit| usize::try_from(limit).unwrap_or(usize::MAX));
        let select = spec.select;
        let store = Arc::clone(&self.store);
        let lister = Arc::clone(&self.store);
        let listed_table = table.clone();
        let mut seen = 0usize;

        stream::once(async move { record_keys(lister.as_ref(), &listed_table, plan).await })
            .map_ok(|keys| stream::iter(keys.into_iter().map(Ok::<_, BackendFailure>)))
            .try_flatten()
            .and_then(move |(id, key)| {
                let store = Arc::clone(&store);
                async move { Ok::<_, BackendFailure>((id, store.hgetall(&key).await?)) }
            })
            .try_filter_map(|(id, hash)| future::ready(Ok(hash.map(|hash| (id, hash)))))
            .try_filter(move |_| {
                seen += 1;
                future::ready(seen > skip)
            })
            .map(move |item| {
                item.map_err(normalized(&table))
                    .and_then(|(id, hash)| decode(&schema, id, hash, select.as_deref()))
            })
            .take(limit)
            .boxed()
    }

    async fn count(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<u64> {
        self.cell.ensure_connected()?;
        if spec.is_grouped() {
            return Err(StoreError::unsupported("grouping on a key-value store"));
        }
        let table = schema.table();
        let plan = self.translator.translate(schema, spec.conditions.as_ref())?;
        let enumerated = matches!(plan, KeyPlan::All { .. });
        let keys = record_keys(self.store.as_ref(), table, plan)
            .await
            .map_err(normalized(table))?;
        if enumerated {
            return Ok(keys.len() as u64);
        }
        let mut count = 0;
        for (_, key) in &keys {
            if self.store.exists(key).await.map_err(normalized(table))? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Tables holding records or an id counter.
    async fn list_tables(&self) -> StoreResult<Vec<String>> {
        self.cell.ensure_connected()?;
        let keys = self
            .store
            .keys("*")
            .await
            .map_err(|failure| KeyValueErrors.normalize(&failure))?;
        let tables: BTreeSet<String> = keys
            .iter()
            .filter_map(|key| key.rsplit_once(':'))
            .filter(|(_, suffix)| *suffix == COUNTER_SUFFIX || suffix.parse::<i64>().is_ok())
            .map(|(table, _)| table.to_string())
            .collect();
        Ok(tables.into_iter().collect())
    }

    /// Fields seen in a sample of records. Values are text, so no logical
    /// type is reported except for `id`.
    async fn describe_schema(&self, table: &str) -> StoreResult<TableDescriptor> {
        self.cell.ensure_connected()?;
        let plan = KeyPlan::All {
            pattern: table_pattern(table),
        };
        let keys = record_keys(self.store.as_ref(), table, plan)
            .await
            .map_err(normalized(table))?;
        if keys.is_empty()
            && !self
                .store
                .exists(&counter_key(table))
                .await
                .map_err(normalized(table))?
        {
            return Err(StoreError::TableNotFound(table.to_string()));
        }

        let mut sampled = 0usize;
        let mut seen: IndexMap<String, usize> = IndexMap::new();
        for (_, key) in keys.iter().take(DESCRIBE_SAMPLE) {
            let Some(hash) = self.store.hgetall(key).await.map_err(normalized(table))? else {
                continue;
            };
            sampled += 1;
            for field in hash.keys().filter(|field| *field != SENTINEL) {
                *seen.entry(field.clone()).or_default() += 1;
            }
        }

        let mut columns = TableDescriptor::new();
        columns.insert(
            ID_FIELD.to_string(),
            ColumnDescriptor {
                logical_type: Some(LogicalType::Integer),
                required: true,
            },
        );
        for (field, present) in seen {
            columns.insert(
                field,
                ColumnDescriptor {
                    logical_type: None,
                    required: present == sampled,
                },
            );
        }
        Ok(columns)
    }

    async fn list_indexes(&self) -> StoreResult<IndexListing> {
        self.cell.ensure_connected()?;
        Ok(IndexListing::new())
    }

    async fn list_foreign_keys(&self) -> StoreResult<ForeignKeyListing> {
        self.cell.ensure_connected()?;
        Ok(ForeignKeyListing::new())
    }

    /// Tables are key prefixes and need no creation.
    async fn create_table(&self, schema: &Schema) -> StoreResult<()> {
        self.cell.ensure_connected()?;
        if !schema.indexes().is_empty() || !schema.foreign_keys().is_empty() {
            debug!(
                table = schema.table(),
                indexes = schema.indexes().len(),
                foreign_keys = schema.foreign_keys().len(),
                "Key-value store keeps no indexes or foreign keys"
            );
        }
        Ok(())
    }

    async fn add_column(&self, schema: &Schema, property: &Property) -> StoreResult<()> {
        self.cell.ensure_connected()?;
        debug!(table = schema.table(), column = %property.name, "Hash fields need no declaration");
        Ok(())
    }

    async fn create_index(&self, schema: &Schema, index: &IndexDescriptor) -> StoreResult<()> {
        self.cell.ensure_connected()?;
        debug!(table = schema.table(), index = %index.name, "Index not created; key-value store has none");
        Ok(())
    }

    async fn create_foreign_key(&self, schema: &Schema, foreign_key: &ForeignKeyDescriptor) -> StoreResult<()> {
        self.cell.ensure_connected()?;
        debug!(
            table = schema.table(),
            column = %foreign_key.column,
            references = %foreign_key.references,
            "Foreign key not enforced"
        );
        Ok(())
    }

    /// Deletes every record and the id counter.
    async fn drop_table(&self, table: &str) -> StoreResult<()> {
        self.cell.ensure_connected()?;
        let keys = self
            .store
            .keys(&table_pattern(table))
            .await
            .map_err(normalized(table))?;
        if keys.is_empty() {
            return Ok(());
        }
        let removed = self.store.del(&keys).await.map_err(normalized(table))?;
        info!(table, removed, "Dropped table");
        Ok(())
    }
}
