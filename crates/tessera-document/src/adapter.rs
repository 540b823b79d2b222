//! [`Adapter`] over a document store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::stream::{self, StreamExt, TryStreamExt};
use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::{debug, info};

use tessera_config::DocumentSettings;
use tessera_core::coerce::{missing_required, validate_partial, validate_row};
use tessera_core::normalize::DocumentErrors;
use tessera_core::{
    error_stream, insert_in_chunks, Adapter, BackendFailure, Capabilities, ColumnDescriptor,
    Condition, ConnectionCell, ConnectionState, ErrorNormalizer, FieldRef, FindOptions,
    ForeignKeyDescriptor, ForeignKeyListing, IndexDescriptor, IndexListing, LogicalType,
    PartialRow, Property, QuerySpec, RecordId, Row, RowStream, Schema, StoreError, StoreResult,
    TableDescriptor, Value, BULK_CHUNK_SIZE, ID_FIELD,
};
use tessera_query::document::{
    bson_to_value, document_to_row, group_row, row_to_document, COUNT_FIELD, DOCUMENT_ID,
};
use tessera_query::{DocumentTranslator, FindPlan};

use crate::memory::MemoryDocumentStore;
use crate::store::{codes, DocumentCollection, DocumentCursor, DocumentStore, IndexModel};

/// Documents sampled when describing a collection.
const DESCRIBE_SAMPLE: u64 = 100;

/// Native form of a read.
enum Source {
    Find(FindPlan),
    Pipeline(Vec<Document>),
}

fn normalized(table: &str) -> impl Fn(BackendFailure) -> StoreError + '_ {
    move |failure| DocumentErrors.normalize(&failure.on_table(table))
}

fn record_id(id: Bson) -> StoreResult<RecordId> {
    match id {
        Bson::ObjectId(oid) => Ok(RecordId::ObjectId(oid.to_hex())),
        other => Err(StoreError::UnexpectedResult(format!("insert returned id {other}"))),
    }
}

fn decode(schema: &Schema, spec: &QuerySpec, doc: Document) -> Row {
    if spec.is_grouped() {
        group_row(schema, spec, &doc)
    } else if spec.explain {
        bson_to_value(Bson::Document(doc)).into_row().unwrap_or_default()
    } else {
        document_to_row(schema, &doc)
    }
}

async fn open(collection: Arc<dyn DocumentCollection>, source: Source) -> Result<DocumentCursor, BackendFailure> {
    match source {
        Source::Find(plan) if plan.explain => {
            let explained = collection.explain(&plan).await?;
            Ok(stream::once(async move { Ok::<_, BackendFailure>(explained) }).boxed())
        }
        Source::Find(plan) => collection.find(&plan).await,
        Source::Pipeline(pipeline) => collection.aggregate(pipeline).await,
    }
}

fn field_path(schema: &Schema, column: &str) -> StoreResult<String> {
    Ok(match schema.resolve(column)? {
        FieldRef::Id => DOCUMENT_ID.to_string(),
        FieldRef::Column(property) => property.name.clone(),
    })
}

/// Logical type a stored value suggests; arrays and unknown kinds have none.
fn observed_type(value: &Bson) -> Option<LogicalType> {
    Some(match value {
        Bson::String(_) => LogicalType::STRING,
        Bson::Double(_) => LogicalType::Number,
        Bson::Int32(_) | Bson::Int64(_) => LogicalType::Integer,
        Bson::Boolean(_) => LogicalType::Boolean,
        Bson::DateTime(_) => LogicalType::Date,
        Bson::ObjectId(_) => LogicalType::RecordId,
        Bson::Document(_) => LogicalType::Object,
        _ => return None,
    })
}

#[derive(Default)]
struct Observed {
    logical_type: Option<LogicalType>,
    conflicting: bool,
    non_null: usize,
}

/// Columns inferred from sampled documents. A column is required when every
/// sampled document carries a non-null value for it.
fn describe_documents(documents: &[Document]) -> TableDescriptor {
    let mut seen: IndexMap<String, Observed> = IndexMap::new();
    for doc in documents {
        for (key, value) in doc {
            let column = if key == DOCUMENT_ID { ID_FIELD } else { key.as_str() };
            let entry = seen.entry(column.to_string()).or_default();
            if matches!(value, Bson::Null) {
                continue;
            }
            let observed = observed_type(value);
            if entry.non_null == 0 {
                entry.logical_type = observed;
            } else if entry.logical_type != observed {
                entry.conflicting = true;
            }
            entry.non_null += 1;
        }
    }
    seen.into_iter()
        .map(|(column, observed)| {
            let descriptor = ColumnDescriptor {
                logical_type: observed.logical_type.filter(|_| !observed.conflicting),
                required: observed.non_null == documents.len(),
            };
            (column, descriptor)
        })
        .collect()
}

/// Document adapter over a [`DocumentStore`] driver.
///
/// Collection handles are cached per table and dropped with the table.
pub struct DocumentAdapter {
    settings: DocumentSettings,
    capabilities: Capabilities,
    translator: DocumentTranslator,
    cell: ConnectionCell,
    store: Arc<dyn DocumentStore>,
    collections: RwLock<HashMap<String, Arc<dyn DocumentCollection>>>,
}

impl DocumentAdapter {
    pub fn new(settings: DocumentSettings, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            settings,
            capabilities: Capabilities::document(),
            translator: DocumentTranslator,
            cell: ConnectionCell::new(),
            store,
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Adapter over an in-process store named after `settings.database`.
    pub fn memory(settings: DocumentSettings) -> Self {
        let store = Arc::new(MemoryDocumentStore::new(settings.database.clone()));
        Self::new(settings, store)
    }

    pub fn translator(&self) -> &DocumentTranslator {
        &self.translator
    }

    fn collection(&self, table: &str) -> StoreResult<Arc<dyn DocumentCollection>> {
        self.cell.ensure_connected()?;
        if let Some(collection) = self.collections.read().get(table) {
            return Ok(Arc::clone(collection));
        }
        let mut collections = self.collections.write();
        let collection = collections
            .entry(table.to_string())
            .or_insert_with(|| self.store.collection(table));
        Ok(Arc::clone(collection))
    }

    fn source(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<Source> {
        Ok(if spec.is_grouped() {
            Source::Pipeline(self.translator.pipeline(schema, spec)?)
        } else {
            Source::Find(self.translator.find(schema, spec)?)
        })
    }

    async fn read(&self, schema: &Schema, spec: &QuerySpec, source: Source) -> StoreResult<Vec<Row>> {
        let table = schema.table();
        let collection = self.collection(table)?;
        let documents: Vec<Document> = open(collection, source)
            .await
            .map_err(normalized(table))?
            .try_collect()
            .await
            .map_err(normalized(table))?;
        Ok(documents
            .into_iter()
            .map(|doc| decode(schema, spec, doc))
            .collect())
    }

    async fn insert(&self, schema: &Schema, rows: &[Row]) -> StoreResult<Vec<RecordId>> {
        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let row = validate_row(schema, row)?;
            if let Some(column) = missing_required(schema, &row) {
                return Err(StoreError::ColumnRequired(column.to_string()));
            }
            documents.push(row_to_document(schema, &row)?);
        }
        let table = schema.table();
        self.collection(table)?
            .insert_many(documents)
            .await
            .map_err(normalized(table))?
            .into_iter()
            .map(record_id)
            .collect()
    }

    async fn ensure_collection(&self, table: &str) -> StoreResult<()> {
        self.cell.ensure_connected()?;
        match self.store.create_collection(table).await {
            Ok(()) => Ok(()),
            Err(failure) if failure.code == codes::NAMESPACE_EXISTS => {
                debug!(collection = table, "Collection already exists");
                Ok(())
            }
            Err(failure) => Err(normalized(table)(failure)),
        }
    }
}

#[async_trait]
impl Adapter for DocumentAdapter {
    fn name(&self) -> &'static str {
        "document"
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
                    database = self.store.database(),
                    "Pinging document store"
                );
                self.store
                    .ping()
                    .await
                    .map_err(|failure| DocumentErrors.normalize(&failure))
            })
            .await
    }

    async fn close(&self) -> StoreResult<()> {
        self.cell.close();
        self.collections.write().clear();
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
        debug!(table = schema.table(), %id, "Created document");
        Ok(id)
    }

    /// Chunks of [`BULK_CHUNK_SIZE`] documents, one ordered insert each.
    async fn create_bulk(&self, schema: &Schema, rows: Vec<Row>) -> StoreResult<Vec<RecordId>> {
        insert_in_chunks(rows, BULK_CHUNK_SIZE, |chunk| async move { self.insert(schema, &chunk).await }).await
    }

    async fn update(&self, schema: &Schema, row: Row) -> StoreResult<()> {
        let row = validate_row(schema, &row)?;
        if let Some(column) = missing_required(schema, &row) {
            return Err(StoreError::ColumnRequired(column.to_string()));
        }
        let (filter, replacement) = self.translator.replacement(schema, &row)?;
        let table = schema.table();
        let matched = self
            .collection(table)?
            .replace_one(&filter, replacement)
            .await
            .map_err(normalized(table))?;
        match matched {
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
        let Some(plan) = self.translator.update_partial(schema, &partial, conditions)? else {
            return Ok(0);
        };
        let table = schema.table();
        let outcome = self
            .collection(table)?
            .update_many(&plan.filter, &plan.update, plan.upsert)
            .await
            .map_err(normalized(table))?;
        debug!(table, matched = outcome.matched, modified = outcome.modified, "Partial update");
        Ok(outcome.matched)
    }

    /// Single round trip with the server's own upsert.
    async fn upsert(
        &self,
        schema: &Schema,
        partial: PartialRow,
        conditions: Option<&Condition>,
    ) -> StoreResult<()> {
        let partial = validate_partial(schema, &partial)?;
        let plan = self.translator.upsert(schema, &partial, conditions)?;
        let table = schema.table();
        let outcome = self
            .collection(table)?
            .update_many(&plan.filter, &plan.update, plan.upsert)
            .await
            .map_err(normalized(table))?;
        debug!(
            table,
            matched = outcome.matched,
            inserted = outcome.upserted_id.is_some(),
            "Upsert"
        );
        Ok(())
    }

    async fn delete(&self, schema: &Schema, conditions: Option<&Condition>) -> StoreResult<u64> {
        let filter = self.translator.filter(schema, conditions)?;
        let table = schema.table();
        let removed = self
            .collection(table)?
            .delete_many(&filter)
            .await
            .map_err(normalized(table))?;
        debug!(table, removed, "Deleted documents");
        Ok(removed)
    }

    async fn find_by_id(&self, schema: &Schema, id: &Value, options: &FindOptions) -> StoreResult<Row> {
        let Some(plan) = self.translator.find_by_id(schema, id, options)? else {
            return Err(StoreError::NotFound);
        };
        let spec = QuerySpec {
            explain: options.explain,
            ..QuerySpec::default()
        };
        self.read(schema, &spec, Source::Find(plan))
            .await?
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound)
    }

    async fn find(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<Vec<Row>> {
        let source = self.source(schema, spec)?;
        let rows = self.read(schema, spec, source).await?;
        debug!(table = schema.table(), count = rows.len(), "Found documents");
        Ok(rows)
    }

    /// Documents are decoded as the consumer pulls them from the cursor.
    fn stream(&self, schema: Arc<Schema>, spec: QuerySpec) -> RowStream {
        let prepared = self
            .collection(schema.table())
            .and_then(|collection| Ok((collection, self.source(&schema, &spec)?)));
        let (collection, source) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => return error_stream(err),
        };

        stream::once(open(collection, source))
            .try_flatten()
            .map(move |item| {
                item.map(|doc| decode(&schema, &spec, doc))
                    .map_err(normalized(schema.table()))
            })
            .boxed()
    }

    async fn count(&self, schema: &Schema, spec: &QuerySpec) -> StoreResult<u64> {
        let table = schema.table();
        let collection = self.collection(table)?;
        if !spec.is_grouped() {
            let filter = self.translator.filter(schema, spec.conditions.as_ref())?;
            return collection.count(&filter).await.map_err(normalized(table));
        }

        let pipeline = self.translator.count_pipeline(schema, spec)?;
        let counted: Vec<Document> = collection
            .aggregate(pipeline)
            .await
            .map_err(normalized(table))?
            .try_collect()
            .await
            .map_err(normalized(table))?;
        let count = counted
            .first()
            .and_then(|doc| doc.get(COUNT_FIELD))
            .map(|count| bson_to_value(count.clone()))
            .and_then(|count| count.as_i64())
            .unwrap_or(0);
        Ok(count.max(0) as u64)
    }

    async fn list_tables(&self) -> StoreResult<Vec<String>> {
        self.cell.ensure_connected()?;
        self.store
            .list_collections()
            .await
            .map_err(|failure| DocumentErrors.normalize(&failure))
    }

    /// Inferred from a sample of stored documents.
    async fn describe_schema(&self, table: &str) -> StoreResult<TableDescriptor> {
        if !self.list_tables().await?.iter().any(|name| name == table) {
            return Err(StoreError::TableNotFound(table.to_string()));
        }
        let plan = FindPlan {
            limit: Some(DESCRIBE_SAMPLE),
            ..FindPlan::default()
        };
        let sample: Vec<Document> = self
            .collection(table)?
            .find(&plan)
            .await
            .map_err(normalized(table))?
            .try_collect()
            .await
            .map_err(normalized(table))?;
        Ok(describe_documents(&sample))
    }

    /// Every index except the implicit one on `_id`. Geo indexes list as `1`.
    async fn list_indexes(&self) -> StoreResult<IndexListing> {
        let mut listing = IndexListing::new();
        for table in self.list_tables().await? {
            let indexes = self
                .collection(&table)?
                .list_indexes()
                .await
                .map_err(normalized(&table))?;
            let indexes: IndexMap<String, IndexMap<String, i32>> = indexes
                .into_iter()
                .filter(|index| index.name != "_id_")
                .map(|index| {
                    let keys = index
                        .keys
                        .iter()
                        .map(|(field, direction)| {
                            let direction = match direction {
                                Bson::Int32(d) => *d,
                                Bson::Int64(d) => i32::try_from(*d).unwrap_or(1),
                                _ => 1,
                            };
                            (field.clone(), direction)
                        })
                        .collect();
                    (index.name, keys)
                })
                .collect();
            if !indexes.is_empty() {
                listing.insert(table, indexes);
            }
        }
        Ok(listing)
    }

    /// Document stores keep no foreign keys.
    async fn list_foreign_keys(&self) -> StoreResult<ForeignKeyListing> {
        self.cell.ensure_connected()?;
        Ok(ForeignKeyListing::new())
    }

    /// Creates the collection, the schema's indexes and a `2d` index per
    /// geopoint column. Running it again is harmless.
    async fn create_table(&self, schema: &Schema) -> StoreResult<()> {
        let table = schema.table();
        self.ensure_collection(table).await?;
        for index in schema.indexes() {
            self.create_index(schema, index).await?;
        }
        let collection = self.collection(table)?;
        for property in schema
            .properties()
            .filter(|property| property.logical_type == LogicalType::GeoPoint)
        {
            let mut keys = Document::new();
            keys.insert(property.name.clone(), "2d");
            collection
                .create_index(IndexModel::new(format!("{}_2d", property.dbname), keys))
                .await
                .map_err(normalized(table))?;
        }
        info!(table, "Collection ready");
        Ok(())
    }

    /// Documents are schemaless; there is nothing to alter.
    async fn add_column(&self, schema: &Schema, property: &Property) -> StoreResult<()> {
        self.cell.ensure_connected()?;
        debug!(table = schema.table(), column = %property.name, "Column needs no migration");
        Ok(())
    }

    /// Unique indexes on optional columns are sparse, so documents missing
    /// the column do not collide.
    async fn create_index(&self, schema: &Schema, index: &IndexDescriptor) -> StoreResult<()> {
        let mut keys = Document::new();
        for (column, direction) in &index.columns {
            keys.insert(field_path(schema, column)?, direction.signum());
        }
        let mut model = IndexModel::new(index.name.clone(), keys);
        if index.unique {
            model = model.unique(!index.required);
        }
        let table = schema.table();
        self.collection(table)?
            .create_index(model)
            .await
            .map_err(normalized(table))
    }

    /// Accepted and not enforced.
    async fn create_foreign_key(&self, schema: &Schema, foreign_key: &ForeignKeyDescriptor) -> StoreResult<()> {
        self.cell.ensure_connected()?;
        debug!(
            table = schema.table(),
            column = %foreign_key.column,
            "Foreign keys are not enforced by document stores"
        );
        Ok(())
    }

    /// Dropping a collection that does not exist succeeds.
    async fn drop_table(&self, table: &str) -> StoreResult<()> {
        self.cell.ensure_connected()?;
        self.collections.write().remove(table);
        match self.store.drop_collection(table).await {
            Ok(()) => {}
            Err(failure)
                if failure.code == codes::NAMESPACE_NOT_FOUND || failure.message.contains("ns not found") =>
            {
                debug!(table, "Collection was already gone");
            }
            Err(failure) => return Err(normalized(table)(failure)),
        }
        info!(table, "Dropped collection");
        Ok(())
    }
}
