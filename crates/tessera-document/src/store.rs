//! Driver seam for document stores.
//!
//! The adapter talks to a database through [`DocumentStore`] and to each
//! collection through a [`DocumentCollection`] handle. Both speak native
//! query objects: BSON filters, update documents and aggregation pipelines
//! as produced by [`DocumentTranslator`](tessera_query::DocumentTranslator).
//! Failures are reported as [`BackendFailure`]s carrying the server's
//! numeric code, so one normalizer serves every driver.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::Stream;

use tessera_core::BackendFailure;
use tessera_query::FindPlan;

/// Server error codes the adapter reacts to.
pub mod codes {
    pub const BAD_VALUE: &str = "2";
    pub const FAILED_TO_PARSE: &str = "9";
    pub const TYPE_MISMATCH: &str = "14";
    pub const NAMESPACE_NOT_FOUND: &str = "26";
    pub const NAMESPACE_EXISTS: &str = "48";
    pub const INDEX_OPTIONS_CONFLICT: &str = "85";
    pub const NO_QUERY_EXECUTION_PLANS: &str = "291";
    pub const DUPLICATE_KEY: &str = "11000";
    pub const CONNECTION_REFUSED: &str = "ECONNREFUSED";
}

/// Result type for driver calls
pub type DriverResult<T> = Result<T, BackendFailure>;

/// Documents pulled from the server as the consumer asks for them.
pub type DocumentCursor = Pin<Box<dyn Stream<Item = DriverResult<Document>> + Send>>;

/// Index definition as sent to and listed by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexModel {
    pub name: String,
    /// Field → `1`, `-1` or `"2d"`
    pub keys: Document,
    pub unique: bool,
    /// Skip documents missing every indexed field
    pub sparse: bool,
}

impl IndexModel {
    pub fn new(name: impl Into<String>, keys: Document) -> Self {
        Self {
            name: name.into(),
            keys,
            unique: false,
            sparse: false,
        }
    }

    pub fn unique(mut self, sparse: bool) -> Self {
        self.unique = true;
        self.sparse = sparse;
        self
    }

    /// Whether this is a planar geo index on `field`.
    pub fn is_geo_on(&self, field: &str) -> bool {
        matches!(self.keys.get(field), Some(Bson::String(kind)) if kind == "2d")
    }
}

/// Outcome of an update call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    /// `_id` of the document inserted by an upsert
    pub upserted_id: Option<Bson>,
}

/// Handle to one collection.
#[async_trait]
pub trait DocumentCollection: Send + Sync {
    fn name(&self) -> &str;

    /// Ordered insert; documents without `_id` get a fresh object id.
    /// Stops at the first failure, keeping what was already inserted.
    async fn insert_many(&self, documents: Vec<Document>) -> DriverResult<Vec<Bson>>;

    async fn find(&self, plan: &FindPlan) -> DriverResult<DocumentCursor>;

    /// Query planner output for `plan`.
    async fn explain(&self, plan: &FindPlan) -> DriverResult<Document>;

    async fn aggregate(&self, pipeline: Vec<Document>) -> DriverResult<DocumentCursor>;

    async fn count(&self, filter: &Document) -> DriverResult<u64>;

    async fn update_many(&self, filter: &Document, update: &Document, upsert: bool) -> DriverResult<UpdateOutcome>;

    /// Replace the first match, keeping its `_id`. Returns the match count.
    async fn replace_one(&self, filter: &Document, replacement: Document) -> DriverResult<u64>;

    async fn delete_many(&self, filter: &Document) -> DriverResult<u64>;

    async fn create_index(&self, index: IndexModel) -> DriverResult<()>;

    async fn list_indexes(&self) -> DriverResult<Vec<IndexModel>>;
}

/// One database on a document server.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Database name
    fn database(&self) -> &str;

    /// Round trip proving the server is reachable.
    async fn ping(&self) -> DriverResult<()>;

    /// Handle to `name`. Cheap; the collection need not exist yet.
    fn collection(&self, name: &str) -> Arc<dyn DocumentCollection>;

    async fn list_collections(&self) -> DriverResult<Vec<String>>;

    /// Fails with [`codes::NAMESPACE_EXISTS`] when `name` exists.
    async fn create_collection(&self, name: &str) -> DriverResult<()>;

    /// Fails with [`codes::NAMESPACE_NOT_FOUND`] when `name` does not exist.
    async fn drop_collection(&self, name: &str) -> DriverResult<()>;
}
