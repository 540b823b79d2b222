//! In-process document store
//!
//! Evaluates the same native query objects a server would: filters,
//! update operators and aggregation pipelines. Unique and sparse indexes are
//! enforced and report violations in the server's `E11000` message shape, so
//! the adapter's error normalization runs unchanged.

mod aggregate;
mod matcher;
mod update;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use tessera_core::BackendFailure;
use tessera_query::FindPlan;

use crate::store::{
    codes, DocumentCollection, DocumentCursor, DocumentStore, DriverResult, IndexModel, UpdateOutcome,
};
use matcher::{get_path, matches, near_clause, point, sort_documents, values_equal};

const ID: &str = "_id";
const ID_INDEX: &str = "_id_";

#[derive(Default)]
struct CollectionState {
    exists: bool,
    documents: Vec<Document>,
    indexes: Vec<IndexModel>,
}

impl CollectionState {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One collection of a [`MemoryDocumentStore`].
pub struct MemoryCollection {
    name: String,
    namespace: String,
    state: Mutex<CollectionState>,
}

fn cursor(documents: Vec<Document>) -> DocumentCursor {
    stream::iter(documents.into_iter().map(Ok)).boxed()
}

/// `doc` behind a new object id, which leads the document.
fn with_fresh_id(doc: Document) -> Document {
    let mut with_id = doc! {ID: ObjectId::new()};
    for (key, value) in doc {
        with_id.insert(key, value);
    }
    with_id
}

fn duplicate(namespace: &str, index: &str, key: &[(&str, Bson)]) -> BackendFailure {
    let key = key
        .iter()
        .map(|(field, value)| format!("{field}: {value}"))
        .collect::<Vec<_>>()
        .join(", ");
    BackendFailure::new(
        codes::DUPLICATE_KEY,
        format!("E11000 duplicate key error collection: {namespace} index: {index} dup key: {{ {key} }}"),
    )
}

/// Key of `doc` under `index`; `None` when a sparse index skips it.
fn index_key<'a>(index: &'a IndexModel, doc: &Document) -> Option<Vec<(&'a str, Bson)>> {
    let values: Vec<(&str, Option<&Bson>)> = index
        .keys
        .keys()
        .map(|field| (field.as_str(), get_path(doc, field)))
        .collect();
    if index.sparse && values.iter().all(|(_, value)| value.is_none()) {
        return None;
    }
    Some(
        values
            .into_iter()
            .map(|(field, value)| (field, value.cloned().unwrap_or(Bson::Null)))
            .collect(),
    )
}

fn same_key(a: &[(&str, Bson)], b: &[(&str, Bson)]) -> bool {
    a.iter().zip(b).all(|((_, x), (_, y))| values_equal(x, y))
}

impl MemoryCollection {
    fn new(database: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: format!("{database}.{name}"),
            state: Mutex::new(CollectionState::default()),
        }
    }

    /// Reject `candidate` if it collides with another document on `_id` or
    /// a unique index. `position` is the candidate's own slot when it
    /// replaces a stored document.
    fn check_unique(&self, state: &CollectionState, candidate: &Document, position: Option<usize>) -> DriverResult<()> {
        let others = || {
            state
                .documents
                .iter()
                .enumerate()
                .filter(move |(i, _)| Some(*i) != position)
                .map(|(_, doc)| doc)
        };

        if let Some(id) = candidate.get(ID) {
            if others().any(|doc| doc.get(ID).is_some_and(|other| values_equal(id, other))) {
                return Err(duplicate(&self.namespace, ID_INDEX, &[(ID, id.clone())]));
            }
        }
        for index in state.indexes.iter().filter(|index| index.unique) {
            let Some(key) = index_key(index, candidate) else {
                continue;
            };
            let collides = others().any(|doc| index_key(index, doc).is_some_and(|other| same_key(&key, &other)));
            if collides {
                return Err(duplicate(&self.namespace, &index.name, &key));
            }
        }
        Ok(())
    }

    fn matching(&self, state: &CollectionState, filter: &Document) -> DriverResult<Vec<usize>> {
        let mut positions = Vec::new();
        for (i, doc) in state.documents.iter().enumerate() {
            if matches(doc, filter)? {
                positions.push(i);
            }
        }
        Ok(positions)
    }

    fn select(&self, plan: &FindPlan) -> DriverResult<Vec<Document>> {
        let state = self.state.lock();
        let near = near_clause(&plan.filter);
        if let Some((field, _)) = &near {
            if !state.indexes.iter().any(|index| index.is_geo_on(field)) {
                return Err(BackendFailure::new(
                    codes::NO_QUERY_EXECUTION_PLANS,
                    "error processing query: unable to find index for $geoNear query",
                ));
            }
        }

        let mut selected = Vec::new();
        for doc in &state.documents {
            if matches(doc, &plan.filter)? {
                selected.push(doc.clone());
            }
        }
        drop(state);

        match (&plan.sort, near) {
            (Some(sort), _) => sort_documents(&mut selected, sort),
            (None, Some((field, (x, y)))) => {
                let distance = |doc: &Document| {
                    get_path(doc, &field)
                        .and_then(point)
                        .map_or(f64::INFINITY, |(px, py)| (px - x).hypot(py - y))
                };
                selected.sort_by(|a, b| distance(a).total_cmp(&distance(b)));
            }
            (None, None) => {}
        }

        let skip = usize::try_from(plan.skip).unwrap_or(usize::MAX);
        let limit = plan.limit.map_or(usize::MAX, |limit| usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(selected
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|doc| match &plan.projection {
                Some(projection) => project(&doc, projection),
                None => doc,
            })
            .collect())
    }
}

/// Inclusion projection; `_id` is always kept.
fn project(doc: &Document, projection: &Document) -> Document {
    let mut out = Document::new();
    if let Some(id) = doc.get(ID) {
        out.insert(ID, id.clone());
    }
    for path in projection.keys() {
        if let Some(value) = get_path(doc, path) {
            matcher::set_path(&mut out, path, value.clone());
        }
    }
    out
}

#[async_trait]
impl DocumentCollection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert_many(&self, documents: Vec<Document>) -> DriverResult<Vec<Bson>> {
        let mut state = self.state.lock();
        state.exists = true;
        let mut ids = Vec::with_capacity(documents.len());
        for doc in documents {
            let doc = if doc.contains_key(ID) { doc } else { with_fresh_id(doc) };
            self.check_unique(&state, &doc, None)?;
            ids.push(doc.get(ID).cloned().unwrap_or(Bson::Null));
            state.documents.push(doc);
        }
        Ok(ids)
    }

    async fn find(&self, plan: &FindPlan) -> DriverResult<DocumentCursor> {
        Ok(cursor(self.select(plan)?))
    }

    async fn explain(&self, plan: &FindPlan) -> DriverResult<Document> {
        let state = self.state.lock();
        let stage = match near_clause(&plan.filter) {
            Some(_) => "GEO_NEAR_2D",
            None => "COLLSCAN",
        };
        Ok(doc! {
            "queryPlanner": {
                "namespace": self.namespace.clone(),
                "parsedQuery": plan.filter.clone(),
                "winningPlan": {"stage": stage},
            },
            "executionStats": {"totalDocsExamined": state.documents.len() as i64},
        })
    }

    async fn aggregate(&self, pipeline: Vec<Document>) -> DriverResult<DocumentCursor> {
        let documents = self.state.lock().documents.clone();
        Ok(cursor(aggregate::run(documents, &pipeline)?))
    }

    async fn count(&self, filter: &Document) -> DriverResult<u64> {
        let state = self.state.lock();
        Ok(self.matching(&state, filter)?.len() as u64)
    }

    async fn update_many(&self, filter: &Document, update: &Document, upsert: bool) -> DriverResult<UpdateOutcome> {
        let mut state = self.state.lock();
        let positions = self.matching(&state, filter)?;
        let mut outcome = UpdateOutcome {
            matched: positions.len() as u64,
            ..UpdateOutcome::default()
        };

        for position in positions {
            let mut next = state.documents[position].clone();
            if !update::apply(&mut next, update, false)? {
                continue;
            }
            self.check_unique(&state, &next, Some(position))?;
            state.documents[position] = next;
            outcome.modified += 1;
        }

        if outcome.matched == 0 && upsert {
            let mut inserted = update::seed_from_filter(filter);
            update::apply(&mut inserted, update, true)?;
            if !inserted.contains_key(ID) {
                inserted = with_fresh_id(inserted);
            }
            self.check_unique(&state, &inserted, None)?;
            outcome.upserted_id = inserted.get(ID).cloned();
            state.exists = true;
            state.documents.push(inserted);
        }
        Ok(outcome)
    }

    async fn replace_one(&self, filter: &Document, replacement: Document) -> DriverResult<u64> {
        let mut state = self.state.lock();
        let Some(position) = self.matching(&state, filter)?.into_iter().next() else {
            return Ok(0);
        };
        let mut next = Document::new();
        if let Some(id) = state.documents[position].get(ID) {
            next.insert(ID, id.clone());
        }
        for (key, value) in replacement {
            if key != ID {
                next.insert(key, value);
            }
        }
        self.check_unique(&state, &next, Some(position))?;
        state.documents[position] = next;
        Ok(1)
    }

    async fn delete_many(&self, filter: &Document) -> DriverResult<u64> {
        let mut state = self.state.lock();
        let mut keep = Vec::with_capacity(state.documents.len());
        for doc in &state.documents {
            keep.push(!matches(doc, filter)?);
        }
        let before = state.documents.len();
        let mut flags = keep.into_iter();
        state.documents.retain(|_| flags.next().unwrap_or(true));
        Ok((before - state.documents.len()) as u64)
    }

    async fn create_index(&self, index: IndexModel) -> DriverResult<()> {
        let mut state = self.state.lock();
        if let Some(existing) = state.indexes.iter().find(|existing| existing.name == index.name) {
            if *existing == index {
                return Ok(());
            }
            return Err(BackendFailure::new(
                codes::INDEX_OPTIONS_CONFLICT,
                format!("Index with name: {} already exists with different options", index.name),
            ));
        }
        if index.unique {
            let mut seen: Vec<Vec<(&str, Bson)>> = Vec::new();
            for doc in &state.documents {
                let Some(key) = index_key(&index, doc) else {
                    continue;
                };
                if seen.iter().any(|other| same_key(&key, other)) {
                    return Err(duplicate(&self.namespace, &index.name, &key));
                }
                seen.push(key);
            }
        }
        debug!(collection = %self.name, index = %index.name, "Created index");
        state.exists = true;
        state.indexes.push(index);
        Ok(())
    }

    async fn list_indexes(&self) -> DriverResult<Vec<IndexModel>> {
        let state = self.state.lock();
        if !state.exists {
            return Err(BackendFailure::new(
                codes::NAMESPACE_NOT_FOUND,
                format!("ns does not exist: {}", self.namespace),
            ));
        }
        let mut indexes = vec![IndexModel::new(ID_INDEX, doc! {ID: 1})];
        indexes.extend(state.indexes.iter().cloned());
        Ok(indexes)
    }
}

/// A database living in process memory.
///
/// Collections are created implicitly by their first write or index, the
/// way a document server creates them.
pub struct MemoryDocumentStore {
    database: String,
    collections: RwLock<IndexMap<String, Arc<MemoryCollection>>>,
    online: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collections: RwLock::new(IndexMap::new()),
            online: AtomicBool::new(true),
        }
    }

    /// Make `ping` fail as an unreachable server would.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn entry(&self, name: &str) -> Arc<MemoryCollection> {
        if let Some(collection) = self.collections.read().get(name) {
            return Arc::clone(collection);
        }
        let mut collections = self.collections.write();
        Arc::clone(
            collections
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MemoryCollection::new(&self.database, name))),
        )
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn database(&self) -> &str {
        &self.database
    }

    async fn ping(&self) -> DriverResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendFailure::new(
                codes::CONNECTION_REFUSED,
                format!("connect ECONNREFUSED for database {}", self.database),
            ))
        }
    }

    fn collection(&self, name: &str) -> Arc<dyn DocumentCollection> {
        self.entry(name)
    }

    async fn list_collections(&self) -> DriverResult<Vec<String>> {
        let mut names: Vec<String> = self
            .collections
            .read()
            .iter()
            .filter(|(_, collection)| collection.state.lock().exists)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn create_collection(&self, name: &str) -> DriverResult<()> {
        let collection = self.entry(name);
        let mut state = collection.state.lock();
        if state.exists {
            return Err(BackendFailure::new(
                codes::NAMESPACE_EXISTS,
                format!("Collection already exists. NS: {}", collection.namespace),
            ));
        }
        state.exists = true;
        Ok(())
    }

    async fn drop_collection(&self, name: &str) -> DriverResult<()> {
        let collection = self.entry(name);
        let mut state = collection.state.lock();
        if !state.exists {
            return Err(BackendFailure::new(codes::NAMESPACE_NOT_FOUND, "ns not found"));
        }
        state.reset();
        debug!(collection = name, "Dropped collection");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn people(store: &MemoryDocumentStore) -> Arc<dyn DocumentCollection> {
        let people = store.collection("people");
        people
            .create_index(IndexModel::new("email_1", doc! {"email": 1}).unique(true))
            .await
            .unwrap();
        people
            .insert_many(vec![
                doc! {"name": "Ann", "email": "ann@x", "age": 30},
                doc! {"name": "Bob", "email": "bob@x", "age": 17},
                doc! {"name": "Cid", "age": 41},
            ])
            .await
            .unwrap();
        people
    }

    async fn names(people: &Arc<dyn DocumentCollection>, plan: FindPlan) -> Vec<String> {
        let documents: Vec<Document> = people.find(&plan).await.unwrap().try_collect().await.unwrap();
        documents
            .iter()
            .map(|doc| doc.get_str("name").unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_insert_assigns_object_ids() {
        let store = MemoryDocumentStore::new("app");
        let ids = store
            .collection("notes")
            .insert_many(vec![doc! {"a": 1}, doc! {"a": 2}])
            .await
            .unwrap();

        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(|id| matches!(id, Bson::ObjectId(_))));
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn test_unique_index_reports_server_message() {
        let store = MemoryDocumentStore::new("app");
        let people = people(&store).await;

        let err = people
            .insert_many(vec![doc! {"name": "Ann2", "email": "ann@x"}])
            .await
            .unwrap_err();

        assert_eq!(err.code, codes::DUPLICATE_KEY);
        assert!(err
            .message
            .starts_with("E11000 duplicate key error collection: app.people index: email_1 dup key"));
    }

    #[tokio::test]
    async fn test_sparse_unique_index_skips_missing_fields() {
        let store = MemoryDocumentStore::new("app");
        let people = people(&store).await;

        people.insert_many(vec![doc! {"name": "Dee"}]).await.unwrap();

        assert_eq!(people.count(&doc! {"email": null}).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_find_sorts_pages_and_projects() {
        let store = MemoryDocumentStore::new("app");
        let people = people(&store).await;

        let plan = FindPlan {
            sort: Some(doc! {"age": -1}),
            skip: 1,
            limit: Some(1),
            projection: Some(doc! {"name": 1}),
            ..FindPlan::default()
        };
        let documents: Vec<Document> = people.find(&plan).await.unwrap().try_collect().await.unwrap();

        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].get_str("name").unwrap(), "Ann");
        assert!(documents[0].contains_key("_id"));
        assert!(!documents[0].contains_key("age"));
    }

    #[tokio::test]
    async fn test_near_needs_geo_index_and_orders_by_distance() {
        let store = MemoryDocumentStore::new("app");
        let places = store.collection("places");
        places
            .insert_many(vec![
                doc! {"name": "far", "at": [10.0, 10.0]},
                doc! {"name": "near", "at": [1.0, 1.0]},
                doc! {"name": "nowhere"},
            ])
            .await
            .unwrap();
        let plan = FindPlan {
            filter: doc! {"at": {"$near": [0.0, 0.0]}},
            ..FindPlan::default()
        };

        let err = places.find(&plan).await.err().unwrap();
        assert_eq!(err.code, codes::NO_QUERY_EXECUTION_PLANS);

        places
            .create_index(IndexModel::new("at_2d", doc! {"at": "2d"}))
            .await
            .unwrap();
        assert_eq!(names(&places, plan).await, ["near", "far"]);
    }

    #[tokio::test]
    async fn test_update_many_and_upsert() {
        let store = MemoryDocumentStore::new("app");
        let people = people(&store).await;

        let outcome = people
            .update_many(&doc! {"age": {"$gte": 18}}, &doc! {"$inc": {"age": 1}}, false)
            .await
            .unwrap();
        assert_eq!((outcome.matched, outcome.modified), (2, 2));

        let outcome = people
            .update_many(&doc! {"name": "Eve"}, &doc! {"$set": {"age": 5}}, true)
            .await
            .unwrap();
        assert_eq!(outcome.matched, 0);
        assert!(outcome.upserted_id.is_some());
        assert_eq!(people.count(&doc! {"name": "Eve", "age": 5}).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_cannot_break_unique_index() {
        let store = MemoryDocumentStore::new("app");
        let people = people(&store).await;

        let err = people
            .update_many(&doc! {"name": "Bob"}, &doc! {"$set": {"email": "ann@x"}}, false)
            .await
            .unwrap_err();

        assert_eq!(err.code, codes::DUPLICATE_KEY);
        assert_eq!(people.count(&doc! {"email": "bob@x"}).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replace_keeps_id() {
        let store = MemoryDocumentStore::new("app");
        let people = people(&store).await;
        let before: Vec<Document> = people
            .find(&FindPlan {
                filter: doc! {"name": "Bob"},
                ..FindPlan::default()
            })
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let id = before[0].get("_id").cloned().unwrap();

        let matched = people
            .replace_one(&doc! {"_id": id.clone()}, doc! {"name": "Rob"})
            .await
            .unwrap();

        assert_eq!(matched, 1);
        assert_eq!(people.count(&doc! {"_id": id, "name": "Rob", "age": null}).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_many() {
        let store = MemoryDocumentStore::new("app");
        let people = people(&store).await;

        assert_eq!(people.delete_many(&doc! {"age": {"$lt": 40}}).await.unwrap(), 2);
        assert_eq!(people.count(&doc! {}).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_collection_lifecycle() {
        let store = MemoryDocumentStore::new("app");
        let _ = store.collection("ghost");
        assert!(store.list_collections().await.unwrap().is_empty());

        store.create_collection("notes").await.unwrap();
        let err = store.create_collection("notes").await.unwrap_err();
        assert_eq!(err.code, codes::NAMESPACE_EXISTS);
        assert_eq!(store.list_collections().await.unwrap(), ["notes"]);

        store.drop_collection("notes").await.unwrap();
        let err = store.drop_collection("notes").await.unwrap_err();
        assert_eq!(err.code, codes::NAMESPACE_NOT_FOUND);
        assert!(store.list_collections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_ping() {
        let store = MemoryDocumentStore::new("app");
        store.set_online(false);

        assert_eq!(store.ping().await.unwrap_err().code, codes::CONNECTION_REFUSED);
    }
}
