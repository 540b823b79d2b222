//! Document-store adapter for tessera
//!
//! Implements the [`Adapter`](tessera_core::Adapter) contract over any driver
//! behind the [`DocumentStore`] seam. Filters, update documents and
//! aggregation pipelines come from the shared
//! [`DocumentTranslator`](tessera_query::DocumentTranslator); driver failures
//! are normalized by their server codes.
//!
//! [`MemoryDocumentStore`] is an in-process driver that evaluates those
//! native query objects itself, with unique/sparse and `2d` indexes.
//!
//! ```rust,ignore
//! use tessera_document::DocumentAdapter;
//!
//! let adapter = DocumentAdapter::memory(settings);
//! adapter.connect().await?;
//! adapter.create_table(&people).await?;
//! let id = adapter.create(&people, json_row(json!({"name": "Ann"}))).await?;
//! ```

pub mod adapter;
pub mod memory;
pub mod store;

pub use adapter::DocumentAdapter;
pub use memory::{MemoryCollection, MemoryDocumentStore};
pub use store::{DocumentCollection, DocumentCursor, DocumentStore, DriverResult, IndexModel, UpdateOutcome};
