//! # Tessera Core
//!
//! Backend-independent pieces of the tessera persistence layer:
//!
//! - [`condition`]: the condition algebra and its recursive-descent parser
//! - [`query`]: the explicit query specification consumed by translators
//! - [`schema`] and [`types`]: logical column types, schemas and the
//!   schema registry, validated against backend [`Capabilities`]
//! - [`coerce`]: validation and per-family type codecs
//! - [`normalize`]: mapping backend failures onto [`StoreError`]
//! - [`adapter`]: the [`Adapter`] contract every backend implements

pub mod adapter;
pub mod coerce;
pub mod condition;
pub mod error;
pub mod normalize;
pub mod query;
pub mod schema;
pub mod types;
pub mod update;
pub mod value;

pub use adapter::{
    error_stream, insert_in_chunks, rows_stream, Adapter, ConnectionCell, ConnectionState,
    ForeignKeyListing, IndexListing, RowStream, BULK_CHUNK_SIZE,
};
pub use condition::{Condition, Conjunction, Operator, Predicate, Test};
pub use error::{FieldError, FieldErrorKind, StoreError, StoreResult};
pub use normalize::{BackendFailure, ErrorNormalizer};
pub use query::{FindOptions, GroupExpr, Near, Order, QuerySpec, SortDirection};
pub use schema::{
    ColumnDescriptor, FieldRef, ForeignKeyDescriptor, IndexDescriptor, OnDelete, Property, Schema,
    SchemaBuilder, SchemaDescriptor, SchemaRegistry, TableDescriptor, ID_FIELD,
};
pub use types::{BackendFamily, Capabilities, LogicalType};
pub use update::{partial_from_row, FieldUpdate, PartialRow};
pub use value::{json_row, GeoPoint, Pattern, RecordId, Row, Value};
