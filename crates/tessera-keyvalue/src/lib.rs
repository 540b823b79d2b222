//! Key-value adapter for tessera
//!
//! Implements the [`Adapter`](tessera_core::Adapter) contract for stores
//! that only know keys, counters and hashes, over any driver behind the
//! [`KeyValueStore`] seam. Conditions narrow reads and writes only through
//! `id` equality and membership; see
//! [`KeyspaceTranslator`](tessera_query::KeyspaceTranslator).
//!
//! [`MemoryKeyValueStore`] is an in-process driver with one keyspace per
//! logical database.
//!
//! ```rust,ignore
//! use tessera_keyvalue::KeyValueAdapter;
//!
//! let adapter = KeyValueAdapter::memory(KeyValueSettings::default());
//! adapter.connect().await?;
//! let id = adapter.create(&sessions, json_row(json!({"user": "ann"}))).await?;
//! ```

pub mod adapter;
pub mod memory;
pub mod store;

pub use adapter::{KeyValueAdapter, SENTINEL};
pub use memory::MemoryKeyValueStore;
pub use store::{DriverResult, Hash, KeyValueStore};
