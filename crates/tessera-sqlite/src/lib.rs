//! SQLite adapter for tessera
//!
//! Implements the [`Adapter`](tessera_core::Adapter) contract over an embedded
//! SQLite database, with statements built by the shared SQL translator.
//!
//! ## Features
//!
//! - **WAL Mode**: write-ahead logging for file databases
//! - **REGEXP**: a `regexp` function backed by the `regex` crate, so regex
//!   predicates work like on the server dialects
//! - **Introspection**: tables, columns, indexes and foreign keys read back
//!   through the `pragma_*` table-valued functions
//! - **Thread Safety**: Arc<Mutex<Connection>> pattern, statements run in
//!   `spawn_blocking`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tessera_core::{Adapter, Capabilities, LogicalType, QuerySpec, Schema};
//! use tessera_sqlite::SqliteAdapter;
//!
//! let adapter = SqliteAdapter::new(SqliteSettings::new("./app.db"));
//! adapter.connect().await?;
//!
//! let users = Schema::builder("users")
//!     .column("name", LogicalType::STRING)
//!     .build(adapter.capabilities())?;
//! adapter.create_table(&users).await?;
//! let rows = adapter.find(&users, &QuerySpec::new().order("name")).await?;
//! ```

pub mod adapter;
pub mod connection;
pub mod error;
mod introspect;
mod statement;

pub use adapter::SqliteAdapter;
pub use connection::SqlitePool;
pub use error::{SqliteError, SqliteResult};
