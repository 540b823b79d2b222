//! Driver seam for key-value stores.
//!
//! The adapter needs a handful of commands: a counter, hash field reads and
//! writes, key deletion and glob enumeration. Failures come back as
//! [`BackendFailure`]s carrying the server's error prefix.

use async_trait::async_trait;
use indexmap::IndexMap;

use tessera_core::BackendFailure;

/// Server error prefixes the adapter reacts to.
pub mod codes {
    pub const GENERIC: &str = "ERR";
    pub const WRONG_TYPE: &str = "WRONGTYPE";
    pub const CONNECTION_REFUSED: &str = "ECONNREFUSED";
}

/// Result type for driver calls
pub type DriverResult<T> = Result<T, BackendFailure>;

/// Field → value of one hash.
pub type Hash = IndexMap<String, String>;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn ping(&self) -> DriverResult<()>;

    /// Switch to the logical database `index`.
    async fn select(&self, index: u8) -> DriverResult<()>;

    /// Increment the integer at `key`, starting from 0. Returns the new value.
    async fn incr(&self, key: &str) -> DriverResult<i64>;

    /// Write `fields` into the hash at `key`, creating it when absent.
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> DriverResult<()>;

    /// Every field of the hash at `key`; `None` when the key does not exist.
    async fn hgetall(&self, key: &str) -> DriverResult<Option<Hash>>;

    /// Remove `fields` from the hash at `key`. Returns how many existed.
    async fn hdel(&self, key: &str, fields: &[String]) -> DriverResult<u64>;

    /// Remove `keys`. Returns how many existed.
    async fn del(&self, keys: &[String]) -> DriverResult<u64>;

    async fn exists(&self, key: &str) -> DriverResult<bool>;

    /// Keys matching a glob (`*`, `?`).
    async fn keys(&self, pattern: &str) -> DriverResult<Vec<String>>;
}
