//! In-process key-value store.
//!
//! Keeps one ordered keyspace per logical database. Only the two value kinds
//! the adapter uses exist: integer counters and hashes. Using a key as the
//! other kind fails with `WRONGTYPE`, as a server would.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;

use tessera_core::BackendFailure;

use crate::store::{codes, DriverResult, Hash, KeyValueStore};

#[derive(Debug, Clone)]
enum Entry {
    Counter(i64),
    Hash(Hash),
}

type Keyspace = BTreeMap<String, Entry>;

fn wrong_type() -> BackendFailure {
    BackendFailure::new(
        codes::WRONG_TYPE,
        "WRONGTYPE Operation against a key holding the wrong kind of value",
    )
}

/// Compile a glob where `*` matches any run and `?` one character.
fn glob(pattern: &str) -> DriverResult<Regex> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    let mut buffer = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut buffer))),
        }
    }
    source.push('$');
    Regex::new(&source).map_err(|err| BackendFailure::new(codes::GENERIC, err.to_string()))
}

/// Key-value store held in memory.
pub struct MemoryKeyValueStore {
    databases: Mutex<HashMap<u8, Keyspace>>,
    selected: AtomicU8,
    online: AtomicBool,
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self {
            databases: Mutex::new(HashMap::new()),
            selected: AtomicU8::new(0),
            online: AtomicBool::new(true),
        }
    }

    /// Simulate the server going away (or coming back).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn with_keyspace<T>(&self, command: impl FnOnce(&mut Keyspace) -> DriverResult<T>) -> DriverResult<T> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(BackendFailure::new(
                codes::CONNECTION_REFUSED,
                "connect ECONNREFUSED 127.0.0.1:6379",
            ));
        }
        let mut databases = self.databases.lock();
        let keyspace = databases
            .entry(self.selected.load(Ordering::SeqCst))
            .or_default();
        command(keyspace)
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn ping(&self) -> DriverResult<()> {
        self.with_keyspace(|_| Ok(()))
    }

    async fn select(&self, index: u8) -> DriverResult<()> {
        self.with_keyspace(|_| Ok(()))?;
        self.selected.store(index, Ordering::SeqCst);
        Ok(())
    }

    async fn incr(&self, key: &str) -> DriverResult<i64> {
        self.with_keyspace(|keyspace| {
            match keyspace.entry(key.to_string()).or_insert(Entry::Counter(0)) {
                Entry::Counter(value) => {
                    *value = value.checked_add(1).ok_or_else(|| {
                        BackendFailure::new(codes::GENERIC, "ERR increment or decrement would overflow")
                    })?;
                    Ok(*value)
                }
                Entry::Hash(_) => Err(wrong_type()),
            }
        })
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> DriverResult<()> {
        if fields.is_empty() {
            return Err(BackendFailure::new(
                codes::GENERIC,
                "ERR wrong number of arguments for 'hset' command",
            ));
        }
        self.with_keyspace(|keyspace| {
            match keyspace
                .entry(key.to_string())
                .or_insert_with(|| Entry::Hash(Hash::new()))
            {
                Entry::Hash(hash) => {
                    hash.extend(fields.iter().cloned());
                    Ok(())
                }
                Entry::Counter(_) => Err(wrong_type()),
            }
        })
    }

    async fn hgetall(&self, key: &str) -> DriverResult<Option<Hash>> {
        self.with_keyspace(|keyspace| match keyspace.get(key) {
            None => Ok(None),
            Some(Entry::Hash(hash)) => Ok(Some(hash.clone())),
            Some(Entry::Counter(_)) => Err(wrong_type()),
        })
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> DriverResult<u64> {
        self.with_keyspace(|keyspace| {
            let removed = match keyspace.get_mut(key) {
                None => return Ok(0),
                Some(Entry::Counter(_)) => return Err(wrong_type()),
                Some(Entry::Hash(hash)) => {
                    let removed = fields
                        .iter()
                        .filter(|field| hash.shift_remove(field.as_str()).is_some())
                        .count();
                    if hash.is_empty() {
                        keyspace.remove(key);
                    }
                    removed
                }
            };
            Ok(removed as u64)
        })
    }

    async fn del(&self, keys: &[String]) -> DriverResult<u64> {
        self.with_keyspace(|keyspace| {
            Ok(keys.iter().filter(|key| keyspace.remove(key.as_str()).is_some()).count() as u64)
        })
    }

    async fn exists(&self, key: &str) -> DriverResult<bool> {
        self.with_keyspace(|keyspace| Ok(keyspace.contains_key(key)))
    }

    async fn keys(&self, pattern: &str) -> DriverResult<Vec<String>> {
        let pattern = glob(pattern)?;
        self.with_keyspace(|keyspace| {
            Ok(keyspace
                .keys()
                .filter(|key| pattern.is_match(key))
                .cloned()
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(field, value)| (field.to_string(), value.to_string()))
            .collect()
    }

    #[test_case("users:*", "users:1", true ; "star")]
    #[test_case("users:*", "users:_lastid", true ; "star matches counter")]
    #[test_case("users:*", "users_archive:1", false ; "other table")]
    #[test_case("users:?", "users:12", false ; "question mark is one character")]
    #[test_case("a.b:*", "axb:1", false ; "dot is literal")]
    fn test_glob(pattern: &str, key: &str, expected: bool) {
        assert_eq!(glob(pattern).unwrap().is_match(key), expected);
    }

    #[tokio::test]
    async fn test_counter() {
        let store = MemoryKeyValueStore::new();

        assert_eq!(store.incr("users:_lastid").await.unwrap(), 1);
        assert_eq!(store.incr("users:_lastid").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_hash_commands() {
        let store = MemoryKeyValueStore::new();
        store.hset("users:1", &fields(&[("name", "a"), ("age", "3")])).await.unwrap();
        store.hset("users:1", &fields(&[("age", "4")])).await.unwrap();

        let hash = store.hgetall("users:1").await.unwrap().unwrap();
        assert_eq!(hash["name"], "a");
        assert_eq!(hash["age"], "4");

        assert_eq!(store.hdel("users:1", &["age".to_string(), "nope".to_string()]).await.unwrap(), 1);
        assert_eq!(store.hdel("users:1", &["name".to_string()]).await.unwrap(), 1);
        assert!(!store.exists("users:1").await.unwrap());
        assert_eq!(store.hgetall("users:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = MemoryKeyValueStore::new();
        store.incr("users:_lastid").await.unwrap();

        let err = store.hgetall("users:_lastid").await.unwrap_err();

        assert_eq!(err.code, codes::WRONG_TYPE);
    }

    #[tokio::test]
    async fn test_keys_and_del() {
        let store = MemoryKeyValueStore::new();
        for key in ["users:2", "users:1", "posts:1"] {
            store.hset(key, &fields(&[("$_$", "")])).await.unwrap();
        }

        assert_eq!(store.keys("users:*").await.unwrap(), ["users:1", "users:2"]);
        assert_eq!(
            store
                .del(&["users:1".to_string(), "users:9".to_string()])
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.keys("*").await.unwrap(), ["posts:1", "users:2"]);
    }

    #[tokio::test]
    async fn test_databases_are_separate() {
        let store = MemoryKeyValueStore::new();
        store.incr("n").await.unwrap();

        store.select(3).await.unwrap();

        assert!(!store.exists("n").await.unwrap());
    }

    #[tokio::test]
    async fn test_offline_store_refuses_commands() {
        let store = MemoryKeyValueStore::new();
        store.set_online(false);

        let err = store.ping().await.unwrap_err();

        assert_eq!(err.code, codes::CONNECTION_REFUSED);
    }
}
