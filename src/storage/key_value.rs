//! Key-value-backed store for hosts without a usable file system.
//!
//! Rows live in an in-memory SQLite database and are re-fetched by shapes
//! after a restart. Only engine metadata (the schema version) goes to the
//! key-value store, under a per-engine key prefix.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::capability::StorageStrategy;
use crate::error::Result;
use crate::storage::traits::{KeyValueStore, LocalStore};

/// Process-local `KeyValueStore`. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyValueStore {
    map: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle to the process-wide store, so metadata outlives any single
    /// sync core.
    pub fn shared() -> Self {
        static SHARED: OnceLock<MemoryKeyValueStore> = OnceLock::new();
        SHARED.get_or_init(MemoryKeyValueStore::new).clone()
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.map.lock().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.map.lock().remove(key);
    }

    fn clear_prefix(&self, prefix: &str) {
        self.map.lock().retain(|k, _| !k.starts_with(prefix));
    }
}

pub struct KeyValueBackedStore {
    conn: Connection,
    kv: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl KeyValueBackedStore {
    pub fn open(name: &str, kv: Arc<dyn KeyValueStore>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn,
            kv,
            prefix: format!("{name}:"),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

impl LocalStore for KeyValueBackedStore {
    fn strategy(&self) -> StorageStrategy {
        StorageStrategy::KeyValueBacked
    }

    fn connection(&self) -> &Connection {
        &self.conn
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self.kv.get(&self.key(key)))
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.kv.set(&self.key(key), value);
        Ok(())
    }

    fn remove_meta(&self, key: &str) -> Result<()> {
        self.kv.remove(&self.key(key));
        Ok(())
    }

    fn wipe(&mut self) -> Result<()> {
        self.kv.clear_prefix(&self.prefix);
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn = conn;
        tracing::info!(prefix = %self.prefix, "key-value store wiped");
        Ok(())
    }
}
