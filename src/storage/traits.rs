//! Storage traits: the embedded database store and the key-value store used
//! for engine metadata when no file system is available.

use rusqlite::Connection;

use crate::capability::StorageStrategy;
use crate::error::Result;

/// Metadata key under which the accepted schema version is persisted.
pub const META_SCHEMA_VERSION: &str = "schema_version";

/// The embedded database plus its metadata, owned by the sync core.
///
/// Implementations are `Send` so the store can move onto the core thread;
/// they are never shared between threads.
pub trait LocalStore: Send {
    fn strategy(&self) -> StorageStrategy;

    /// The open SQLite connection.
    fn connection(&self) -> &Connection;

    fn get_meta(&self, key: &str) -> Result<Option<String>>;
    fn set_meta(&self, key: &str, value: &str) -> Result<()>;
    fn remove_meta(&self, key: &str) -> Result<()>;

    /// Destroy every table and all metadata, leaving an empty, open database.
    fn wipe(&mut self) -> Result<()>;
}

/// Minimal string key-value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
    /// Remove every key starting with `prefix`.
    fn clear_prefix(&self, prefix: &str);
}
