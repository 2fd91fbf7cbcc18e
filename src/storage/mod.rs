//! Storage backends for the embedded database.

pub mod file;
pub mod key_value;
pub mod sqlite;
pub mod traits;

use std::sync::Arc;

pub use file::FileStore;
pub use key_value::{KeyValueBackedStore, MemoryKeyValueStore};
pub use traits::{KeyValueStore, LocalStore, META_SCHEMA_VERSION};

use crate::capability::{ContextStrategy, StorageStrategy};
use crate::config::EngineConfig;
use crate::error::Result;

/// Open the store for `strategy`. A file-backed store that fails to open
/// (some hosts advertise a file system but refuse handles later) falls back
/// to the key-value-backed store.
///
/// A `PerTab` core gets its own temporary database file; only `Shared`
/// cores open the database named after the engine.
pub fn open_store(
    strategy: StorageStrategy,
    context: ContextStrategy,
    config: &EngineConfig,
    kv: Arc<dyn KeyValueStore>,
) -> Result<Box<dyn LocalStore>> {
    if strategy == StorageStrategy::FileBacked {
        let opened = match context {
            ContextStrategy::Shared => config.database_path().map(|p| (FileStore::open(&p), p)),
            ContextStrategy::PerTab => config
                .private_database_path(&uuid::Uuid::new_v4().simple().to_string())
                .map(|p| (FileStore::open_temporary(&p), p)),
        };
        match opened {
            Some((opened, path)) => match opened {
                Ok(store) => return Ok(Box::new(store)),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "file-backed store unavailable, using key-value store"
                    );
                }
            },
            None => tracing::warn!("no data directory configured, using key-value store"),
        }
    }
    Ok(Box::new(KeyValueBackedStore::open(&config.name, kv)?))
}
