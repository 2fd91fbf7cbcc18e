//! Runtime capability detection.
//!
//! Probes return explicit `Result`s; `select` turns probe outcomes into the
//! chosen strategies without side effects. Every failure degrades to the
//! safest fallback (`PerTab` + `KeyValueBacked`), never to an error.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where the sync core runs relative to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    /// One core per name, shared by every client that connects with it.
    Shared,
    /// A private core per client.
    PerTab,
}

/// Which backend holds the embedded database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageStrategy {
    FileBacked,
    KeyValueBacked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub context_strategy: ContextStrategy,
    pub storage_strategy: StorageStrategy,
}

impl Capabilities {
    pub const FALLBACK: Capabilities = Capabilities {
        context_strategy: ContextStrategy::PerTab,
        storage_strategy: StorageStrategy::KeyValueBacked,
    };
}

/// What the host offers. Built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    /// Whether a named background context can be reached identically from
    /// several independent clients.
    pub shared_contexts: bool,
    /// Origin-private directory for the file-backed store, if any.
    pub data_dir: Option<PathBuf>,
}

impl Environment {
    pub fn new(data_dir: Option<PathBuf>) -> Self {
        Self {
            shared_contexts: true,
            data_dir,
        }
    }

    /// An environment with no shared contexts and no file system.
    pub fn isolated() -> Self {
        Self {
            shared_contexts: false,
            data_dir: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("shared execution contexts are not available")]
    SharedContextUnavailable,

    #[error("no private file system directory is configured")]
    NoFileSystem,

    #[error("file system probe failed at {path}: {source}")]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub fn probe_shared_context(env: &Environment) -> Result<(), ProbeError> {
    if env.shared_contexts {
        Ok(())
    } else {
        Err(ProbeError::SharedContextUnavailable)
    }
}

/// Check that a directory handle can actually be obtained under `dir`:
/// create it, create a uniquely named trial directory inside, remove it.
pub fn probe_file_storage(dir: Option<&Path>) -> Result<(), ProbeError> {
    let dir = dir.ok_or(ProbeError::NoFileSystem)?;
    fs::create_dir_all(dir).map_err(|source| ProbeError::FileSystem {
        path: dir.to_path_buf(),
        source,
    })?;
    let trial = dir.join(format!(".probe-{}", uuid::Uuid::new_v4()));
    fs::create_dir(&trial).map_err(|source| ProbeError::FileSystem {
        path: trial.clone(),
        source,
    })?;
    fs::remove_dir(&trial).map_err(|source| ProbeError::FileSystem {
        path: trial,
        source,
    })?;
    Ok(())
}

/// Pure strategy selection from probe outcomes.
pub fn select(
    shared: &Result<(), ProbeError>,
    storage: &Result<(), ProbeError>,
) -> Capabilities {
    Capabilities {
        context_strategy: match shared {
            Ok(()) => ContextStrategy::Shared,
            Err(_) => ContextStrategy::PerTab,
        },
        storage_strategy: match storage {
            Ok(()) => StorageStrategy::FileBacked,
            Err(_) => StorageStrategy::KeyValueBacked,
        },
    }
}

/// Probe the environment once and pick strategies.
pub fn detect(env: &Environment) -> Capabilities {
    let shared = probe_shared_context(env);
    let storage = probe_file_storage(env.data_dir.as_deref());
    if let Err(e) = &shared {
        tracing::debug!(error = %e, "falling back to per-client execution context");
    }
    if let Err(e) = &storage {
        tracing::debug!(error = %e, "falling back to key-value storage");
    }
    let caps = select(&shared, &storage);
    tracing::info!(
        context = ?caps.context_strategy,
        storage = ?caps.storage_strategy,
        "capabilities detected"
    );
    caps
}
