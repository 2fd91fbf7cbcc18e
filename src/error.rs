//! Error types for the shape sync engine.

use thiserror::Error;

use crate::transport::TransportError;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// SQL error from the embedded database. Displayed verbatim so callers
    /// of `query`/`exec` see the underlying message.
    #[error("{0}")]
    Sql(#[from] rusqlite::Error),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("request {id} timed out after {timeout_ms}ms")]
    Timeout { id: u64, timeout_ms: u64 },

    #[error("database is not ready; call init() first")]
    NotReady,

    #[error("execution context is disconnected")]
    Disconnected,

    /// An `ERROR` response from the sync core, message verbatim.
    #[error("{0}")]
    Remote(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("table {0:?} does not exist locally and no schema was supplied")]
    TableMissing(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// True for the local RPC timeout, as opposed to a failure reported by
    /// the sync core.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
