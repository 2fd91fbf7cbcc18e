//! Local-first shape sync: mirrors remote table shapes into an embedded
//! SQLite database, keeps them live by long-polling, and broadcasts row-level
//! change events to every connected client.

pub mod adapter;
pub mod capability;
pub mod client;
pub mod config;
pub mod core;
pub mod diff;
pub mod error;
pub mod protocol;
pub mod storage;
pub mod transport;
pub mod types;

pub use adapter::ExecutionAdapter;
pub use capability::{Capabilities, ContextStrategy, Environment, StorageStrategy};
pub use client::{Host, SyncClient, Unsubscribe};
pub use config::EngineConfig;
pub use crate::core::{ContextRegistry, CoreHandle, CoreParams};
pub use diff::{diff_rows, KeyedRow, LocalSnapshot};
pub use error::{Error, Result};
pub use protocol::{Broadcast, Request, RequestEnvelope, ResponseBody, ResponseEnvelope, WorkerMessage};
pub use storage::{KeyValueStore, MemoryKeyValueStore};
pub use transport::{
    BatchPayload, ColumnSpec, HttpTransport, ShapeBatch, ShapeChange, ShapeRequest,
    ShapeTransport, TransportError, TransportErrorKind,
};
pub use types::{
    ChangeEvent, ChangeSet, ContinuationToken, EngineStatus, InitOutcome, InitResult, Row,
    RowUpdate, SchemaResetEvent, SchemaResetReason, ShapeAck, ShapeDefinition, ShapeState,
};
