//! Shared data types: rows, shapes, change events, and engine status.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capability::StorageStrategy;

/// One table row as column name → JSON value. Column order is preserved, so
/// a row read twice from the same table serializes identically.
pub type Row = Map<String, Value>;

/// Offset the remote protocol expects on a subscription's first request.
pub const INITIAL_OFFSET: &str = "-1";

// ============================================================================
// Shapes
// ============================================================================

/// Lifecycle of a shape subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeState {
    Pending,
    Syncing,
    Synced,
    Stopped,
    Failed,
}

impl ShapeState {
    /// Pending, syncing and synced subscriptions own a fetch loop.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Syncing | Self::Synced)
    }
}

/// What a caller asks the engine to mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeDefinition {
    pub shape_name: String,
    pub table_name: String,
    pub shape_url: String,
    /// `CREATE TABLE` statement applied when the table is unknown locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Keep long-polling after the initial snapshot.
    #[serde(default = "default_live")]
    pub live: bool,
}

fn default_live() -> bool {
    true
}

impl ShapeDefinition {
    pub fn new(
        shape_name: impl Into<String>,
        table_name: impl Into<String>,
        shape_url: impl Into<String>,
    ) -> Self {
        Self {
            shape_name: shape_name.into(),
            table_name: table_name.into(),
            shape_url: shape_url.into(),
            schema: None,
            live: true,
        }
    }

    pub fn with_schema(mut self, ddl: impl Into<String>) -> Self {
        self.schema = Some(ddl.into());
        self
    }

    pub fn once(mut self) -> Self {
        self.live = false;
        self
    }
}

/// Opaque resume position returned by the remote shape endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationToken {
    pub offset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

impl ContinuationToken {
    pub fn initial() -> Self {
        Self {
            offset: INITIAL_OFFSET.to_string(),
            handle: None,
        }
    }

    pub fn is_initial(&self) -> bool {
        self.offset == INITIAL_OFFSET && self.handle.is_none()
    }

    /// Adopt whatever parts of a new token the server sent.
    pub fn advance(&mut self, offset: Option<&str>, handle: Option<&str>) {
        if let Some(offset) = offset {
            self.offset = offset.to_string();
        }
        if let Some(handle) = handle {
            self.handle = Some(handle.to_string());
        }
    }
}

impl Default for ContinuationToken {
    fn default() -> Self {
        Self::initial()
    }
}

// ============================================================================
// Change events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowUpdate {
    pub old: Row,
    pub new: Row,
}

/// Row-level differences produced by one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub insert: Vec<Row>,
    pub update: Vec<RowUpdate>,
    pub delete: Vec<Row>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }

    pub fn len(&self) -> usize {
        self.insert.len() + self.update.len() + self.delete.len()
    }
}

/// A change set addressed to one shape. Delivered to listeners, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub shape_name: String,
    pub table_name: String,
    pub changes: ChangeSet,
}

// ============================================================================
// Schema versioning
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaResetReason {
    VersionMismatch,
    ForceReset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaResetEvent {
    pub reason: SchemaResetReason,
    pub old_version: Option<String>,
    pub new_version: Option<String>,
}

/// How `init` reconciled the persisted schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitOutcome {
    /// Nothing persisted; a fresh database was created.
    FirstRun,
    Matched,
    /// Persisted version differed; the database was destroyed and recreated.
    Reset,
}

// ============================================================================
// RPC results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResult {
    pub success: bool,
    pub schema_version: String,
    pub outcome: InitOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeAck {
    pub shape_name: String,
    /// Rows in the local table once the initial snapshot was applied. `None`
    /// when the call did not wait for a snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<u64>,
    /// The shape was already active and the call was a no-op.
    #[serde(default)]
    pub already_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetAck {
    pub schema_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Rows changed by the last statement of the batch.
    pub changes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pong {
    pub pong: bool,
    pub timestamp_ms: i64,
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeStatus {
    pub shape_name: String,
    pub table_name: String,
    pub state: ShapeState,
    pub offset: Option<String>,
    pub last_error: Option<String>,
}

/// Process-wide engine status. The sync core holds the authoritative copy;
/// each client mirrors it from broadcasts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub is_ready: bool,
    pub is_initializing: bool,
    pub error: Option<String>,
    pub connected_tab_count: usize,
    pub active_shape_names: Vec<String>,
    pub schema_version: Option<String>,
    #[serde(default)]
    pub storage: Option<StorageStrategy>,
    #[serde(default)]
    pub shapes: Vec<ShapeStatus>,
}
