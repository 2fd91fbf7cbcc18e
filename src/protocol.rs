//! Messages exchanged between RPC clients and the sync core.
//!
//! Requests carry a numeric id and are answered by exactly one response with
//! the same id. Broadcasts carry no id and go to every connected client.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    ChangeSet, EngineStatus, ExecResult, InitResult, Pong, ResetAck, Row, SchemaResetReason,
    ShapeAck, ShapeDefinition,
};

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Request {
    Init,
    SyncShape {
        shape_name: String,
        table_name: String,
        shape_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        schema: Option<String>,
        #[serde(default = "default_live")]
        live: bool,
    },
    StopShape {
        shape_name: String,
    },
    ForceReset,
    Query {
        sql: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        params: Vec<Value>,
    },
    Exec {
        sql: String,
    },
    GetStatus,
    Ping,
}

fn default_live() -> bool {
    true
}

impl Request {
    pub fn sync_shape(def: ShapeDefinition) -> Self {
        Self::SyncShape {
            shape_name: def.shape_name,
            table_name: def.table_name,
            shape_url: def.shape_url,
            schema: def.schema,
            live: def.live,
        }
    }

    /// Wire tag, used in log fields.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::SyncShape { .. } => "SYNC_SHAPE",
            Self::StopShape { .. } => "STOP_SHAPE",
            Self::ForceReset => "FORCE_RESET",
            Self::Query { .. } => "QUERY",
            Self::Exec { .. } => "EXEC",
            Self::GetStatus => "GET_STATUS",
            Self::Ping => "PING",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseBody {
    InitResult { result: InitResult },
    SyncShapeResult { result: ShapeAck },
    StopShapeResult { result: ShapeAck },
    ForceResetResult { result: ResetAck },
    QueryResult { result: Vec<Row> },
    ExecResult { result: ExecResult },
    GetStatusResult { result: EngineStatus },
    PingResult { result: Pong },
    Error { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    pub fn error(id: u64, error: impl ToString) -> Self {
        Self {
            id,
            body: ResponseBody::Error {
                error: error.to_string(),
            },
        }
    }
}

// ============================================================================
// Broadcasts
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Broadcast {
    Connected {
        is_ready: bool,
        is_initializing: bool,
        error: Option<String>,
        connected_tabs: usize,
        active_shapes: Vec<String>,
        schema_version: Option<String>,
    },
    DbReady {
        schema_version: String,
    },
    DbError {
        error: String,
    },
    ShapeSynced {
        shape_name: String,
        record_count: u64,
    },
    ShapeStopped {
        shape_name: String,
    },
    SchemaReset {
        reason: SchemaResetReason,
        old_version: Option<String>,
        new_version: Option<String>,
    },
    DataChange {
        shape_name: String,
        table_name: String,
        changes: ChangeSet,
    },
}

impl Broadcast {
    pub fn connected(status: &EngineStatus) -> Self {
        Self::Connected {
            is_ready: status.is_ready,
            is_initializing: status.is_initializing,
            error: status.error.clone(),
            connected_tabs: status.connected_tab_count,
            active_shapes: status.active_shape_names.clone(),
            schema_version: status.schema_version.clone(),
        }
    }
}

/// Anything the sync core sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    Response(ResponseEnvelope),
    Broadcast(Broadcast),
}
