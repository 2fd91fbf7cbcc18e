//! Remote shape endpoint: transport trait, batch types, and body parsing.

pub mod http;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::types::{ContinuationToken, Row};

pub use http::HttpTransport;

// ============================================================================
// ShapeTransport — network layer
// ============================================================================

/// Network access to the shape and schema-version endpoints.
///
/// `HttpTransport` talks to a real server; tests script their own.
#[async_trait]
pub trait ShapeTransport: Send + Sync {
    /// Issue one shape request. Long-polls when `request.live` is set.
    async fn fetch_shape(&self, request: &ShapeRequest) -> Result<ShapeBatch, TransportError>;

    /// Fetch the server's current schema version.
    async fn fetch_schema_version(&self, url: &str) -> Result<String, TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeRequest {
    pub url: String,
    pub table: String,
    pub token: ContinuationToken,
    pub live: bool,
}

// ============================================================================
// Batches
// ============================================================================

/// One explicit operation from a change-stream response.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeChange {
    Insert(Row),
    /// Primary key plus the changed columns.
    Update(Row),
    /// Primary key columns only.
    Delete(Row),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchPayload {
    Changes(Vec<ShapeChange>),
    /// The complete result set of the shape.
    Snapshot(Vec<Row>),
}

/// Column of the remote table, from the `electric-schema` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub remote_type: String,
    pub pk_index: Option<u32>,
    pub not_null: bool,
}

/// One response from the shape endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeBatch {
    pub payload: BatchPayload,
    pub offset: Option<String>,
    pub handle: Option<String>,
    /// The client has caught up with the server.
    pub up_to_date: bool,
    /// The server discarded this shape's log; start over from the initial
    /// offset.
    pub must_refetch: bool,
    /// Empty when the response carried no schema.
    pub schema: Vec<ColumnSpec>,
}

impl ShapeBatch {
    pub fn changes(changes: Vec<ShapeChange>) -> Self {
        Self {
            payload: BatchPayload::Changes(changes),
            offset: None,
            handle: None,
            up_to_date: false,
            must_refetch: false,
            schema: Vec::new(),
        }
    }

    /// A full result set. Complete by definition, so it is up to date.
    pub fn snapshot(rows: Vec<Row>) -> Self {
        Self {
            payload: BatchPayload::Snapshot(rows),
            up_to_date: true,
            ..Self::changes(Vec::new())
        }
    }

    pub fn must_refetch() -> Self {
        Self {
            must_refetch: true,
            ..Self::changes(Vec::new())
        }
    }

    pub fn with_token(mut self, offset: impl Into<String>, handle: impl Into<String>) -> Self {
        self.offset = Some(offset.into());
        self.handle = Some(handle.into());
        self
    }

    pub fn up_to_date(mut self) -> Self {
        self.up_to_date = true;
        self
    }

    pub fn with_schema(mut self, schema: Vec<ColumnSpec>) -> Self {
        self.schema = schema;
        self
    }

    pub fn len(&self) -> usize {
        match &self.payload {
            BatchPayload::Changes(c) => c.len(),
            BatchPayload::Snapshot(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Network failures, timeouts, throttling and server errors.
    Transient,
    /// Requests the server will keep rejecting.
    Permanent,
}

impl TransportErrorKind {
    pub fn from_status(status: u16) -> Self {
        if matches!(status, 408 | 425 | 429 | 500..=599) {
            Self::Transient
        } else {
            Self::Permanent
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub message: String,
    pub kind: TransportErrorKind,
    pub status: Option<u16>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TransportErrorKind::Transient,
            status: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Permanent,
            ..Self::new(message)
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: TransportErrorKind::from_status(status),
            status: Some(status),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == TransportErrorKind::Transient
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {status}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for TransportError {}

// ============================================================================
// Body parsing
// ============================================================================

/// Parsed shape response body.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBody {
    pub payload: BatchPayload,
    pub up_to_date: bool,
    pub must_refetch: bool,
}

/// Parse a shape response body.
///
/// Two forms are accepted: a change stream of `{headers, value}` messages
/// (with `control` messages for `up-to-date` and `must-refetch`), or a plain
/// array of rows, which is a complete snapshot. An empty array is an empty,
/// up-to-date change set.
pub fn parse_shape_body(body: &str) -> Result<ParsedBody, TransportError> {
    if body.trim().is_empty() {
        return Ok(ParsedBody {
            payload: BatchPayload::Changes(Vec::new()),
            up_to_date: false,
            must_refetch: false,
        });
    }
    let value: Value = serde_json::from_str(body)
        .map_err(|e| TransportError::permanent(format!("invalid shape body: {e}")))?;
    let Value::Array(items) = value else {
        return Err(TransportError::permanent("shape body is not a JSON array"));
    };

    // Nothing to apply and nothing pending. Read as an empty change set so
    // an empty live response never wipes the table.
    if items.is_empty() {
        return Ok(ParsedBody {
            payload: BatchPayload::Changes(Vec::new()),
            up_to_date: true,
            must_refetch: false,
        });
    }

    let is_stream = items
        .iter()
        .any(|item| item.get("headers").is_some_and(Value::is_object));
    if !is_stream {
        let rows = items
            .into_iter()
            .map(|item| match item {
                Value::Object(row) => Ok(row),
                other => Err(TransportError::permanent(format!(
                    "snapshot row is not an object: {other}"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(ParsedBody {
            payload: BatchPayload::Snapshot(rows),
            up_to_date: true,
            must_refetch: false,
        });
    }

    let mut parsed = ParsedBody {
        payload: BatchPayload::Changes(Vec::new()),
        up_to_date: false,
        must_refetch: false,
    };
    let mut changes = Vec::new();
    for item in items {
        let headers = item
            .get("headers")
            .and_then(Value::as_object)
            .ok_or_else(|| TransportError::permanent("change message without headers"))?;
        if let Some(control) = headers.get("control").and_then(Value::as_str) {
            match control {
                "up-to-date" => parsed.up_to_date = true,
                "must-refetch" => parsed.must_refetch = true,
                other => tracing::trace!(control = other, "ignoring control message"),
            }
            continue;
        }
        let operation = headers
            .get("operation")
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::permanent("change message without operation"))?;
        let row = match item.get("value") {
            Some(Value::Object(row)) => row.clone(),
            _ => return Err(TransportError::permanent("change message without a row value")),
        };
        changes.push(match operation {
            "insert" => ShapeChange::Insert(row),
            "update" => ShapeChange::Update(row),
            "delete" => ShapeChange::Delete(row),
            other => {
                return Err(TransportError::permanent(format!(
                    "unknown change operation {other:?}"
                )))
            }
        });
    }
    parsed.payload = BatchPayload::Changes(changes);
    Ok(parsed)
}

/// Parse the `electric-schema` header: an object of column name →
/// `{type, pk_index?, not_null?}`, in column order.
pub fn parse_column_schema(header: &str) -> Result<Vec<ColumnSpec>, TransportError> {
    let columns: Map<String, Value> = serde_json::from_str(header)
        .map_err(|e| TransportError::permanent(format!("invalid schema header: {e}")))?;
    Ok(columns
        .into_iter()
        .map(|(name, spec)| ColumnSpec {
            remote_type: spec
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("text")
                .to_string(),
            pk_index: spec
                .get("pk_index")
                .and_then(Value::as_u64)
                .map(|i| i as u32),
            not_null: spec
                .get("not_null")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            name,
        })
        .collect())
}

/// Parse a schema-version response: a JSON object with a `version`,
/// `schemaVersion` or `hash` field, a JSON string or number, or plain text.
pub fn parse_schema_version(body: &str) -> Result<String, TransportError> {
    let text = body.trim();
    let version = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(obj)) => ["version", "schemaVersion", "hash"]
            .iter()
            .find_map(|key| match obj.get(*key) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| TransportError::permanent("schema version response has no version"))?,
        Ok(Value::String(s)) => s,
        Ok(Value::Number(n)) => n.to_string(),
        _ => text.to_string(),
    };
    if version.trim().is_empty() {
        return Err(TransportError::permanent("schema version is empty"));
    }
    Ok(version)
}
