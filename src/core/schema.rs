//! Schema-version reconciliation.
//!
//! `init` moves the core through `Unknown → Checking → {Matched, Reset} →
//! Ready`. The decision itself is a pure function of the persisted version
//! and the fetch outcome so it can be tested without a database.

use crate::error::{Error, Result};
use crate::transport::TransportError;
use crate::types::InitOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaPhase {
    Unknown,
    Checking,
    Matched,
    Reset,
    Ready,
}

impl SchemaPhase {
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }
}

/// What `init` must do to the local database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionDecision {
    /// Nothing persisted. The database is wiped silently and `version`
    /// persisted.
    FirstRun { version: String },
    Matched { version: String },
    /// Destructive reset, announced with `SCHEMA_RESET`.
    Mismatch { old: String, new: String },
    /// The server could not be reached; keep running on the persisted
    /// version.
    Offline { version: String, error: TransportError },
}

impl VersionDecision {
    /// The version the core is ready with after applying this decision.
    pub fn version(&self) -> &str {
        match self {
            Self::FirstRun { version } | Self::Matched { version } => version,
            Self::Mismatch { new, .. } => new,
            Self::Offline { version, .. } => version,
        }
    }

    pub fn outcome(&self) -> InitOutcome {
        match self {
            Self::FirstRun { .. } => InitOutcome::FirstRun,
            Self::Matched { .. } | Self::Offline { .. } => InitOutcome::Matched,
            Self::Mismatch { .. } => InitOutcome::Reset,
        }
    }

    /// Phase reached before `Ready`.
    pub fn phase(&self) -> SchemaPhase {
        match self {
            Self::Mismatch { .. } => SchemaPhase::Reset,
            _ => SchemaPhase::Matched,
        }
    }
}

pub fn decide(
    persisted: Option<String>,
    fetched: std::result::Result<String, TransportError>,
) -> Result<VersionDecision> {
    match (persisted, fetched) {
        (None, Ok(version)) => Ok(VersionDecision::FirstRun { version }),
        (Some(old), Ok(new)) if old == new => Ok(VersionDecision::Matched { version: new }),
        (Some(old), Ok(new)) => Ok(VersionDecision::Mismatch { old, new }),
        (Some(version), Err(error)) => Ok(VersionDecision::Offline { version, error }),
        (None, Err(error)) => Err(Error::Transport(error)),
    }
}
