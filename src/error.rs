//! Error taxonomy shared by every component.
//!
//! Callers that need to map failures onto user-visible codes should match on
//! [`FleetError::kind`] rather than on individual variants.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::document::SchemaError;

/// Coarse error classes surfaced to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Schema,
    LockTimeout,
    Io,
    Process,
    PreconditionFailed,
}

/// The entry that already holds a contested name, port, address or domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub client_id: String,
    /// Owning tunnel/listener name. `None` when the client itself owns the
    /// value (admin UI port).
    pub record: Option<String>,
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.record {
            Some(record) => write!(f, "`{}` of client {}", record, self.client_id),
            None => write!(f, "client {}", self.client_id),
        }
    }
}

/// A uniqueness violation detected by the fleet validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// On-disk field name (`remotePort`, `customDomains`, ...).
    pub field: &'static str,
    /// The contested value, rendered for humans.
    pub value: String,
    pub owner: Owner,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} is already used by {}", self.field, self.value, self.owner)
    }
}

/// Errors produced by the configuration and supervision engine.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Missing client, document, record or executable.
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness collision with an existing entry.
    #[error("conflict: {0}")]
    Conflict(Conflict),

    /// Attempt to change the immutable `type` of a record.
    #[error("conflict: {record} is a `{stored}` entry and cannot become `{requested}`")]
    KindChange {
        record: String,
        stored: String,
        requested: String,
    },

    /// A document is being created where one already exists.
    #[error("conflict: {0}")]
    AlreadyExists(String),

    /// Malformed or unrecognised input shape.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The document lock was not acquired within the configured bound.
    #[error("timed out after {elapsed_ms}ms waiting for lock {}", path.display())]
    LockTimeout { path: PathBuf, elapsed_ms: u64 },

    /// File system failure.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A document exists but cannot be parsed.
    #[error("cannot parse {}: {message}", path.display())]
    Corrupt { path: PathBuf, message: String },

    /// Spawn or termination failure of a supervised process.
    #[error("process error for client {client_id}: {message}")]
    Process { client_id: String, message: String },

    /// Reload against a non-running or mis-configured client.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
}

impl FleetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::NotFound(_) => ErrorKind::NotFound,
            FleetError::Conflict(_) | FleetError::KindChange { .. } | FleetError::AlreadyExists(_) => {
                ErrorKind::Conflict
            }
            FleetError::Schema(_) => ErrorKind::Schema,
            FleetError::LockTimeout { .. } => ErrorKind::LockTimeout,
            FleetError::Io { .. } | FleetError::Corrupt { .. } => ErrorKind::Io,
            FleetError::Process { .. } => ErrorKind::Process,
            FleetError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FleetError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn process(client_id: &str, message: impl Into<String>) -> Self {
        FleetError::Process {
            client_id: client_id.to_string(),
            message: message.into(),
        }
    }
}

/// Result type for engine operations.
pub type FleetResult<T> = Result<T, FleetError>;
