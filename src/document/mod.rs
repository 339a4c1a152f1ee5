//! Typed model of one client's configuration document.
//!
//! # Data Flow
//! ```text
//! frpc.toml (text)
//!     → toml::Table (untyped tree)
//!     → ClientDocument::from_table (variant selection on `type`, record checks)
//!     → ClientDocument (typed, validated per record)
//!
//! ClientDocument::render
//!     → TOML text with every unset field omitted
//! ```
//!
//! # Design Decisions
//! - Tunnel and listener variants are closed sum types; every consumer
//!   matches exhaustively
//! - Defaults are applied by accessors, never written back to disk
//! - Keys the model does not know about are dropped on round-trip
//! - Cross-record and cross-document uniqueness is the validator's job

pub mod connection;
pub mod listener;
pub mod table;
pub mod tunnel;

use serde::Serialize;
use thiserror::Error;
use toml::{Table, Value};

pub use connection::{AdminSettings, ConnectionSettings};
pub use listener::{ListenerKind, ListenerRecord, ListenerType, XtcpOptions};
pub use table::{merge, parse_table, table_from_json};
pub use tunnel::{TunnelKind, TunnelRecord, TunnelType};

/// Address used when a local or bind address is not given.
pub const DEFAULT_LOCAL_ADDRESS: &str = "127.0.0.1";

/// Malformed or unrecognised input shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unknown {entity} type `{kind}`, expected one of: {expected}")]
    UnknownKind {
        entity: &'static str,
        kind: String,
        expected: String,
    },

    #[error("{entity} is missing required field `{field}`")]
    MissingField {
        entity: &'static str,
        field: &'static str,
    },

    #[error("invalid {entity}: {message}")]
    Invalid { entity: &'static str, message: String },

    #[error("malformed input: {0}")]
    Malformed(String),
}

/// The persisted configuration tree of one client.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientDocument {
    #[serde(flatten)]
    pub connection: ConnectionSettings,

    #[serde(rename = "proxies", skip_serializing_if = "Vec::is_empty")]
    pub tunnels: Vec<TunnelRecord>,

    #[serde(rename = "visitors", skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<ListenerRecord>,
}

impl ClientDocument {
    pub fn new(connection: ConnectionSettings) -> Self {
        Self {
            connection,
            tunnels: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Parse document text.
    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        Self::from_table(parse_table(text)?)
    }

    /// Build a document from an untyped tree. Fails on the first bad record;
    /// nothing is partially constructed.
    pub fn from_table(mut table: Table) -> Result<Self, SchemaError> {
        let tunnels = take_records(&mut table, "proxies")?
            .into_iter()
            .map(TunnelRecord::from_table)
            .collect::<Result<Vec<_>, _>>()?;
        let listeners = take_records(&mut table, "visitors")?
            .into_iter()
            .map(ListenerRecord::from_table)
            .collect::<Result<Vec<_>, _>>()?;
        let connection = ConnectionSettings::from_table(table)?;

        Ok(Self {
            connection,
            tunnels,
            listeners,
        })
    }

    /// Serialize to TOML text.
    pub fn render(&self) -> Result<String, SchemaError> {
        toml::to_string_pretty(self).map_err(|e| SchemaError::Malformed(e.to_string()))
    }

    pub fn tunnel(&self, name: &str) -> Option<&TunnelRecord> {
        self.tunnels.iter().find(|t| t.name == name)
    }

    pub fn listener(&self, name: &str) -> Option<&ListenerRecord> {
        self.listeners.iter().find(|l| l.name == name)
    }
}

fn take_records(table: &mut Table, key: &'static str) -> Result<Vec<Table>, SchemaError> {
    let Some(value) = table.remove(key) else {
        return Ok(Vec::new());
    };
    let Value::Array(items) = value else {
        return Err(SchemaError::Malformed(format!("`{key}` must be an array of tables")));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Table(t) => Ok(t),
            other => Err(SchemaError::Malformed(format!(
                "`{key}` entries must be tables, got {}",
                other.type_str()
            ))),
        })
        .collect()
}
