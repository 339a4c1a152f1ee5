//! Listener (`[[visitors]]`) definitions.
//!
//! A listener binds a local socket and connects outward to a peer's secret
//! tunnel of the same kind.

use std::fmt;

use serde::{Deserialize, Serialize};
use toml::Table;

use super::table::{decode, discriminator, encode, merge};
use super::{SchemaError, DEFAULT_LOCAL_ADDRESS};

const ENTITY: &str = "listener";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerType {
    Stcp,
    Sudp,
    Xtcp,
}

impl ListenerType {
    pub const ALL: [ListenerType; 3] = [ListenerType::Stcp, ListenerType::Sudp, ListenerType::Xtcp];

    pub fn as_str(self) -> &'static str {
        match self {
            ListenerType::Stcp => "stcp",
            ListenerType::Sudp => "sudp",
            ListenerType::Xtcp => "xtcp",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for ListenerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerRecord {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<ListenerTransport>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,

    /// Owner of the remote tunnel; defaults to this client's user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_user: Option<String>,

    /// Name of the remote tunnel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<String>,

    /// A value of zero or below means the listener opens no local socket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_port: Option<i32>,

    #[serde(flatten)]
    pub kind: ListenerKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ListenerKind {
    Stcp,
    Sudp,
    Xtcp(XtcpOptions),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenerTransport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_encryption: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_compression: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XtcpProtocol {
    Quic,
    Kcp,
}

/// Hole-punching parameters of an xtcp listener.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct XtcpOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<XtcpProtocol>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_tunnel_open: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries_an_hour: Option<u32>,
    /// Seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_retry_interval: Option<u32>,
    /// Name of a stcp listener used when hole punching fails.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_timeout_ms: Option<u32>,
}

impl XtcpOptions {
    pub fn protocol(&self) -> XtcpProtocol {
        self.protocol.unwrap_or(XtcpProtocol::Quic)
    }

    pub fn max_retries_an_hour(&self) -> u32 {
        self.max_retries_an_hour.unwrap_or(8)
    }

    pub fn min_retry_interval(&self) -> u32 {
        self.min_retry_interval.unwrap_or(90)
    }
}

impl ListenerRecord {
    /// Build a record from an untyped tree, selecting the variant from `type`.
    pub fn from_table(table: Table) -> Result<Self, SchemaError> {
        let kind = discriminator(ENTITY, &table)?;
        if ListenerType::parse(kind).is_none() {
            return Err(SchemaError::UnknownKind {
                entity: ENTITY,
                kind: kind.to_string(),
                expected: "stcp, sudp, xtcp".to_string(),
            });
        }
        let record: ListenerRecord = decode(ENTITY, table)?;
        record.validate()?;
        Ok(record)
    }

    pub fn to_table(&self) -> Result<Table, SchemaError> {
        encode(ENTITY, self)
    }

    /// Overlay a partial untyped tree onto a copy of this record.
    pub fn patched(&self, patch: Table) -> Result<Self, SchemaError> {
        let mut merged = self.to_table()?;
        merge(&mut merged, patch);
        Self::from_table(merged)
    }

    pub fn listener_type(&self) -> ListenerType {
        match &self.kind {
            ListenerKind::Stcp => ListenerType::Stcp,
            ListenerKind::Sudp => ListenerType::Sudp,
            ListenerKind::Xtcp(_) => ListenerType::Xtcp,
        }
    }

    pub fn effective_bind_addr(&self) -> &str {
        self.bind_addr.as_deref().unwrap_or(DEFAULT_LOCAL_ADDRESS)
    }

    /// The local socket this listener occupies, if any.
    pub fn local_socket(&self) -> Option<(&str, u16)> {
        let port = self.bind_port.filter(|p| *p > 0)?;
        let port = u16::try_from(port).ok()?;
        Some((self.effective_bind_addr(), port))
    }

    pub fn xtcp(&self) -> Option<&XtcpOptions> {
        match &self.kind {
            ListenerKind::Xtcp(opts) => Some(opts),
            ListenerKind::Stcp | ListenerKind::Sudp => None,
        }
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if let Some(port) = self.bind_port {
            if port > i32::from(u16::MAX) {
                return Err(invalid(format!("{}: bindPort {} is out of range", self.name, port)));
            }
        }
        if let Some(fallback) = self.xtcp().and_then(|x| x.fallback_to.as_deref()) {
            if fallback == self.name {
                return Err(invalid(format!("{}: fallbackTo must name another listener", self.name)));
            }
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> SchemaError {
    SchemaError::Invalid {
        entity: ENTITY,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::table::parse_table;

    fn record(text: &str) -> Result<ListenerRecord, SchemaError> {
        ListenerRecord::from_table(parse_table(text).unwrap())
    }

    #[test]
    fn test_xtcp_defaults() {
        let rec = record("name = 'v'\ntype = 'xtcp'\nserverName = 'p2p'\nbindPort = 6000").unwrap();
        let xtcp = rec.xtcp().unwrap();
        assert_eq!(xtcp.protocol(), XtcpProtocol::Quic);
        assert_eq!(xtcp.max_retries_an_hour(), 8);
        assert_eq!(xtcp.min_retry_interval(), 90);
        assert_eq!(rec.local_socket(), Some(("127.0.0.1", 6000)));

        let table = rec.to_table().unwrap();
        assert!(!table.contains_key("maxRetriesAnHour"));
        assert!(!table.contains_key("protocol"));
    }

    #[test]
    fn test_unit_variants_parse_with_common_fields() {
        let rec = record(
            "name = 'db'\ntype = 'stcp'\nsecretKey = 's'\nserverName = 'db-remote'\nbindAddr = '0.0.0.0'\nbindPort = 5432",
        )
        .unwrap();
        assert_eq!(rec.listener_type(), ListenerType::Stcp);
        assert_eq!(rec.local_socket(), Some(("0.0.0.0", 5432)));
        assert!(rec.xtcp().is_none());
    }

    #[test]
    fn test_non_positive_bind_port_has_no_socket() {
        let rec = record("name = 'v'\ntype = 'xtcp'\nbindPort = -1").unwrap();
        assert_eq!(rec.local_socket(), None);
    }

    #[test]
    fn test_rejects_tunnel_only_kind() {
        assert!(matches!(
            record("name = 'v'\ntype = 'tcp'"),
            Err(SchemaError::UnknownKind { .. })
        ));
        assert!(matches!(
            record("name = 'v'\ntype = 'stcp'\nbindPort = 70000"),
            Err(SchemaError::Invalid { .. })
        ));
    }
}
