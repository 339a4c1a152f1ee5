//! Tunnel (`[[proxies]]`) definitions.
//!
//! A tunnel is one record with common backend/transport options plus a
//! payload that depends on its `type`:
//!
//! ```text
//! tcp, udp           → remotePort
//! http               → customDomains/subDomain + routing and header options
//! https              → customDomains/subDomain
//! tcpmux             → customDomains/subDomain + multiplexer options
//! stcp, sudp, xtcp   → secretKey + allowUsers
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use toml::Table;

use super::table::{decode, discriminator, encode, merge};
use super::{SchemaError, DEFAULT_LOCAL_ADDRESS};

const ENTITY: &str = "tunnel";

/// Discriminator of a [`TunnelRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    Tcp,
    Udp,
    Http,
    Https,
    /// Multiplexed tcp (`tcpmux`).
    Tcpmux,
    /// Secret tcp, point to point through the relay.
    Stcp,
    /// Secret udp.
    Sudp,
    /// Secret tcp with NAT hole punching.
    Xtcp,
}

impl TunnelType {
    pub const ALL: [TunnelType; 8] = [
        TunnelType::Tcp,
        TunnelType::Udp,
        TunnelType::Http,
        TunnelType::Https,
        TunnelType::Tcpmux,
        TunnelType::Stcp,
        TunnelType::Sudp,
        TunnelType::Xtcp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TunnelType::Tcp => "tcp",
            TunnelType::Udp => "udp",
            TunnelType::Http => "http",
            TunnelType::Https => "https",
            TunnelType::Tcpmux => "tcpmux",
            TunnelType::Stcp => "stcp",
            TunnelType::Sudp => "sudp",
            TunnelType::Xtcp => "xtcp",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Kinds that open a port on the relay's shared port space.
    pub fn uses_remote_port(self) -> bool {
        matches!(self, TunnelType::Tcp | TunnelType::Udp)
    }

    /// Kinds whose custom domains must be unique across the fleet.
    pub fn uses_unique_domains(self) -> bool {
        matches!(self, TunnelType::Http | TunnelType::Https)
    }

    pub fn is_secret(self) -> bool {
        matches!(self, TunnelType::Stcp | TunnelType::Sudp | TunnelType::Xtcp)
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tunnel definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelRecord {
    pub name: String,

    /// Local service address (default `127.0.0.1`).
    #[serde(rename = "localIP", default, skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TunnelTransport>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadatas: Option<BTreeMap<String, String>>,

    #[serde(flatten)]
    pub kind: TunnelKind,
}

/// Per-type payload, selected by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TunnelKind {
    Tcp(PortOptions),
    Udp(PortOptions),
    Http(HttpOptions),
    Https(DomainOptions),
    Tcpmux(MuxOptions),
    Stcp(SecretOptions),
    Sudp(SecretOptions),
    Xtcp(SecretOptions),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortOptions {
    /// Port opened on the relay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DomainOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_domains: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_domain: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_domains: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_header_rewrite: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<HeaderOperations>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<HeaderOperations>,
    #[serde(rename = "routeByHTTPUser", skip_serializing_if = "Option::is_none")]
    pub route_by_http_user: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MuxOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_domains: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_password: Option<String>,
    #[serde(rename = "routeByHTTPUser", skip_serializing_if = "Option::is_none")]
    pub route_by_http_user: Option<String>,
    /// Multiplexer protocol, `httpconnect` for the executable's current release.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplexer: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecretOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// Users allowed to connect through a matching listener. `*` allows all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_users: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeaderOperations {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TunnelTransport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_encryption: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_compression: Option<bool>,
    /// e.g. `1MB`, `500KB`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth_limit: Option<String>,
    /// `client` or `server`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth_limit_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_protocol_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancer {
    pub group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    Tcp,
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    #[serde(rename = "type")]
    pub check_type: HealthCheckType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_headers: Option<Vec<HttpHeader>>,
}

impl HealthCheck {
    pub fn timeout_seconds(&self) -> u32 {
        self.timeout_seconds.unwrap_or(3)
    }

    pub fn max_failed(&self) -> u32 {
        self.max_failed.unwrap_or(1)
    }

    pub fn interval_seconds(&self) -> u32 {
        self.interval_seconds.unwrap_or(10)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

impl TunnelRecord {
    /// Build a record from an untyped tree, selecting the variant from `type`.
    pub fn from_table(table: Table) -> Result<Self, SchemaError> {
        let kind = discriminator(ENTITY, &table)?;
        if TunnelType::parse(kind).is_none() {
            return Err(SchemaError::UnknownKind {
                entity: ENTITY,
                kind: kind.to_string(),
                expected: expected_kinds(),
            });
        }
        let record: TunnelRecord = decode(ENTITY, table)?;
        record.validate()?;
        Ok(record)
    }

    /// Untyped form with every unset field omitted.
    pub fn to_table(&self) -> Result<Table, SchemaError> {
        encode(ENTITY, self)
    }

    /// Overlay a partial untyped tree onto a copy of this record.
    ///
    /// The caller is responsible for rejecting a changed `type`; this only
    /// reparses the merged tree.
    pub fn patched(&self, patch: Table) -> Result<Self, SchemaError> {
        let mut merged = self.to_table()?;
        merge(&mut merged, patch);
        Self::from_table(merged)
    }

    pub fn tunnel_type(&self) -> TunnelType {
        match &self.kind {
            TunnelKind::Tcp(_) => TunnelType::Tcp,
            TunnelKind::Udp(_) => TunnelType::Udp,
            TunnelKind::Http(_) => TunnelType::Http,
            TunnelKind::Https(_) => TunnelType::Https,
            TunnelKind::Tcpmux(_) => TunnelType::Tcpmux,
            TunnelKind::Stcp(_) => TunnelType::Stcp,
            TunnelKind::Sudp(_) => TunnelType::Sudp,
            TunnelKind::Xtcp(_) => TunnelType::Xtcp,
        }
    }

    pub fn effective_local_ip(&self) -> &str {
        self.local_ip.as_deref().unwrap_or(DEFAULT_LOCAL_ADDRESS)
    }

    /// Relay port for tcp/udp tunnels.
    pub fn remote_port(&self) -> Option<u16> {
        match &self.kind {
            TunnelKind::Tcp(opts) | TunnelKind::Udp(opts) => opts.remote_port,
            _ => None,
        }
    }

    /// Custom domains of http/https/tcpmux tunnels, empty otherwise.
    pub fn custom_domains(&self) -> &[String] {
        let domains = match &self.kind {
            TunnelKind::Http(opts) => opts.custom_domains.as_deref(),
            TunnelKind::Https(opts) => opts.custom_domains.as_deref(),
            TunnelKind::Tcpmux(opts) => opts.custom_domains.as_deref(),
            _ => None,
        };
        domains.unwrap_or(&[])
    }

    pub fn sub_domain(&self) -> Option<&str> {
        match &self.kind {
            TunnelKind::Http(opts) => opts.sub_domain.as_deref(),
            TunnelKind::Https(opts) => opts.sub_domain.as_deref(),
            TunnelKind::Tcpmux(opts) => opts.sub_domain.as_deref(),
            _ => None,
        }
    }

    pub fn secret(&self) -> Option<&SecretOptions> {
        match &self.kind {
            TunnelKind::Stcp(opts) | TunnelKind::Sudp(opts) | TunnelKind::Xtcp(opts) => Some(opts),
            _ => None,
        }
    }

    /// Record-local checks. Cross-record uniqueness lives in the validator.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.local_port == Some(0) {
            return Err(invalid(format!("{}: localPort must not be 0", self.name)));
        }
        if self.remote_port() == Some(0) {
            return Err(invalid(format!("{}: remotePort must not be 0", self.name)));
        }
        if self.custom_domains().iter().any(|d| d.trim().is_empty()) {
            return Err(invalid(format!("{}: customDomains contains an empty entry", self.name)));
        }
        if let Some(check) = &self.health_check {
            if check.check_type == HealthCheckType::Http && check.path.is_none() {
                return Err(invalid(format!("{}: http health check requires a path", self.name)));
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

fn expected_kinds() -> String {
    TunnelType::ALL
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::table::parse_table;

    fn record(text: &str) -> Result<TunnelRecord, SchemaError> {
        TunnelRecord::from_table(parse_table(text).unwrap())
    }

    #[test]
    fn test_selects_variant_from_type() {
        let tcp = record("name = 'ssh'\ntype = 'tcp'\nlocalPort = 22\nremotePort = 2222").unwrap();
        assert_eq!(tcp.tunnel_type(), TunnelType::Tcp);
        assert_eq!(tcp.remote_port(), Some(2222));
        assert_eq!(tcp.effective_local_ip(), "127.0.0.1");

        let http = record(
            "name = 'web'\ntype = 'http'\nlocalPort = 80\ncustomDomains = ['a.example.com']",
        )
        .unwrap();
        assert_eq!(http.tunnel_type(), TunnelType::Http);
        assert_eq!(http.custom_domains(), ["a.example.com".to_string()]);
        assert_eq!(http.remote_port(), None);

        let xtcp = record("name = 'p2p'\ntype = 'xtcp'\nsecretKey = 'k'\nallowUsers = ['*']").unwrap();
        assert_eq!(xtcp.secret().unwrap().secret_key.as_deref(), Some("k"));
    }

    #[test]
    fn test_rejects_unknown_type() {
        let err = record("name = 'x'\ntype = 'quic'").unwrap_err();
        match err {
            SchemaError::UnknownKind { kind, expected, .. } => {
                assert_eq!(kind, "quic");
                assert!(expected.contains("tcpmux"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_bad_field_types() {
        assert!(matches!(
            record("name = 'x'\ntype = 'tcp'\nremotePort = 'high'"),
            Err(SchemaError::Invalid { .. })
        ));
        assert!(matches!(
            record("name = 'x'\ntype = 'tcp'\nremotePort = 70000"),
            Err(SchemaError::Invalid { .. })
        ));
        assert!(matches!(
            record("name = ''\ntype = 'tcp'"),
            Err(SchemaError::Invalid { .. })
        ));
    }

    #[test]
    fn test_unmodeled_fields_are_dropped() {
        let rec = record("name = 'ssh'\ntype = 'tcp'\nremotePort = 2222\nfavouriteColour = 'blue'").unwrap();
        let table = rec.to_table().unwrap();
        assert!(!table.contains_key("favouriteColour"));
        assert_eq!(table["type"].as_str(), Some("tcp"));
    }

    #[test]
    fn test_unset_fields_are_omitted() {
        let rec = record("name = 'ssh'\ntype = 'tcp'").unwrap();
        let table = rec.to_table().unwrap();
        let mut keys: Vec<_> = table.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["name".to_string(), "type".to_string()]);
    }

    #[test]
    fn test_health_check_defaults() {
        let rec = record(
            "name = 'web'\ntype = 'tcp'\nremotePort = 8000\n[healthCheck]\ntype = 'tcp'",
        )
        .unwrap();
        let check = rec.health_check.as_ref().unwrap();
        assert_eq!(check.interval_seconds(), 10);
        assert_eq!(check.timeout_seconds(), 3);
        assert_eq!(check.max_failed(), 1);
        assert!(!rec.to_table().unwrap()["healthCheck"]
            .as_table()
            .unwrap()
            .contains_key("intervalSeconds"));

        assert!(record("name = 'web'\ntype = 'tcp'\n[healthCheck]\ntype = 'http'").is_err());
    }

    #[test]
    fn test_patched_keeps_unspecified_fields() {
        let rec = record("name = 'ssh'\ntype = 'tcp'\nlocalPort = 22\nremotePort = 2222").unwrap();
        let updated = rec.patched(parse_table("remotePort = 2223").unwrap()).unwrap();
        assert_eq!(updated.local_port, Some(22));
        assert_eq!(updated.remote_port(), Some(2223));
    }
}
