//! Connection settings: the top-level keys of a client document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use toml::Table;

use super::table::{decode, encode, merge};
use super::{SchemaError, DEFAULT_LOCAL_ADDRESS};

const ENTITY: &str = "connection";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nat_hole_stun_server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_fail_exit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp_packet_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogSettings>,
    /// Local admin UI of the supervised process.
    #[serde(rename = "webServer", skip_serializing_if = "Option::is_none")]
    pub admin: Option<AdminSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<ClientTransport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadatas: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub includes: Option<Vec<String>>,
    /// Restrict which tunnels the process starts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// `token` or `oidc`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_scopes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oidc: Option<OidcSettings>,
}

impl AuthSettings {
    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or("token")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OidcSettings {
    #[serde(rename = "clientID", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(rename = "tokenEndpointURL", skip_serializing_if = "Option::is_none")]
    pub token_endpoint_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_endpoint_params: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_print_color: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdminSettings {
    #[serde(rename = "addr", skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assets_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pprof_enable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsFiles>,
}

impl AdminSettings {
    pub fn effective_bind_addr(&self) -> &str {
        self.bind_addr.as_deref().unwrap_or(DEFAULT_LOCAL_ADDRESS)
    }

    /// Basic-auth credentials, present only when both halves are set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.user.as_deref(), self.password.as_deref()) {
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                Some((user, password))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsFiles {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trusted_ca_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientTransport {
    /// `tcp`, `kcp`, `quic`, `websocket` or `wss`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dial_server_timeout: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dial_server_keepalive: Option<i64>,
    #[serde(rename = "connectServerLocalIP", skip_serializing_if = "Option::is_none")]
    pub connect_server_local_ip: Option<String>,
    #[serde(rename = "proxyURL", skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_mux: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_mux_keepalive_interval: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<ClientTls>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quic: Option<QuicOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientTls {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trusted_ca_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(rename = "disableCustomTLSFirstByte", skip_serializing_if = "Option::is_none")]
    pub disable_custom_tls_first_byte: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuicOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepalive_period: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_idle_timeout: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_incoming_streams: Option<u32>,
}

impl ConnectionSettings {
    /// Build settings from an untyped tree. `proxies`/`visitors` keys are
    /// ignored here; they belong to the document.
    pub fn from_table(mut table: Table) -> Result<Self, SchemaError> {
        table.remove("proxies");
        table.remove("visitors");
        let settings: ConnectionSettings = decode(ENTITY, table)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_table(&self) -> Result<Table, SchemaError> {
        encode(ENTITY, self)
    }

    pub fn patched(&self, patch: Table) -> Result<Self, SchemaError> {
        let mut merged = self.to_table()?;
        merge(&mut merged, patch);
        Self::from_table(merged)
    }

    /// Admin UI port, when an admin UI is configured.
    pub fn admin_port(&self) -> Option<u16> {
        self.admin.as_ref().and_then(|a| a.port)
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.server_port == Some(0) {
            return Err(invalid("serverPort must not be 0"));
        }
        if self.admin_port() == Some(0) {
            return Err(invalid("webServer.port must not be 0"));
        }
        if let Some(auth) = &self.auth {
            match auth.method() {
                "token" | "oidc" => {}
                other => return Err(invalid(format!("unsupported auth method `{other}`"))),
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
