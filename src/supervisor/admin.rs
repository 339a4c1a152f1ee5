//! Client for the supervised process's local admin endpoint.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::schema::AdminEndpointConfig;
use crate::document::AdminSettings;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("admin endpoint unreachable: {0}")]
    Request(#[from] reqwest::Error),

    #[error("admin endpoint returned HTTP {0}")]
    Status(u16),
}

/// Where and how to reach one client's admin endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl AdminTarget {
    /// `None` unless a port and both credential halves are configured.
    pub fn from_settings(settings: &AdminSettings) -> Option<Self> {
        let port = settings.port?;
        let (user, password) = settings.credentials()?;
        Some(Self {
            host: connect_host(settings.effective_bind_addr()),
            port,
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }
}

/// A wildcard bind address is reached through loopback.
fn connect_host(bind_addr: &str) -> String {
    match bind_addr {
        "" | "0.0.0.0" => "127.0.0.1".to_string(),
        "::" | "[::]" => "[::1]".to_string(),
        addr if addr.contains(':') && !addr.starts_with('[') => format!("[{addr}]"),
        addr => addr.to_string(),
    }
}

/// Run state of one tunnel as reported by its process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelRunState {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub err: String,
    pub local_addr: String,
    pub plugin: String,
    pub remote_addr: String,
}

/// Per-kind lists of tunnel run states.
pub type RunStates = HashMap<String, Vec<TunnelRunState>>;

#[derive(Debug, Clone)]
pub struct AdminClient {
    http: reqwest::Client,
    timeout: Duration,
    reload_path: String,
    status_path: String,
}

impl AdminClient {
    pub fn new(config: &AdminEndpointConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout: config.request_timeout(),
            reload_path: config.reload_path.clone(),
            status_path: config.status_path.clone(),
        }
    }

    /// Ask the process to re-read its document.
    pub async fn reload(&self, target: &AdminTarget) -> Result<(), AdminError> {
        self.get(target, &self.reload_path).await?;
        Ok(())
    }

    pub async fn status(&self, target: &AdminTarget) -> Result<RunStates, AdminError> {
        let response = self.get(target, &self.status_path).await?;
        Ok(response.json::<RunStates>().await?)
    }

    async fn get(&self, target: &AdminTarget, path: &str) -> Result<reqwest::Response, AdminError> {
        let response = self
            .http
            .get(target.url(path))
            .basic_auth(&target.user, Some(&target.password))
            .timeout(self.timeout)
            .send()
            .await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(AdminError::Status(response.status().as_u16()));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_requires_port_and_credentials() {
        let mut settings = AdminSettings {
            port: Some(7400),
            user: Some("admin".into()),
            ..AdminSettings::default()
        };
        assert!(AdminTarget::from_settings(&settings).is_none());

        settings.password = Some("pw".into());
        let target = AdminTarget::from_settings(&settings).unwrap();
        assert_eq!(target.url("/api/reload"), "http://127.0.0.1:7400/api/reload");
    }

    #[test]
    fn test_wildcard_bind_connects_via_loopback() {
        assert_eq!(connect_host("0.0.0.0"), "127.0.0.1");
        assert_eq!(connect_host("::"), "[::1]");
        assert_eq!(connect_host("fe80::1"), "[fe80::1]");
        assert_eq!(connect_host("10.0.0.2"), "10.0.0.2");
    }

    #[test]
    fn test_run_state_parses_admin_body() {
        let body = r#"{"tcp":[{"name":"ssh","type":"tcp","status":"running","err":"","local_addr":"127.0.0.1:22","plugin":"","remote_addr":"relay:2222"}],"http":[]}"#;
        let states: RunStates = serde_json::from_str(body).unwrap();
        assert_eq!(states["tcp"][0].status, "running");
        assert_eq!(states["tcp"][0].kind, "tcp");
        assert!(states["http"].is_empty());
    }
}
