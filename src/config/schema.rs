//! Engine settings.
//!
//! These are the settings of the fleet engine itself, not of the supervised
//! clients; client documents are modelled in [`crate::document`].
//! All types derive Serde traits for deserialization from a TOML file.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root settings for the fleet engine.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct FleetConfig {
    /// Where client directories, documents and executables live.
    pub paths: PathsConfig,

    /// Document lock behaviour.
    pub store: StoreConfig,

    /// Child process supervision.
    pub supervisor: SupervisorConfig,

    /// Calls to the supervised processes' admin endpoints.
    pub admin: AdminEndpointConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Canonical on-disk layout: `<data_dir>/<client id>/<document_name>`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding one sub-directory per client.
    pub data_dir: PathBuf,

    /// File name of a client's document.
    pub document_name: String,

    /// File name of a client's executable.
    pub executable_name: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/cmd"),
            document_name: "frpc.toml".to_string(),
            executable_name: "frpc".to_string(),
        }
    }
}

/// Document store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum wait for a document lock in milliseconds.
    pub lock_timeout_ms: u64,

    /// Delay between lock attempts in milliseconds.
    pub lock_poll_interval_ms: u64,
}

impl StoreConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 10_000,
            lock_poll_interval_ms: 50,
        }
    }
}

/// Process supervision configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Flag placed before the document path on the command line.
    pub config_flag: String,

    /// Graceful termination window before a forced kill, in milliseconds.
    pub stop_timeout_ms: u64,

    /// Liveness poll interval while stopping, in milliseconds.
    pub stop_poll_interval_ms: u64,

    /// Start every client that has an executable and a document when the
    /// daemon boots.
    pub autostart: bool,
}

impl SupervisorConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            config_flag: "-c".to_string(),
            stop_timeout_ms: 3_000,
            stop_poll_interval_ms: 100,
            autostart: true,
        }
    }
}

/// Admin endpoint client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminEndpointConfig {
    /// Request timeout in milliseconds.
    pub request_timeout_ms: u64,

    /// Path triggering a configuration reload.
    pub reload_path: String,

    /// Path returning per-tunnel run state.
    pub status_path: String,
}

impl AdminEndpointConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for AdminEndpointConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            reload_path: "/api/reload".to_string(),
            status_path: "/api/status".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,

    /// Hot-reload running clients when their document changes on disk.
    pub watch_documents: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9091".to_string(),
            watch_documents: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: FleetConfig = toml::from_str("").unwrap();
        assert_eq!(config.paths.document_name, "frpc.toml");
        assert_eq!(config.store.lock_timeout(), Duration::from_secs(10));
        assert_eq!(config.supervisor.stop_timeout(), Duration::from_secs(3));
        assert_eq!(config.admin.reload_path, "/api/reload");
    }

    #[test]
    fn test_partial_section() {
        let config: FleetConfig = toml::from_str(
            r#"
            [supervisor]
            stop_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.supervisor.stop_timeout_ms, 500);
        assert_eq!(config.supervisor.config_flag, "-c");
    }
}
