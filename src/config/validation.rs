//! Engine settings validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, poll intervals below their timeout)
//! - Validate file names used to build per-client paths
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: FleetConfig → Result<(), Vec<ValidationError>>
//! - Runs before settings are accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::FleetConfig;

/// A single semantic problem in the engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending key.
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &FleetConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.paths.data_dir.as_os_str().is_empty() {
        errors.push(ValidationError::new("paths.data_dir", "must not be empty"));
    }
    check_file_name(&mut errors, "paths.document_name", &config.paths.document_name);
    check_file_name(&mut errors, "paths.executable_name", &config.paths.executable_name);
    if config.paths.document_name == config.paths.executable_name {
        errors.push(ValidationError::new(
            "paths.executable_name",
            "must differ from paths.document_name",
        ));
    }

    check_interval(
        &mut errors,
        "store.lock_poll_interval_ms",
        config.store.lock_poll_interval_ms,
        config.store.lock_timeout_ms,
    );
    if config.store.lock_timeout_ms == 0 {
        errors.push(ValidationError::new("store.lock_timeout_ms", "must be greater than 0"));
    }

    check_interval(
        &mut errors,
        "supervisor.stop_poll_interval_ms",
        config.supervisor.stop_poll_interval_ms,
        config.supervisor.stop_timeout_ms,
    );
    if config.supervisor.stop_timeout_ms == 0 {
        errors.push(ValidationError::new("supervisor.stop_timeout_ms", "must be greater than 0"));
    }
    if config.supervisor.config_flag.trim().is_empty() {
        errors.push(ValidationError::new("supervisor.config_flag", "must not be empty"));
    }

    if config.admin.request_timeout_ms == 0 {
        errors.push(ValidationError::new("admin.request_timeout_ms", "must be greater than 0"));
    }
    for (field, path) in [
        ("admin.reload_path", &config.admin.reload_path),
        ("admin.status_path", &config.admin.status_path),
    ] {
        if !path.starts_with('/') {
            errors.push(ValidationError::new(field, format!("`{path}` must start with `/`")));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("`{}` is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_file_name(errors: &mut Vec<ValidationError>, field: &'static str, name: &str) {
    if name.trim().is_empty() {
        errors.push(ValidationError::new(field, "must not be empty"));
    } else if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        errors.push(ValidationError::new(field, format!("`{name}` must be a plain file name")));
    }
}

fn check_interval(errors: &mut Vec<ValidationError>, field: &'static str, interval: u64, timeout: u64) {
    if interval == 0 {
        errors.push(ValidationError::new(field, "must be greater than 0"));
    } else if interval >= timeout {
        errors.push(ValidationError::new(field, "must be smaller than its timeout"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate_config(&FleetConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = FleetConfig::default();
        config.paths.document_name = "../frpc.toml".into();
        config.store.lock_timeout_ms = 0;
        config.supervisor.stop_poll_interval_ms = 5_000;
        config.admin.reload_path = "api/reload".into();
        config.observability.metrics_enabled = true;
        config.observability.metrics_address = "nowhere".into();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert!(fields.contains(&"paths.document_name"));
        assert!(fields.contains(&"store.lock_timeout_ms"));
        assert!(fields.contains(&"supervisor.stop_poll_interval_ms"));
        assert!(fields.contains(&"admin.reload_path"));
        assert!(fields.contains(&"observability.metrics_address"));
    }

    #[test]
    fn test_same_document_and_executable_name() {
        let mut config = FleetConfig::default();
        config.paths.executable_name = config.paths.document_name.clone();
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "paths.executable_name");
    }
}
