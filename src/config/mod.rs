//! Engine settings and document watching.
//!
//! # Data Flow
//! ```text
//! settings file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → FleetConfig (validated, immutable)
//!     → handed to Fleet, ConfigStore and Supervisor at construction
//!
//! While the daemon runs:
//!     watcher.rs detects a saved client document
//!     → client id resolved from the path
//!     → daemon hot-reloads that client's process
//! ```
//!
//! # Design Decisions
//! - Settings are immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal settings files
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, load_or_default, ConfigError};
pub use schema::FleetConfig;
pub use watcher::DocumentWatcher;
