//! Configuration lifecycle and process supervision for a fleet of tunnel
//! clients.
//!
//! Each client owns one TOML document (connection settings, tunnels,
//! listeners) and at most one supervised executable. [`Fleet`] is the entry
//! point: it validates mutations against every document in the fleet,
//! persists them under a cross-process lock, and drives the processes.

pub mod config;
pub mod document;
pub mod error;
pub mod fleet;
pub mod lifecycle;
pub mod observability;
pub mod registry;
pub mod store;
pub mod supervisor;
pub mod validator;

pub use config::FleetConfig;
pub use document::ClientDocument;
pub use error::{ErrorKind, FleetError, FleetResult};
pub use fleet::Fleet;
pub use lifecycle::Shutdown;
pub use supervisor::Supervisor;
