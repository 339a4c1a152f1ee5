//! Lifecycle management for the daemon.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     Load settings → Validate → Build Fleet → Autostart clients → Watch documents
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop watching → Stop every client process → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Client processes are stopped before the daemon exits; `kill_on_drop`
//!   covers an abrupt exit

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
