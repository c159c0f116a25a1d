//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Check key → Build store, providers, orchestrator → Start background
//!     tasks → Bind operator API
//!
//! Shutdown (shutdown.rs):
//!     Signal received → API drains → background loops exit → done
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → graceful shutdown
//! ```

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{run, StartupError};
