//! POS credential rotation and resilience service.
//!
//! Rotates third-party point-of-sale credentials for many tenant locations,
//! guards every provider call behind a circuit breaker and a backoff
//! schedule, and ships a chaos harness that checks those guarantees against
//! a fault-injecting provider simulator.

// Core
pub mod clock;
pub mod config;
pub mod envelope;
pub mod rotation;
pub mod store;

// Attempt pipeline
pub mod orchestrator;
pub mod provider;
pub mod resilience;

// Operator surfaces
pub mod alerts;
pub mod chaos;
pub mod http;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::RotatorConfig;
pub use lifecycle::Shutdown;
pub use orchestrator::Orchestrator;
