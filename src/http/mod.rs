//! Operator HTTP API.
//!
//! # Data Flow
//! ```text
//! request
//!     → TraceLayer → TimeoutLayer
//!     → /health (public)
//!     → /v1/* → auth.rs (bearer API key) → handlers.rs
//!         → Orchestrator (connect, attempt, status, location settings)
//!         → ChaosHarness (start run, run status)
//! ```
//!
//! # Routes
//! - `GET  /health`
//! - `POST /v1/credentials`
//! - `POST /v1/attempts`
//! - `GET  /v1/status`, `GET /v1/status/{location}/{provider}`
//! - `GET|PUT /v1/locations/{location}/settings`
//! - `POST|GET /v1/chaos/runs`, `GET /v1/chaos/runs/{id}`

pub mod auth;
pub mod handlers;
pub mod server;

pub use server::{build_router, ApiServer, AppState};
