//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → RotatorConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → atomic swap of Arc<RotatorConfig>
//!     → subsystems observe new config
//!
//! Per-location settings (store-backed):
//!     cache.rs (TTL, refresh-on-miss) ← store change events (debounced)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - The settings cache is safe to drop at any time; breaker and backoff
//!   state never go through it

pub mod cache;
pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use cache::SettingsCache;
pub use loader::{load_config, ConfigError, ConfigResult};
pub use schema::*;
pub use validation::ValidationError;
