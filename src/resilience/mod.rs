//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Attempt for (location, provider):
//!     → circuit_breaker.rs (may the call happen at all?)
//!     → backoff.rs gate (is the key in backoff or paused?)
//!     → timeouts.rs (deadline around every provider and store call)
//!     → On failure: retries.rs (classify, resolve Retry-After)
//!     → backoff.rs apply_outcome + circuit_breaker.rs record_*
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Breaker and backoff are independent counters with independent skips
//! - State transitions are pure functions; the store applies them atomically

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;
pub mod timeouts;

pub use backoff::{BackoffPolicy, Gate, SyncOutcome};
pub use circuit_breaker::{BreakerDecision, BreakerPolicy, CircuitBreaker};
pub use retries::ErrorClass;
