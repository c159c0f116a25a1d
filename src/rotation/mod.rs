//! Atomic rotation subsystem.
//!
//! # Data Flow
//! ```text
//! connect(key, secrets)
//!     → envelope seal → store.upsert_credential → status=pending
//!
//! rotate(key, rotation_id, ciphertext)
//!     → store.rotate_conditional (one conditional write)
//!         Updated   → rotated
//!         Unchanged → idempotent
//!         Missing   → StoreError::NotFound
//!     → store.append_rotation_audit (always)
//! ```
//!
//! # Design Decisions
//! - The rotation id is the idempotency key; the store is the only arbiter
//!   of which caller performed the swap
//! - Audit rows carry fingerprints, never tokens

pub mod engine;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use engine::{
    ConnectRequest, RotationEngine, RotationError, RotationReceipt, RotationRequest,
    RotationResult,
};

/// Idempotency key for one logical rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RotationId(pub Uuid);

impl RotationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RotationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RotationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for RotationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}
