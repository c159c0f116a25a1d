//! Backing store subsystem.
//!
//! # Data Flow
//! ```text
//! RotationEngine ──▶ rotate_conditional   (single conditional write)
//! Orchestrator   ──▶ apply_sync_outcome   (per-key atomic fold)
//! CircuitBreaker ──▶ apply_breaker_event  (per-scope atomic fold)
//! Orchestrator   ──▶ append_run           (append-only)
//!        every mutation ──▶ events.rs ──▶ subscribers (settings cache, ...)
//! ```
//!
//! # Design Decisions
//! - The trait exposes folds, not getters + setters: callers hand the store a
//!   pure transition function's inputs and the store applies it while holding
//!   the row, so there is no read-modify-write window
//! - Credential rows are never deleted; they are marked `invalid`
//! - A relational backend implements the rotation as one statement:
//!
//! ```sql
//! UPDATE credentials
//!    SET ciphertext = $new, rotation_attempt_id = $rotation_id,
//!        masked_hints = $hints, expires_at = $expires_at,
//!        status = 'connected', last_verified_at = $now, updated_at = $now
//!  WHERE location = $location AND provider = $provider
//!    AND (rotation_attempt_id IS NULL OR rotation_attempt_id <> $rotation_id)
//! RETURNING id;
//! ```
//!
//! Zero rows returned is `Unchanged` when the key exists and `Missing` when
//! it does not.

pub mod events;
pub mod memory;
pub mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::resilience::backoff::{BackoffPolicy, SyncOutcome};
use crate::resilience::circuit_breaker::{BreakerEvent, BreakerPolicy, BreakerTransition};

pub use events::{debounce, DebounceHandle, StoreEvent, StoreEvents, Subscription};
pub use memory::InMemoryStore;
pub use types::*;

/// Infrastructure failures. Any of these aborts an attempt.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation '{0}' timed out")]
    Timeout(&'static str),

    #[error("no credential record for {0}")]
    NotFound(CredentialKey),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Create the record for a key, or re-supply secrets for an existing one.
    /// Either way the row ends up `pending` with no rotation marker.
    async fn upsert_credential(&self, upsert: CredentialUpsert) -> StoreResult<CredentialRowId>;

    async fn load_credential(&self, key: &CredentialKey) -> StoreResult<Option<CredentialRecord>>;

    async fn list_credentials(&self) -> StoreResult<Vec<CredentialRecord>>;

    /// The idempotent swap. See the module docs for the SQL form.
    async fn rotate_conditional(&self, rotation: ConditionalRotation) -> StoreResult<RotateRow>;

    /// Returns `false` when the key has no record.
    async fn set_credential_status(
        &self,
        key: &CredentialKey,
        status: CredentialStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn append_rotation_audit(&self, entry: RotationAuditEntry) -> StoreResult<()>;

    async fn rotation_audit(&self, key: &CredentialKey) -> StoreResult<Vec<RotationAuditEntry>>;

    async fn load_sync_status(&self, key: &CredentialKey) -> StoreResult<Option<SyncStatus>>;

    /// Fold an attempt outcome into the key's sync status and return the new row.
    async fn apply_sync_outcome(
        &self,
        key: &CredentialKey,
        outcome: &SyncOutcome,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<SyncStatus>;

    async fn list_sync_statuses(&self) -> StoreResult<Vec<SyncStatus>>;

    /// Apply one breaker event. Missing rows start `closed`.
    async fn apply_breaker_event(
        &self,
        scope: &BreakerScope,
        event: BreakerEvent,
        policy: &BreakerPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<BreakerTransition>;

    async fn load_breaker(&self, scope: &BreakerScope) -> StoreResult<Option<BreakerRow>>;

    async fn list_breakers(&self) -> StoreResult<Vec<BreakerRow>>;

    async fn append_run(&self, run: RunRecord) -> StoreResult<()>;

    /// Runs for a key in insertion order.
    async fn runs_for(&self, key: &CredentialKey) -> StoreResult<Vec<RunRecord>>;

    async fn last_successful_run(&self, key: &CredentialKey) -> StoreResult<Option<RunRecord>>;

    async fn load_location_settings(&self, location: &str) -> StoreResult<Option<LocationSettings>>;

    async fn save_location_settings(
        &self,
        location: &str,
        settings: LocationSettings,
    ) -> StoreResult<()>;

    /// Change feed. Dropping or unsubscribing ends delivery.
    fn subscribe(&self) -> Subscription;
}
