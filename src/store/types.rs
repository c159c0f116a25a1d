//! Record types held by the backing store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::{MaskedHints, SealedEnvelope};
use crate::rotation::RotationId;

/// The (location, provider) pair every per-key record hangs off.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CredentialKey {
    pub location: String,
    pub provider: String,
}

impl CredentialKey {
    pub fn new(location: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            provider: provider.into(),
        }
    }
}

impl std::fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.location, self.provider)
    }
}

/// Row identifier of a credential record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRowId(pub Uuid);

impl CredentialRowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CredentialRowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CredentialRowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Pending,
    Connected,
    Invalid,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Connected => "connected",
            Self::Invalid => "invalid",
        }
    }
}

/// One per (location, provider). Never serialized: callers only ever see a
/// [`CredentialView`].
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub id: CredentialRowId,
    pub key: CredentialKey,
    pub ciphertext: SealedEnvelope,
    pub status: CredentialStatus,
    /// Last rotation that successfully wrote this row.
    pub rotation_attempt_id: Option<RotationId>,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub masked_hints: MaskedHints,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CredentialRecord {
    pub fn view(&self) -> CredentialView {
        CredentialView {
            key: self.key.clone(),
            status: self.status,
            last_verified_at: self.last_verified_at,
            expires_at: self.expires_at,
            masked_hints: self.masked_hints.clone(),
        }
    }
}

/// Secret-free projection of a credential record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialView {
    pub key: CredentialKey,
    pub status: CredentialStatus,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub masked_hints: MaskedHints,
}

/// Input to the conditional rotation write.
#[derive(Debug, Clone)]
pub struct ConditionalRotation {
    pub key: CredentialKey,
    pub rotation_id: RotationId,
    pub ciphertext: SealedEnvelope,
    pub expires_at: Option<DateTime<Utc>>,
    pub masked_hints: MaskedHints,
    pub now: DateTime<Utc>,
}

/// What the conditional rotation write did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotateRow {
    /// One row matched and was swapped.
    Updated {
        id: CredentialRowId,
        /// Token fingerprint the row carried before the swap.
        previous_fingerprint: Option<String>,
    },
    /// The row already carries this rotation id.
    Unchanged,
    /// No row exists for the key.
    Missing,
}

/// Input to the connect upsert.
#[derive(Debug, Clone)]
pub struct CredentialUpsert {
    pub key: CredentialKey,
    pub ciphertext: SealedEnvelope,
    pub masked_hints: MaskedHints,
    pub expires_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// Before/after trail for a rotation. Written even for idempotent hits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationAuditEntry {
    pub rotation_id: RotationId,
    pub key: CredentialKey,
    pub result: String,
    pub previous_fingerprint: Option<String>,
    pub token_fingerprint: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Backoff bookkeeping per (location, provider).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub key: CredentialKey,
    pub consecutive_failures: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Error class of the last failure, never a raw provider body.
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub paused_until: Option<DateTime<Utc>>,
}

impl SyncStatus {
    pub fn new(key: CredentialKey) -> Self {
        Self {
            key,
            consecutive_failures: 0,
            last_run_at: None,
            last_success_at: None,
            last_error: None,
            next_attempt_at: None,
            paused_until: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Rotation,
    Sync,
}

/// Audit row for one attempt. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub key: CredentialKey,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ok: bool,
    pub items: u32,
    /// `rotated`, `idempotent` or `failed`.
    pub status: String,
    pub error: Option<String>,
    pub attempt: u32,
    pub rotation_id: Option<RotationId>,
    pub token_fingerprint: Option<String>,
}

/// Scope a breaker row guards: a whole provider, or one location on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BreakerScope {
    pub provider: String,
    pub location: Option<String>,
}

impl BreakerScope {
    pub fn provider(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            location: None,
        }
    }

    pub fn location(provider: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            location: Some(location.into()),
        }
    }
}

impl std::fmt::Display for BreakerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{}@{}", self.provider, location),
            None => f.write_str(&self.provider),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable circuit breaker state for one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerRow {
    pub scope: BreakerScope,
    pub state: BreakerState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    /// Set while the single half-open probe is in flight.
    pub probe_started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BreakerRow {
    pub fn closed(scope: BreakerScope, now: DateTime<Utc>) -> Self {
        Self {
            scope,
            state: BreakerState::Closed,
            failure_count: 0,
            opened_at: None,
            probe_started_at: None,
            updated_at: now,
        }
    }
}

/// Per-location operator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationSettings {
    pub rotation_enabled: bool,
    pub alerts_enabled: bool,
}

impl Default for LocationSettings {
    fn default() -> Self {
        Self {
            rotation_enabled: true,
            alerts_enabled: true,
        }
    }
}
