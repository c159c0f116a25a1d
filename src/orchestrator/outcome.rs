//! Attempt results and counters.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::resilience::ErrorClass;
use crate::rotation::RotationId;
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Rotated,
    Idempotent,
    Skipped,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rotated => "rotated",
            Self::Idempotent => "idempotent",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

/// Deliberate non-attempts. None of these touch breaker or backoff state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    CircuitOpen,
    Backoff,
    Paused,
    NotConnected,
    CredentialsInvalid,
    Disabled,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_open",
            Self::Backoff => "backoff",
            Self::Paused => "paused",
            Self::NotConnected => "not_connected",
            Self::CredentialsInvalid => "credentials_invalid",
            Self::Disabled => "disabled",
        }
    }
}

/// Failure reason for an undecryptable credential.
pub const INVALID_CREDENTIALS: &str = "invalid_credentials";

/// `{status, reason?}` plus the bookkeeping an operator wants to see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptOutcome {
    pub status: AttemptStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_id: Option<RotationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(skip)]
    pub skip: Option<SkipReason>,
}

impl AttemptOutcome {
    pub fn skipped(reason: SkipReason, until: Option<DateTime<Utc>>) -> Self {
        Self {
            status: AttemptStatus::Skipped,
            reason: Some(reason.as_str().to_string()),
            rotation_id: None,
            error_class: None,
            next_attempt_at: until,
            run_id: None,
            skip: Some(reason),
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        self.skip
    }

    /// Metric label for the reason; `none` when absent.
    pub fn reason_label(&self) -> &'static str {
        if let Some(skip) = self.skip {
            return skip.as_str();
        }
        self.error_class.map(|c| c.as_str()).unwrap_or("none")
    }
}

/// Only infrastructure failures escape an attempt.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("encryption key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
}

pub type AttemptResult<T> = Result<T, AttemptError>;

/// Process-wide attempt counters.
#[derive(Debug, Default)]
pub struct AttemptTally {
    rotated: AtomicU64,
    idempotent_hits: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TallySnapshot {
    pub rotated: u64,
    pub idempotent_hits: u64,
    pub failed: u64,
    pub skipped: u64,
    /// `rotated / (rotated + failed)`; idempotent hits are not new work.
    pub success_rate: Option<f64>,
}

impl AttemptTally {
    pub fn record(&self, status: AttemptStatus) {
        let counter = match status {
            AttemptStatus::Rotated => &self.rotated,
            AttemptStatus::Idempotent => &self.idempotent_hits,
            AttemptStatus::Failed => &self.failed,
            AttemptStatus::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TallySnapshot {
        let rotated = self.rotated.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let decided = rotated + failed;
        TallySnapshot {
            rotated,
            idempotent_hits: self.idempotent_hits.load(Ordering::Relaxed),
            failed,
            skipped: self.skipped.load(Ordering::Relaxed),
            success_rate: (decided > 0).then(|| rotated as f64 / decided as f64),
        }
    }
}
