//! Retry classification.
//!
//! # Responsibilities
//! - Reduce every failure to a short, secret-free [`ErrorClass`]
//! - Decide which failures invalidate credentials instead of being retried
//! - Resolve the retry delay for rate limiting (Retry-After or fallback policy)
//!
//! # Design Decisions
//! - 401/403 are never retried blindly; the credential is marked invalid
//! - 5xx and timeouts are transient and go through backoff
//! - A missing Retry-After header falls back to a configurable policy

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::RetryAfterFallback;

/// Stable failure vocabulary used in run records, logs and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Timeout,
    Auth,
    RateLimited,
    Malformed,
    CiphertextInvalid,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Timeout => "timeout",
            Self::Auth => "auth",
            Self::RateLimited => "rate_limited",
            Self::Malformed => "malformed",
            Self::CiphertextInvalid => "ciphertext_invalid",
        }
    }

    /// Failures after which the stored credential is unusable.
    pub fn invalidates_credentials(&self) -> bool {
        matches!(self, Self::Auth | Self::CiphertextInvalid)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Delay to apply after a 429.
///
/// `None` means "use the normal exponential backoff".
pub fn rate_limit_delay(retry_after: Option<Duration>, fallback: &RetryAfterFallback) -> Option<Duration> {
    if retry_after.is_some() {
        return retry_after;
    }
    match fallback {
        RetryAfterFallback::Backoff => None,
        RetryAfterFallback::RandomRange { min_secs, max_secs } => {
            let (lo, hi) = if min_secs <= max_secs {
                (*min_secs, *max_secs)
            } else {
                (*max_secs, *min_secs)
            };
            Some(Duration::from_secs(rand::thread_rng().gen_range(lo..=hi)))
        }
    }
}
