//! Provider call failures.

use std::time::Duration;

use thiserror::Error;

use crate::resilience::ErrorClass;

/// Failure talking to a POS provider. Messages never carry response bodies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("provider returned a server error ({status:?})")]
    Transient { status: Option<u16> },

    #[error("provider call timed out")]
    Timeout,

    #[error("provider rejected credentials ({status})")]
    Auth { status: u16 },

    #[error("provider rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider response malformed: {0}")]
    Malformed(&'static str),

    #[error("provider rejected the request ({status})")]
    Rejected { status: u16 },

    #[error("unknown provider '{0}'")]
    Unknown(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transient { .. } | Self::Unknown(_) => ErrorClass::Transient,
            Self::Timeout => ErrorClass::Timeout,
            Self::Auth { .. } => ErrorClass::Auth,
            Self::RateLimited { .. } => ErrorClass::RateLimited,
            Self::Malformed(_) | Self::Rejected { .. } => ErrorClass::Malformed,
        }
    }

    /// Map a non-success HTTP status.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => Self::Auth { status },
            429 => Self::RateLimited { retry_after },
            500..=599 => Self::Transient { status: Some(status) },
            _ => Self::Rejected { status },
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Malformed("undecodable body")
        } else {
            Self::Transient {
                status: err.status().map(|s| s.as_u16()),
            }
        }
    }
}
