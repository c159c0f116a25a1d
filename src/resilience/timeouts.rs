//! Timeout enforcement.
//!
//! # Responsibilities
//! - Put a deadline on every suspension point of an attempt: provider calls,
//!   store writes
//! - Turn an elapsed deadline into the caller's own error type
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities; the inner future is dropped on expiry
//! - A timed-out provider call is a failure for breaker/backoff, never a hang
//! - A timed-out store call is fatal for the attempt

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::provider::{ProviderError, ProviderResult};
use crate::store::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{operation} exceeded {limit:?}")]
pub struct DeadlineExceeded {
    pub operation: &'static str,
    pub limit: Duration,
}

/// Run `fut` with a deadline.
pub async fn deadline<F, T>(operation: &'static str, limit: Duration, fut: F) -> Result<T, DeadlineExceeded>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| DeadlineExceeded { operation, limit })
}

/// Store call with a deadline; expiry becomes [`StoreError::Timeout`].
pub async fn store_call<F, T>(operation: &'static str, limit: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match deadline(operation, limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(operation, limit_ms = limit.as_millis() as u64, "Store call timed out");
            Err(StoreError::Timeout(operation))
        }
    }
}

/// Provider call with a deadline; expiry becomes [`ProviderError::Timeout`].
pub async fn provider_call<F, T>(operation: &'static str, limit: Duration, fut: F) -> ProviderResult<T>
where
    F: Future<Output = ProviderResult<T>>,
{
    match deadline(operation, limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, limit_ms = limit.as_millis() as u64, "Provider call timed out");
            Err(ProviderError::Timeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_passes_fast_futures() {
        let value = deadline("noop", Duration::from_millis(100), async { 7 }).await;
        assert_eq!(value, Ok(7));
    }

    #[tokio::test]
    async fn test_store_call_maps_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, StoreError>(())
        };
        let err = store_call("append_run", Duration::from_millis(20), slow)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout("append_run")));
    }

    #[tokio::test]
    async fn test_provider_call_maps_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ProviderError>(())
        };
        let err = provider_call("exchange_token", Duration::from_millis(20), slow)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Timeout));
    }
}
