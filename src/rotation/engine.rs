//! Idempotent credential swap.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Clock;
use crate::envelope::{
    decrypt, encrypt, EnvelopeError, KeyProvider, MaskedHints, ProviderSecrets, SealedEnvelope,
};
use crate::rotation::RotationId;
use crate::store::{
    ConditionalRotation, CredentialKey, CredentialRecord, CredentialStatus, CredentialStore,
    CredentialUpsert, CredentialView, RotateRow, RotationAuditEntry, StoreError, StoreResult,
};

#[derive(Debug, Error)]
pub enum RotationError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Which caller performed the effective swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationResult {
    Rotated,
    Idempotent,
}

impl RotationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rotated => "rotated",
            Self::Idempotent => "idempotent",
        }
    }
}

/// `{result, rowsAffected, tokenId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationReceipt {
    pub result: RotationResult,
    pub rows_affected: u64,
    /// Row written by this call; `None` for idempotent hits.
    pub token_id: Option<String>,
}

pub struct RotationRequest {
    pub key: CredentialKey,
    pub rotation_id: RotationId,
    pub ciphertext: SealedEnvelope,
    pub masked_hints: MaskedHints,
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct ConnectRequest {
    pub key: CredentialKey,
    pub secrets: ProviderSecrets,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Owns every write to credential records.
#[derive(Clone)]
pub struct RotationEngine {
    store: Arc<dyn CredentialStore>,
    keys: Arc<dyn KeyProvider>,
    clock: Arc<dyn Clock>,
}

impl RotationEngine {
    pub fn new(store: Arc<dyn CredentialStore>, keys: Arc<dyn KeyProvider>, clock: Arc<dyn Clock>) -> Self {
        Self { store, keys, clock }
    }

    /// Store (or re-supply) secrets for a key. The record comes back
    /// `pending` until the first successful rotation verifies it.
    pub async fn connect(&self, request: ConnectRequest) -> Result<CredentialView, RotationError> {
        let key = self.keys.encryption_key()?;
        let ciphertext = encrypt(&request.secrets, &key)?;
        let masked_hints = request.secrets.masked_hints();

        self.store
            .upsert_credential(CredentialUpsert {
                key: request.key.clone(),
                ciphertext,
                masked_hints: masked_hints.clone(),
                expires_at: request.expires_at,
                now: self.clock.now(),
            })
            .await?;

        tracing::info!(
            location = %request.key.location,
            provider = %request.key.provider,
            api_key = masked_hints.api_key.as_deref().unwrap_or("-"),
            "Credentials connected"
        );

        self.store
            .load_credential(&request.key)
            .await?
            .map(|r| r.view())
            .ok_or(RotationError::Store(StoreError::NotFound(request.key)))
    }

    /// Decrypt a record's secrets.
    pub fn open(&self, record: &CredentialRecord) -> Result<ProviderSecrets, EnvelopeError> {
        let key = self.keys.encryption_key()?;
        decrypt(&record.ciphertext, &key)
    }

    pub fn seal(&self, secrets: &ProviderSecrets) -> Result<SealedEnvelope, EnvelopeError> {
        let key = self.keys.encryption_key()?;
        encrypt(secrets, &key)
    }

    /// `rotate(location, provider, rotationId, newCiphertext, expiresAt)`.
    ///
    /// Store failures propagate; they are never read as idempotent.
    pub async fn rotate(&self, request: RotationRequest) -> StoreResult<RotationReceipt> {
        let now = self.clock.now();
        let token_fingerprint = request.masked_hints.token_fingerprint.clone();

        let row = self
            .store
            .rotate_conditional(ConditionalRotation {
                key: request.key.clone(),
                rotation_id: request.rotation_id,
                ciphertext: request.ciphertext,
                expires_at: request.expires_at,
                masked_hints: request.masked_hints,
                now,
            })
            .await?;

        let (receipt, previous_fingerprint) = match row {
            RotateRow::Updated { id, previous_fingerprint } => (
                RotationReceipt {
                    result: RotationResult::Rotated,
                    rows_affected: 1,
                    token_id: Some(id.to_string()),
                },
                previous_fingerprint,
            ),
            RotateRow::Unchanged => (
                RotationReceipt {
                    result: RotationResult::Idempotent,
                    rows_affected: 0,
                    token_id: None,
                },
                None,
            ),
            RotateRow::Missing => return Err(StoreError::NotFound(request.key)),
        };

        self.store
            .append_rotation_audit(RotationAuditEntry {
                rotation_id: request.rotation_id,
                key: request.key.clone(),
                result: receipt.result.as_str().to_string(),
                previous_fingerprint: previous_fingerprint.clone(),
                token_fingerprint: token_fingerprint.clone(),
                recorded_at: now,
            })
            .await?;

        tracing::info!(
            location = %request.key.location,
            provider = %request.key.provider,
            rotation_id = %request.rotation_id,
            result = receipt.result.as_str(),
            previous = previous_fingerprint.as_deref().unwrap_or("-"),
            fingerprint = token_fingerprint.as_deref().unwrap_or("-"),
            "Rotation applied"
        );

        Ok(receipt)
    }

    /// Mark a credential unusable until it is re-supplied.
    pub async fn invalidate(&self, key: &CredentialKey, reason: &str) -> StoreResult<bool> {
        let found = self
            .store
            .set_credential_status(key, CredentialStatus::Invalid, self.clock.now())
            .await?;
        if found {
            tracing::warn!(
                location = %key.location,
                provider = %key.provider,
                reason,
                "Credentials marked invalid"
            );
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::envelope::StaticKeyProvider;
    use crate::store::InMemoryStore;

    fn engine() -> (RotationEngine, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let engine = RotationEngine::new(
            store.clone(),
            Arc::new(StaticKeyProvider::generate()),
            Arc::new(SystemClock),
        );
        (engine, store)
    }

    fn key() -> CredentialKey {
        CredentialKey::new("loc-1", "square")
    }

    async fn connected(engine: &RotationEngine) {
        engine
            .connect(ConnectRequest {
                key: key(),
                secrets: ProviderSecrets::new("sq0idp-abcdef1234", "sq0csp-secret").with_access_token("old-token"),
                expires_at: None,
            })
            .await
            .unwrap();
    }

    fn request(engine: &RotationEngine, id: RotationId, token: &str) -> RotationRequest {
        let secrets = ProviderSecrets::new("sq0idp-abcdef1234", "sq0csp-secret").with_access_token(token);
        RotationRequest {
            key: key(),
            rotation_id: id,
            ciphertext: engine.seal(&secrets).unwrap(),
            masked_hints: secrets.masked_hints(),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_connect_starts_pending() {
        let (engine, _) = engine();
        let view = engine
            .connect(ConnectRequest {
                key: key(),
                secrets: ProviderSecrets::new("sq0idp-abcdef1234", "sq0csp-secret"),
                expires_at: None,
            })
            .await
            .unwrap();
        assert_eq!(view.status, CredentialStatus::Pending);
        assert_eq!(view.masked_hints.api_key.as_deref(), Some("****1234"));
    }

    #[tokio::test]
    async fn test_same_id_rotates_once() {
        let (engine, store) = engine();
        connected(&engine).await;
        let id = RotationId::new();

        let first = engine.rotate(request(&engine, id, "token-a")).await.unwrap();
        let second = engine.rotate(request(&engine, id, "token-b")).await.unwrap();
        assert_eq!(first.result, RotationResult::Rotated);
        assert_eq!(first.rows_affected, 1);
        assert!(first.token_id.is_some());
        assert_eq!(second.result, RotationResult::Idempotent);
        assert_eq!(second.token_id, None);

        let record = store.load_credential(&key()).await.unwrap().unwrap();
        let secrets = engine.open(&record).unwrap();
        assert_eq!(secrets.access_token.as_deref(), Some("token-a"));

        let audit = store.rotation_audit(&key()).await.unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[1].result, "idempotent");
    }

    #[tokio::test]
    async fn test_distinct_ids_supersede() {
        let (engine, store) = engine();
        connected(&engine).await;

        let a = engine.rotate(request(&engine, RotationId::new(), "token-a")).await.unwrap();
        let b = engine.rotate(request(&engine, RotationId::new(), "token-b")).await.unwrap();
        assert_eq!(a.result, RotationResult::Rotated);
        assert_eq!(b.result, RotationResult::Rotated);

        let record = store.load_credential(&key()).await.unwrap().unwrap();
        assert_eq!(engine.open(&record).unwrap().access_token.as_deref(), Some("token-b"));

        let audit = store.rotation_audit(&key()).await.unwrap();
        assert_eq!(audit[1].previous_fingerprint, audit[0].token_fingerprint);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_converge() {
        let (engine, store) = engine();
        connected(&engine).await;
        let id = RotationId::new();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..50 {
            let engine = engine.clone();
            let req = request(&engine, id, &format!("token-{i}"));
            tasks.spawn(async move { engine.rotate(req).await.unwrap().result });
        }
        let mut rotated = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap() == RotationResult::Rotated {
                rotated += 1;
            }
        }
        assert_eq!(rotated, 1);

        let record = store.load_credential(&key()).await.unwrap().unwrap();
        assert_eq!(record.rotation_attempt_id, Some(id));
    }

    #[tokio::test]
    async fn test_missing_row_is_an_error() {
        let (engine, _) = engine();
        let err = engine
            .rotate(request(&engine, RotationId::new(), "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_store_outage_is_not_idempotent() {
        let (engine, store) = engine();
        connected(&engine).await;
        store.set_unavailable(true);
        let err = engine
            .rotate(request(&engine, RotationId::new(), "t"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_invalidate() {
        let (engine, store) = engine();
        assert!(!engine.invalidate(&key(), "auth").await.unwrap());
        connected(&engine).await;
        assert!(engine.invalidate(&key(), "auth").await.unwrap());
        let record = store.load_credential(&key()).await.unwrap().unwrap();
        assert_eq!(record.status, CredentialStatus::Invalid);
    }
}
