//! In-process reference store.
//!
//! Each table is a `DashMap`. A mutation takes the shard lock for its key,
//! applies the pure transition, and releases the lock before anything is
//! published, so every write is one conditional step with no
//! read-modify-write window. No map guard is ever held across an `.await`.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::resilience::backoff::{apply_outcome, BackoffPolicy, SyncOutcome};
use crate::resilience::circuit_breaker::{transition, BreakerEvent, BreakerPolicy, BreakerTransition};
use crate::store::events::{StoreEvent, StoreEvents, Subscription};
use crate::store::types::*;
use crate::store::{CredentialStore, StoreError, StoreResult};

#[derive(Debug, Default)]
pub struct InMemoryStore {
    credentials: DashMap<CredentialKey, CredentialRecord>,
    audit: DashMap<CredentialKey, Vec<RotationAuditEntry>>,
    sync: DashMap<CredentialKey, SyncStatus>,
    breakers: DashMap<BreakerScope, BreakerRow>,
    runs: DashMap<CredentialKey, Vec<RunRecord>>,
    settings: DashMap<String, LocationSettings>,
    events: StoreEvents,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `Unavailable` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for InMemoryStore {
    async fn upsert_credential(&self, upsert: CredentialUpsert) -> StoreResult<CredentialRowId> {
        self.ensure_available()?;
        let id = {
            let mut entry = self
                .credentials
                .entry(upsert.key.clone())
                .or_insert_with(|| CredentialRecord {
                    id: CredentialRowId::new(),
                    key: upsert.key.clone(),
                    ciphertext: upsert.ciphertext.clone(),
                    status: CredentialStatus::Pending,
                    rotation_attempt_id: None,
                    last_verified_at: None,
                    expires_at: upsert.expires_at,
                    masked_hints: upsert.masked_hints.clone(),
                    created_at: upsert.now,
                    updated_at: upsert.now,
                });
            let record = entry.value_mut();
            record.ciphertext = upsert.ciphertext;
            record.masked_hints = upsert.masked_hints;
            record.expires_at = upsert.expires_at;
            record.status = CredentialStatus::Pending;
            record.rotation_attempt_id = None;
            record.last_verified_at = None;
            record.updated_at = upsert.now;
            record.id
        };
        self.events.publish(StoreEvent::CredentialChanged(upsert.key));
        Ok(id)
    }

    async fn load_credential(&self, key: &CredentialKey) -> StoreResult<Option<CredentialRecord>> {
        self.ensure_available()?;
        Ok(self.credentials.get(key).map(|r| r.value().clone()))
    }

    async fn list_credentials(&self) -> StoreResult<Vec<CredentialRecord>> {
        self.ensure_available()?;
        let mut all: Vec<_> = self.credentials.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(all)
    }

    async fn rotate_conditional(&self, rotation: ConditionalRotation) -> StoreResult<RotateRow> {
        self.ensure_available()?;
        let outcome = {
            let Some(mut row) = self.credentials.get_mut(&rotation.key) else {
                return Ok(RotateRow::Missing);
            };
            if row.rotation_attempt_id == Some(rotation.rotation_id) {
                RotateRow::Unchanged
            } else {
                let previous_fingerprint = row.masked_hints.token_fingerprint.clone();
                row.ciphertext = rotation.ciphertext;
                row.rotation_attempt_id = Some(rotation.rotation_id);
                row.masked_hints = rotation.masked_hints;
                row.expires_at = rotation.expires_at;
                row.status = CredentialStatus::Connected;
                row.last_verified_at = Some(rotation.now);
                row.updated_at = rotation.now;
                RotateRow::Updated {
                    id: row.id,
                    previous_fingerprint,
                }
            }
        };
        if matches!(outcome, RotateRow::Updated { .. }) {
            self.events.publish(StoreEvent::CredentialChanged(rotation.key));
        }
        Ok(outcome)
    }

    async fn set_credential_status(
        &self,
        key: &CredentialKey,
        status: CredentialStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.ensure_available()?;
        let changed = match self.credentials.get_mut(key) {
            Some(mut row) => {
                row.status = status;
                row.updated_at = now;
                true
            }
            None => false,
        };
        if changed {
            self.events.publish(StoreEvent::CredentialChanged(key.clone()));
        }
        Ok(changed)
    }

    async fn append_rotation_audit(&self, entry: RotationAuditEntry) -> StoreResult<()> {
        self.ensure_available()?;
        self.audit.entry(entry.key.clone()).or_default().push(entry);
        Ok(())
    }

    async fn rotation_audit(&self, key: &CredentialKey) -> StoreResult<Vec<RotationAuditEntry>> {
        self.ensure_available()?;
        Ok(self.audit.get(key).map(|r| r.value().clone()).unwrap_or_default())
    }

    async fn load_sync_status(&self, key: &CredentialKey) -> StoreResult<Option<SyncStatus>> {
        self.ensure_available()?;
        Ok(self.sync.get(key).map(|r| r.value().clone()))
    }

    async fn apply_sync_outcome(
        &self,
        key: &CredentialKey,
        outcome: &SyncOutcome,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<SyncStatus> {
        self.ensure_available()?;
        let next = {
            let mut entry = self
                .sync
                .entry(key.clone())
                .or_insert_with(|| SyncStatus::new(key.clone()));
            let next = apply_outcome(entry.value(), outcome, policy, now);
            *entry.value_mut() = next.clone();
            next
        };
        self.events.publish(StoreEvent::SyncStatusChanged(key.clone()));
        Ok(next)
    }

    async fn list_sync_statuses(&self) -> StoreResult<Vec<SyncStatus>> {
        self.ensure_available()?;
        let mut all: Vec<_> = self.sync.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(all)
    }

    async fn apply_breaker_event(
        &self,
        scope: &BreakerScope,
        event: BreakerEvent,
        policy: &BreakerPolicy,
        now: DateTime<Utc>,
    ) -> StoreResult<BreakerTransition> {
        self.ensure_available()?;
        let result = {
            let mut entry = self
                .breakers
                .entry(scope.clone())
                .or_insert_with(|| BreakerRow::closed(scope.clone(), now));
            let result = transition(entry.value(), event, policy, now);
            *entry.value_mut() = result.row.clone();
            result
        };
        if result.changed() {
            self.events.publish(StoreEvent::BreakerChanged(scope.clone()));
        }
        Ok(result)
    }

    async fn load_breaker(&self, scope: &BreakerScope) -> StoreResult<Option<BreakerRow>> {
        self.ensure_available()?;
        Ok(self.breakers.get(scope).map(|r| r.value().clone()))
    }

    async fn list_breakers(&self) -> StoreResult<Vec<BreakerRow>> {
        self.ensure_available()?;
        let mut all: Vec<_> = self.breakers.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.scope.to_string().cmp(&b.scope.to_string()));
        Ok(all)
    }

    async fn append_run(&self, run: RunRecord) -> StoreResult<()> {
        self.ensure_available()?;
        self.runs.entry(run.key.clone()).or_default().push(run);
        Ok(())
    }

    async fn runs_for(&self, key: &CredentialKey) -> StoreResult<Vec<RunRecord>> {
        self.ensure_available()?;
        Ok(self.runs.get(key).map(|r| r.value().clone()).unwrap_or_default())
    }

    async fn last_successful_run(&self, key: &CredentialKey) -> StoreResult<Option<RunRecord>> {
        self.ensure_available()?;
        Ok(self.runs.get(key).and_then(|runs| {
            runs.iter()
                .filter(|r| r.ok)
                .max_by_key(|r| r.finished_at)
                .cloned()
        }))
    }

    async fn load_location_settings(&self, location: &str) -> StoreResult<Option<LocationSettings>> {
        self.ensure_available()?;
        Ok(self.settings.get(location).map(|r| r.value().clone()))
    }

    async fn save_location_settings(
        &self,
        location: &str,
        settings: LocationSettings,
    ) -> StoreResult<()> {
        self.ensure_available()?;
        self.settings.insert(location.to_string(), settings);
        self.events.publish(StoreEvent::SettingsChanged {
            location: location.to_string(),
        });
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{encrypt, EncryptionKey, ProviderSecrets};
    use crate::rotation::RotationId;
    use std::sync::Arc;

    fn key() -> CredentialKey {
        CredentialKey::new("loc-1", "square")
    }

    fn upsert(enc: &EncryptionKey, token: &str) -> CredentialUpsert {
        let secrets = ProviderSecrets::new("key-123456789", "secret").with_access_token(token);
        CredentialUpsert {
            key: key(),
            ciphertext: encrypt(&secrets, enc).unwrap(),
            masked_hints: secrets.masked_hints(),
            expires_at: None,
            now: Utc::now(),
        }
    }

    fn rotation(enc: &EncryptionKey, id: RotationId, token: &str) -> ConditionalRotation {
        let secrets = ProviderSecrets::new("key-123456789", "secret").with_access_token(token);
        ConditionalRotation {
            key: key(),
            rotation_id: id,
            ciphertext: encrypt(&secrets, enc).unwrap(),
            expires_at: None,
            masked_hints: secrets.masked_hints(),
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_conditional_rotation() {
        let store = InMemoryStore::new();
        let enc = EncryptionKey::generate();
        let id = RotationId::new();

        assert_eq!(
            store.rotate_conditional(rotation(&enc, id, "t1")).await.unwrap(),
            RotateRow::Missing
        );

        store.upsert_credential(upsert(&enc, "t0")).await.unwrap();
        let first = store.rotate_conditional(rotation(&enc, id, "t1")).await.unwrap();
        assert!(matches!(first, RotateRow::Updated { .. }));
        let again = store.rotate_conditional(rotation(&enc, id, "t2")).await.unwrap();
        assert_eq!(again, RotateRow::Unchanged);

        let record = store.load_credential(&key()).await.unwrap().unwrap();
        assert_eq!(record.status, CredentialStatus::Connected);
        assert_eq!(record.rotation_attempt_id, Some(id));
    }

    #[tokio::test]
    async fn test_reconnect_clears_marker() {
        let store = InMemoryStore::new();
        let enc = EncryptionKey::generate();
        let first_id = store.upsert_credential(upsert(&enc, "t0")).await.unwrap();
        store
            .rotate_conditional(rotation(&enc, RotationId::new(), "t1"))
            .await
            .unwrap();

        let second_id = store.upsert_credential(upsert(&enc, "t9")).await.unwrap();
        assert_eq!(first_id, second_id);
        let record = store.load_credential(&key()).await.unwrap().unwrap();
        assert_eq!(record.status, CredentialStatus::Pending);
        assert_eq!(record.rotation_attempt_id, None);
    }

    #[tokio::test]
    async fn test_concurrent_breaker_failures_are_not_lost() {
        let store = Arc::new(InMemoryStore::new());
        let policy = BreakerPolicy {
            threshold: 1000,
            ..Default::default()
        };
        let scope = BreakerScope::provider("square");

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..200 {
            let store = store.clone();
            let scope = scope.clone();
            tasks.spawn(async move {
                store
                    .apply_breaker_event(&scope, BreakerEvent::Failure, &policy, Utc::now())
                    .await
                    .unwrap();
            });
        }
        while tasks.join_next().await.is_some() {}

        let row = store.load_breaker(&scope).await.unwrap().unwrap();
        assert_eq!(row.failure_count, 200);
    }

    #[tokio::test]
    async fn test_outage_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.load_credential(&key()).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        assert!(store.load_credential(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mutations_publish_events() {
        let store = InMemoryStore::new();
        let mut sub = store.subscribe();
        store
            .save_location_settings("loc-1", LocationSettings::default())
            .await
            .unwrap();
        assert_eq!(
            sub.recv().await,
            Some(StoreEvent::SettingsChanged {
                location: "loc-1".into()
            })
        );
    }
}
