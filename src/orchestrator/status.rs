//! Operator view of every key.
//!
//! Joins the credential, sync status and breaker rows for a key into one
//! secret-free record. Errors show up as their class only.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::orchestrator::{Orchestrator, TallySnapshot};
use crate::store::{BreakerRow, BreakerState, CredentialKey, CredentialView, StoreResult, SyncStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyStatus {
    pub key: CredentialKey,
    pub credential: Option<CredentialView>,
    /// Most restrictive state across the key's breaker scopes.
    pub breaker: BreakerState,
    pub consecutive_failures: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub paused_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub tally: TallySnapshot,
    pub keys: Vec<KeyStatus>,
    /// Breaker scopes that are not closed.
    pub tripped_breakers: Vec<BreakerRow>,
}

fn severity(state: BreakerState) -> u8 {
    match state {
        BreakerState::Closed => 0,
        BreakerState::HalfOpen => 1,
        BreakerState::Open => 2,
    }
}

impl Orchestrator {
    /// Status of one key; `None` when nothing at all is known about it.
    pub async fn key_status(&self, key: &CredentialKey) -> StoreResult<Option<KeyStatus>> {
        let credential = self.store.load_credential(key).await?.map(|r| r.view());
        let sync = self.store.load_sync_status(key).await?;
        if credential.is_none() && sync.is_none() {
            return Ok(None);
        }

        let mut breaker = BreakerState::Closed;
        for scope in self.breaker.scopes(&key.provider, &key.location) {
            if let Some(row) = self.store.load_breaker(&scope).await? {
                if severity(row.state) > severity(breaker) {
                    breaker = row.state;
                }
            }
        }

        let sync = sync.unwrap_or_else(|| SyncStatus::new(key.clone()));
        Ok(Some(KeyStatus {
            key: key.clone(),
            credential,
            breaker,
            consecutive_failures: sync.consecutive_failures,
            last_run_at: sync.last_run_at,
            last_success_at: sync.last_success_at,
            last_error: sync.last_error,
            next_attempt_at: sync.next_attempt_at,
            paused_until: sync.paused_until,
        }))
    }

    /// Every key that has a credential or a sync history, in key order.
    pub async fn status_report(&self) -> StoreResult<StatusReport> {
        let mut keys: BTreeSet<CredentialKey> = self
            .store
            .list_credentials()
            .await?
            .into_iter()
            .map(|r| r.key)
            .collect();
        keys.extend(self.store.list_sync_statuses().await?.into_iter().map(|s| s.key));

        let mut statuses = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(status) = self.key_status(key).await? {
                statuses.push(status);
            }
        }

        let tripped_breakers = self
            .store
            .list_breakers()
            .await?
            .into_iter()
            .filter(|row| row.state != BreakerState::Closed)
            .collect();

        Ok(StatusReport {
            tally: self.tally(),
            keys: statuses,
            tripped_breakers,
        })
    }
}
