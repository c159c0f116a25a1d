//! Missed-heartbeat detection.
//!
//! # Responsibilities
//! - Periodically scan every credential that is expected to be rotating
//! - Alert when a key has gone longer than the allowed silence without a
//!   successful run

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time;

use crate::alerts::{Alert, Notifier, Severity};
use crate::clock::{span, Clock};
use crate::config::AlertConfig;
use crate::store::{CredentialStatus, CredentialStore, StoreResult};

pub struct HeartbeatMonitor {
    store: Arc<dyn CredentialStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: AlertConfig,
}

impl HeartbeatMonitor {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: AlertConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            config,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.heartbeat_enabled {
            tracing::info!("Heartbeat monitor disabled");
            return;
        }

        tracing::info!(
            interval = self.config.heartbeat_interval_secs,
            max_silence = self.config.heartbeat_max_silence_secs,
            "Heartbeat monitor starting"
        );

        let mut ticker = time::interval(Duration::from_secs(self.config.heartbeat_interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_all().await {
                        tracing::error!(error = %e, "Heartbeat scan failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Heartbeat monitor received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// One scan. Returns how many keys were found silent.
    pub async fn check_all(&self) -> StoreResult<usize> {
        let now = self.clock.now();
        let max_silence = span(Duration::from_secs(self.config.heartbeat_max_silence_secs));
        let mut silent = 0;

        for record in self.store.list_credentials().await? {
            // Invalid credentials are already alerted on and need an operator.
            if record.status == CredentialStatus::Invalid {
                continue;
            }
            let last_ok = self.store.last_successful_run(&record.key).await?;
            let since = last_ok.map(|r| r.finished_at).unwrap_or(record.created_at);
            if now - since <= max_silence {
                continue;
            }

            silent += 1;
            let alert = Alert::new(
                Severity::Warning,
                format!("heartbeat:{}", record.key),
                "Missed rotation heartbeat",
                format!("no successful run for {} since {}", record.key, since.to_rfc3339()),
            )
            .with("location", &record.key.location)
            .with("provider", &record.key.provider)
            .with("silent_minutes", (now - since).num_minutes());
            self.notifier.notify(&alert).await;
        }
        Ok(silent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::envelope::{encrypt, EncryptionKey, ProviderSecrets};
    use crate::store::{CredentialKey, CredentialUpsert, InMemoryStore, RunKind, RunRecord};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<Vec<Alert>>);

    #[async_trait]
    impl Notifier for Capture {
        async fn notify(&self, alert: &Alert) -> bool {
            self.0.lock().unwrap().push(alert.clone());
            true
        }
    }

    #[tokio::test]
    async fn test_silent_key_alerts() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let capture = Arc::new(Capture::default());
        let key = CredentialKey::new("loc-1", "square");
        let secrets = ProviderSecrets::new("api-key-0001", "secret");

        store
            .upsert_credential(CredentialUpsert {
                key: key.clone(),
                ciphertext: encrypt(&secrets, &EncryptionKey::generate()).unwrap(),
                masked_hints: secrets.masked_hints(),
                expires_at: None,
                now: clock.now(),
            })
            .await
            .unwrap();

        let monitor = HeartbeatMonitor::new(store.clone(), capture.clone(), clock.clone(), AlertConfig::default());
        assert_eq!(monitor.check_all().await.unwrap(), 0);

        clock.advance(chrono::Duration::hours(7));
        assert_eq!(monitor.check_all().await.unwrap(), 1);
        assert_eq!(capture.0.lock().unwrap()[0].condition, "heartbeat:loc-1/square");

        store
            .append_run(RunRecord {
                id: uuid::Uuid::new_v4(),
                key: key.clone(),
                kind: RunKind::Rotation,
                started_at: clock.now(),
                finished_at: clock.now(),
                ok: true,
                items: 1,
                status: "rotated".into(),
                error: None,
                attempt: 1,
                rotation_id: None,
                token_fingerprint: None,
            })
            .await
            .unwrap();
        assert_eq!(monitor.check_all().await.unwrap(), 0);
    }
}
