//! Periodic rotation loop.
//!
//! # Responsibilities
//! - Every interval, pick credentials that are due: never verified, last
//!   verified longer ago than the maximum age, or holding a token that
//!   expires within the refresh window
//! - Run their attempts concurrently, bounded by a semaphore
//! - Stop on the shutdown broadcast

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time;

use crate::clock::span;
use crate::config::SchedulerConfig;
use crate::orchestrator::Orchestrator;
use crate::store::{CredentialRecord, CredentialStatus, StoreResult};

pub struct RotationScheduler {
    orchestrator: Orchestrator,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
}

/// Selection windows for one sweep.
#[derive(Debug, Clone, Copy)]
pub struct DueWindows {
    pub refresh_before_expiry: Duration,
    pub max_verified_age: Duration,
}

impl From<&SchedulerConfig> for DueWindows {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            refresh_before_expiry: Duration::from_secs(config.refresh_before_expiry_secs),
            max_verified_age: Duration::from_secs(config.max_verified_age_secs),
        }
    }
}

/// Due when never verified, verified too long ago, or expiring inside the
/// refresh window. Tokens without a known expiry rely on the age rule.
pub fn is_due(record: &CredentialRecord, now: DateTime<Utc>, windows: DueWindows) -> bool {
    if record.status == CredentialStatus::Invalid {
        return false;
    }
    let Some(verified_at) = record.last_verified_at else {
        return true;
    };
    if now - verified_at >= span(windows.max_verified_age) {
        return true;
    }
    match record.expires_at {
        Some(expires_at) => expires_at <= now + span(windows.refresh_before_expiry),
        None => false,
    }
}

impl RotationScheduler {
    pub fn new(orchestrator: Orchestrator, config: SchedulerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_attempts.max(1)));
        Self {
            orchestrator,
            config,
            permits,
        }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            tracing::info!("Rotation scheduler disabled");
            return;
        }

        tracing::info!(
            interval = self.config.interval_secs,
            max_concurrent = self.config.max_concurrent_attempts,
            "Rotation scheduler starting"
        );

        let mut ticker = time::interval(Duration::from_secs(self.config.interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "Rotation sweep failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Rotation scheduler received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// One sweep. Returns the number of outcomes per status.
    pub async fn run_once(&self) -> StoreResult<HashMap<&'static str, usize>> {
        let now = self.orchestrator.clock().now();
        let windows = DueWindows::from(&self.config);
        let due: Vec<_> = self
            .orchestrator
            .store()
            .list_credentials()
            .await?
            .into_iter()
            .filter(|r| is_due(r, now, windows))
            .map(|r| r.key)
            .collect();

        let mut tasks = JoinSet::new();
        for key in due {
            let orchestrator = self.orchestrator.clone();
            let permits = self.permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                orchestrator.run_attempt(&key.location, &key.provider).await
            });
        }

        let mut counts = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let label = match joined {
                Ok(Ok(outcome)) => outcome.status.as_str(),
                Ok(Err(_)) => "error",
                Err(e) => {
                    tracing::error!(error = %e, "Attempt task panicked");
                    "error"
                }
            };
            *counts.entry(label).or_insert(0) += 1;
        }

        if !counts.is_empty() {
            tracing::info!(outcomes = ?counts, "Rotation sweep finished");
        }
        Ok(counts)
    }
}
