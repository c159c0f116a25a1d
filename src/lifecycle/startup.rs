//! Startup orchestration.
//!
//! # Responsibilities
//! - Check the encryption key and build every subsystem in dependency order
//! - Start background tasks (scheduler, heartbeat, settings invalidation,
//!   config reload)
//! - Bind the operator API last, then wait for a shutdown signal
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Only the API key reloads live; other settings need a restart

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;

use crate::alerts::{build_notifier, heartbeat::HeartbeatMonitor};
use crate::chaos::ChaosHarness;
use crate::clock::{Clock, SystemClock};
use crate::config::{watcher::ConfigWatcher, RotatorConfig};
use crate::envelope::{EnvKeyProvider, EnvelopeError, KeyProvider};
use crate::http::{ApiServer, AppState};
use crate::lifecycle::{signals::shutdown_signal, Shutdown};
use crate::observability::metrics::init_metrics;
use crate::orchestrator::{Orchestrator, OrchestratorParts, RotationScheduler};
use crate::provider::{ProviderError, ProviderRegistry};
use crate::store::{CredentialStore, InMemoryStore};

/// Grace period for background tasks after the API has stopped.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("encryption key: {0}")]
    Key(#[from] EnvelopeError),

    #[error("provider setup: {0}")]
    Provider(#[from] ProviderError),

    #[error("invalid address '{0}'")]
    Address(String),

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config watcher: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Run the service until a shutdown signal arrives.
pub async fn run(config: RotatorConfig, config_path: Option<PathBuf>) -> Result<(), StartupError> {
    if config.observability.metrics_enabled {
        let addr: SocketAddr = config
            .observability
            .metrics_address
            .parse()
            .map_err(|_| StartupError::Address(config.observability.metrics_address.clone()))?;
        init_metrics(addr);
    }

    let keys: Arc<dyn KeyProvider> = Arc::new(EnvKeyProvider::default());
    keys.encryption_key()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn CredentialStore> = Arc::new(InMemoryStore::new());
    let providers = ProviderRegistry::from_config(&config, clock.clone())?;
    let notifier = build_notifier(&config.alerts, clock.clone());

    let orchestrator = Orchestrator::new(
        &config,
        OrchestratorParts {
            store: store.clone(),
            keys,
            providers,
            notifier: notifier.clone(),
            clock: clock.clone(),
        },
    );

    let shutdown = Shutdown::new();
    let settings_watch = orchestrator
        .settings_cache()
        .watch(Duration::from_millis(config.settings_cache.debounce_ms));

    let scheduler = RotationScheduler::new(orchestrator.clone(), config.scheduler.clone());
    tokio::spawn(scheduler.run(shutdown.subscribe()));

    let heartbeat = HeartbeatMonitor::new(store, notifier, clock.clone(), config.alerts.clone());
    tokio::spawn(heartbeat.run(shutdown.subscribe()));

    let harness = ChaosHarness::new(config.chaos.clone(), clock);
    let state = AppState::new(orchestrator, harness, config.server.api_key.clone());

    let _watcher = match config_path {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(&path);
            let handle = watcher.run()?;
            let state = state.clone();
            tokio::spawn(async move {
                while let Some(updated) = updates.recv().await {
                    state.set_api_key(updated.server.api_key.clone());
                    tracing::info!("Configuration reloaded; API key applied, other changes take effect on restart");
                }
            });
            Some(handle)
        }
        None => None,
    };

    let address = config.server.bind_address.clone();
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|source| StartupError::Bind {
            address: address.clone(),
            source,
        })?;

    let server = ApiServer::new(state, &config.server);
    let server_task = tokio::spawn(server.run(listener, shutdown.subscribe()));

    tracing::info!(
        bind_address = %address,
        providers = config.providers.len(),
        scheduler = config.scheduler.enabled,
        "Rotator started"
    );

    shutdown_signal().await;
    shutdown.trigger();

    match server_task.await {
        Ok(Err(e)) => tracing::error!(error = %e, "Operator API exited with error"),
        Err(e) => tracing::error!(error = %e, "Operator API task panicked"),
        Ok(Ok(())) => {}
    }
    settings_watch.unsubscribe();
    shutdown.drain(DRAIN_GRACE).await;

    tracing::info!("Shutdown complete");
    Ok(())
}
