//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};

use pos_rotator::chaos::{FaultMode, FaultSimulator, RecordingNotifier};
use pos_rotator::clock::{Clock, ManualClock};
use pos_rotator::config::RotatorConfig;
use pos_rotator::envelope::{ProviderSecrets, StaticKeyProvider};
use pos_rotator::orchestrator::{Orchestrator, OrchestratorParts};
use pos_rotator::provider::{HttpProvider, ProviderRegistry};
use pos_rotator::rotation::ConnectRequest;
use pos_rotator::store::{CredentialKey, CredentialStore, InMemoryStore};
use tracing_subscriber::fmt::MakeWriter;

pub const PROVIDER: &str = "square-sim";
pub const LOCATION: &str = "loc-downtown";
pub const API_KEY: &str = "sq0idp-live-4471";
pub const API_SECRET: &str = "sq0csp-secret-value-91";

/// One orchestrator wired to a fault simulator, an in-memory store and a
/// manual clock.
pub struct Fixture {
    pub simulator: FaultSimulator,
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
    pub alerts: Arc<RecordingNotifier>,
    pub orchestrator: Orchestrator,
    pub key: CredentialKey,
}

impl Fixture {
    pub async fn start(mode: FaultMode) -> Self {
        Self::start_with(mode, |_| {}).await
    }

    /// Start with a config adjusted by `tune` before anything is built.
    pub async fn start_with(mode: FaultMode, tune: impl FnOnce(&mut RotatorConfig)) -> Self {
        let simulator = FaultSimulator::start(mode).await.unwrap();
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let alerts = Arc::new(RecordingNotifier::default());

        let mut config = RotatorConfig::default();
        config.providers = vec![simulator.provider_config(PROVIDER)];
        config.timeouts.connect_secs = 1;
        config.timeouts.provider_request_secs = 1;
        config.timeouts.attempt_secs = 3;
        tune(&mut config);

        let provider = HttpProvider::new(
            config.provider(PROVIDER).unwrap(),
            &config.timeouts,
            clock.clone(),
        )
        .unwrap();
        let mut providers = ProviderRegistry::new();
        providers.register(PROVIDER, Arc::new(provider));

        let orchestrator = Orchestrator::new(
            &config,
            OrchestratorParts {
                store: store.clone(),
                keys: Arc::new(StaticKeyProvider::generate()),
                providers,
                notifier: alerts.clone(),
                clock: clock.clone(),
            },
        );

        let key = CredentialKey::new(LOCATION, PROVIDER);
        orchestrator
            .engine()
            .connect(ConnectRequest {
                key: key.clone(),
                secrets: ProviderSecrets::new(API_KEY, API_SECRET),
                expires_at: None,
            })
            .await
            .unwrap();

        Self {
            simulator,
            store,
            clock,
            alerts,
            orchestrator,
            key,
        }
    }

    /// Jump the clock to the end of any backoff or pause on the key.
    pub async fn skip_gates(&self) {
        if let Some(sync) = self.store.load_sync_status(&self.key).await.unwrap() {
            if let Some(target) = sync.next_attempt_at.max(sync.paused_until) {
                if target > self.clock.now() {
                    self.clock.set(target);
                }
            }
        }
    }
}

/// Log sink for `tracing::subscriber::set_default`.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap()).into_owned()
    }

    /// Subscriber that writes every crate event down to TRACE into this sink.
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_env_filter("pos_rotator=trace")
            .with_ansi(false)
            .finish()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
