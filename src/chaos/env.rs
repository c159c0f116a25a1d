//! Isolated world a scenario runs in.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::alerts::{Alert, Notifier};
use crate::chaos::simulator::{FaultMode, FaultSimulator};
use crate::chaos::{ChaosError, ChaosResult, ScenarioConfig};
use crate::clock::{Clock, ManualClock};
use crate::config::{ProviderConfig, RotatorConfig};
use crate::envelope::{ProviderSecrets, StaticKeyProvider};
use crate::orchestrator::{Orchestrator, OrchestratorParts};
use crate::provider::{HttpProvider, ProviderRegistry};
use crate::rotation::ConnectRequest;
use crate::store::{BreakerScope, BreakerState, CredentialKey, CredentialStore, InMemoryStore};

pub const CHAOS_PROVIDER: &str = "chaos-sim";
pub const DEFAULT_LOCATION: &str = "chaos-location";
pub const CHAOS_API_KEY: &str = "chaos-api-key-7781";
pub const CHAOS_API_SECRET: &str = "chaos-api-secret";

/// Keeps every alert in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, alert: &Alert) -> bool {
        match self.alerts.lock() {
            Ok(mut alerts) => {
                alerts.push(alert.clone());
                true
            }
            Err(_) => false,
        }
    }
}

pub struct ChaosEnv {
    pub simulator: FaultSimulator,
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
    pub orchestrator: Orchestrator,
    pub alerts: Arc<RecordingNotifier>,
    pub key: CredentialKey,
    last_breaker: BreakerState,
    transitions: u64,
}

impl ChaosEnv {
    /// Fresh simulator, store and clock, with one connected credential.
    pub async fn build(location: &str, config: &ScenarioConfig, mode: FaultMode) -> ChaosResult<Self> {
        let simulator = FaultSimulator::start(mode)
            .await
            .map_err(|e| ChaosError::Setup(format!("simulator: {e}")))?;
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let alerts = Arc::new(RecordingNotifier::default());

        let rotator_config = config.rotator_config(simulator.provider_config(CHAOS_PROVIDER));
        let mut providers = ProviderRegistry::new();
        let provider = HttpProvider::new(
            provider_config(&rotator_config)?,
            &rotator_config.timeouts,
            clock.clone(),
        )
        .map_err(|e| ChaosError::Setup(format!("provider: {e}")))?;
        providers.register(CHAOS_PROVIDER, Arc::new(provider));

        let orchestrator = Orchestrator::new(
            &rotator_config,
            OrchestratorParts {
                store: store.clone(),
                keys: Arc::new(StaticKeyProvider::generate()),
                providers,
                notifier: alerts.clone(),
                clock: clock.clone(),
            },
        );

        let key = CredentialKey::new(location, CHAOS_PROVIDER);
        orchestrator
            .engine()
            .connect(ConnectRequest {
                key: key.clone(),
                secrets: ProviderSecrets::new(CHAOS_API_KEY, CHAOS_API_SECRET),
                expires_at: None,
            })
            .await
            .map_err(|e| ChaosError::Setup(format!("connect: {e}")))?;

        Ok(Self {
            simulator,
            store,
            clock,
            orchestrator,
            alerts,
            key,
            last_breaker: BreakerState::Closed,
            transitions: 0,
        })
    }

    pub fn location(&self) -> &str {
        &self.key.location
    }

    /// Move the clock to the end of any backoff or pause on the key.
    pub async fn advance_past_gates(&self) -> ChaosResult<()> {
        let Some(sync) = self.store.load_sync_status(&self.key).await? else {
            return Ok(());
        };
        let target: Option<DateTime<Utc>> = sync.next_attempt_at.max(sync.paused_until);
        if let Some(target) = target {
            if target > self.clock.now() {
                self.clock.set(target);
            }
        }
        Ok(())
    }

    /// Provider-wide breaker scope of the simulator.
    pub fn scope(&self) -> BreakerScope {
        BreakerScope::provider(CHAOS_PROVIDER)
    }

    /// Note a breaker state change since the last observation.
    pub async fn observe_breaker(&mut self) -> ChaosResult<BreakerState> {
        let state = self
            .orchestrator
            .breaker()
            .state(&self.scope())
            .await?
            .map(|row| row.state)
            .unwrap_or(BreakerState::Closed);
        if self.last_breaker != state {
            self.transitions += 1;
            self.last_breaker = state;
        }
        Ok(state)
    }

    pub fn breaker_transitions(&self) -> u64 {
        self.transitions
    }
}

fn provider_config(config: &RotatorConfig) -> ChaosResult<&ProviderConfig> {
    config
        .provider(CHAOS_PROVIDER)
        .ok_or_else(|| ChaosError::Setup("simulator provider missing".into()))
}
