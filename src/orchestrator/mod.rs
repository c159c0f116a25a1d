//! Rotation orchestrator.
//!
//! # Data Flow
//! ```text
//! run_attempt(location, provider)
//!     → settings (disabled?)         ─┐
//!     → credential (missing/invalid?) │ skip: no breaker/backoff effect,
//!     → breaker check (open?)         │ no run record
//!     → backoff gate (backoff/paused?)┘
//!     → decrypt             ── fail → invalid_credentials, mark invalid
//!     → exchange_token + verify_identity (deadline)
//!                           ── fail → classify, 401/403 mark invalid
//!     → RotationEngine::rotate(rotation_id)  → rotated | idempotent
//!     → breaker record_*, backoff apply_outcome, run record, alerts
//! ```
//!
//! # Design Decisions
//! - Attempt failures become outcomes; only store and key-access failures
//!   escape as [`AttemptError`]
//! - A half-open probe claimed by the breaker check is handed back if a
//!   later gate skips the attempt
//! - Idempotent hits count as success for breaker and backoff but are
//!   tallied apart from new work

pub mod outcome;
pub mod scheduler;
pub mod status;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::alerts::{Alert, Notifier, Severity};
use crate::clock::{span, Clock};
use crate::config::{RetryAfterFallback, RotatorConfig, SettingsCache};
use crate::envelope::{EnvelopeError, KeyProvider, ProviderSecrets};
use crate::observability::metrics;
use crate::provider::{Identity, ProviderApi, ProviderError, ProviderRegistry, TokenGrant};
use crate::resilience::backoff::{gate, BackoffPolicy, Gate, SyncOutcome};
use crate::resilience::circuit_breaker::{BreakerTransition, CircuitBreaker};
use crate::resilience::retries::rate_limit_delay;
use crate::resilience::timeouts::{deadline, provider_call, store_call};
use crate::resilience::ErrorClass;
use crate::rotation::{RotationEngine, RotationId, RotationRequest, RotationResult};
use crate::store::{
    BreakerScope, CredentialKey, CredentialRecord, CredentialStatus, CredentialStore, RunKind,
    RunRecord, StoreResult, SyncStatus,
};

pub use outcome::{
    AttemptError, AttemptOutcome, AttemptResult, AttemptStatus, AttemptTally, SkipReason,
    TallySnapshot, INVALID_CREDENTIALS,
};
pub use scheduler::RotationScheduler;
pub use status::{KeyStatus, StatusReport};

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct AttemptOptions {
    /// Reuse an idempotency key, e.g. for a duplicated timer fire.
    pub rotation_id: Option<RotationId>,
    pub kind: Option<RunKind>,
}

/// Tunables the orchestrator reads on every attempt.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub backoff: BackoffPolicy,
    pub rate_limit_fallback: RetryAfterFallback,
    pub provider_request_timeout: Duration,
    pub attempt_timeout: Duration,
    pub store_timeout: Duration,
    pub failure_alert_threshold: u32,
}

impl From<&RotatorConfig> for OrchestratorSettings {
    fn from(config: &RotatorConfig) -> Self {
        Self {
            backoff: BackoffPolicy::from(&config.backoff),
            rate_limit_fallback: config.rate_limit.fallback.clone(),
            provider_request_timeout: Duration::from_secs(config.timeouts.provider_request_secs),
            attempt_timeout: Duration::from_secs(config.timeouts.attempt_secs),
            store_timeout: Duration::from_secs(config.timeouts.store_secs),
            failure_alert_threshold: config.alerts.failure_alert_threshold,
        }
    }
}

/// Collaborators an orchestrator is wired from.
pub struct OrchestratorParts {
    pub store: Arc<dyn CredentialStore>,
    pub keys: Arc<dyn KeyProvider>,
    pub providers: ProviderRegistry,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

/// Context shared by every step of one attempt.
struct Attempt {
    key: CredentialKey,
    scopes: Vec<BreakerScope>,
    /// Scopes whose half-open probe this attempt holds.
    probes: Vec<BreakerScope>,
    rotation_id: RotationId,
    kind: RunKind,
    started_at: DateTime<Utc>,
    attempt_number: u32,
    alerts_enabled: bool,
}

impl Attempt {
    fn holds_probe(&self, scope: &BreakerScope) -> bool {
        self.probes.contains(scope)
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn CredentialStore>,
    engine: RotationEngine,
    breaker: CircuitBreaker,
    providers: ProviderRegistry,
    notifier: Arc<dyn Notifier>,
    settings_cache: SettingsCache,
    clock: Arc<dyn Clock>,
    settings: OrchestratorSettings,
    tally: Arc<AttemptTally>,
}

impl Orchestrator {
    pub fn new(config: &RotatorConfig, parts: OrchestratorParts) -> Self {
        let OrchestratorParts {
            store,
            keys,
            providers,
            notifier,
            clock,
        } = parts;

        Self {
            engine: RotationEngine::new(store.clone(), keys, clock.clone()),
            breaker: CircuitBreaker::new(store.clone(), clock.clone(), config.breaker.clone()),
            settings_cache: SettingsCache::new(
                store.clone(),
                clock.clone(),
                Duration::from_secs(config.settings_cache.ttl_secs),
            ),
            settings: OrchestratorSettings::from(config),
            tally: Arc::new(AttemptTally::default()),
            store,
            providers,
            notifier,
            clock,
        }
    }

    pub fn engine(&self) -> &RotationEngine {
        &self.engine
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn settings_cache(&self) -> &SettingsCache {
        &self.settings_cache
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn tally(&self) -> TallySnapshot {
        self.tally.snapshot()
    }

    /// `runAttempt(location, provider)` with a fresh rotation id.
    pub async fn run_attempt(&self, location: &str, provider: &str) -> AttemptResult<AttemptOutcome> {
        self.run_attempt_with(location, provider, AttemptOptions::default()).await
    }

    pub async fn run_attempt_with(
        &self,
        location: &str,
        provider: &str,
        options: AttemptOptions,
    ) -> AttemptResult<AttemptOutcome> {
        let started = Instant::now();
        let result = self.attempt(location, provider, options).await;

        match &result {
            Ok(outcome) => {
                self.tally.record(outcome.status);
                metrics::record_attempt(provider, outcome.status.as_str(), outcome.reason_label());
                if outcome.status == AttemptStatus::Idempotent {
                    metrics::record_idempotent_hit(provider);
                }
            }
            Err(e) => {
                tracing::error!(location, provider, error = %e, "Attempt aborted");
                metrics::record_attempt(provider, "error", "infrastructure");
            }
        }
        metrics::record_attempt_duration(provider, started);
        result
    }

    async fn store_op<T, F>(&self, operation: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        store_call(operation, self.settings.store_timeout, fut).await
    }

    async fn attempt(
        &self,
        location: &str,
        provider: &str,
        options: AttemptOptions,
    ) -> AttemptResult<AttemptOutcome> {
        let api = self
            .providers
            .get(provider)
            .map_err(|_| AttemptError::UnknownProvider(provider.to_string()))?;
        let key = CredentialKey::new(location, provider);

        let location_settings = self
            .store_op("load_location_settings", self.settings_cache.get(location))
            .await?;
        if !location_settings.rotation_enabled {
            return Ok(self.skip(&key, SkipReason::Disabled, None));
        }

        let Some(record) = self.store_op("load_credential", self.store.load_credential(&key)).await? else {
            return Ok(self.skip(&key, SkipReason::NotConnected, None));
        };
        if record.status == CredentialStatus::Invalid {
            return Ok(self.skip(&key, SkipReason::CredentialsInvalid, None));
        }

        let scopes = self.breaker.scopes(provider, location);
        let mut probes = Vec::new();
        for scope in &scopes {
            let decision = self.store_op("breaker_check", self.breaker.check(scope)).await?;
            if decision.is_probe {
                probes.push(scope.clone());
            }
            if !decision.allowed {
                self.release_probes(&probes).await;
                return Ok(self.skip(&key, SkipReason::CircuitOpen, None));
            }
        }

        let sync = self.store_op("load_sync_status", self.store.load_sync_status(&key)).await?;
        match gate(sync.as_ref(), self.clock.now()) {
            Gate::Open => {}
            Gate::Backoff { until } => {
                self.release_probes(&probes).await;
                return Ok(self.skip(&key, SkipReason::Backoff, Some(until)));
            }
            Gate::Paused { until } => {
                self.release_probes(&probes).await;
                return Ok(self.skip(&key, SkipReason::Paused, Some(until)));
            }
        }

        let attempt = Attempt {
            key,
            scopes,
            probes,
            rotation_id: options.rotation_id.unwrap_or_default(),
            kind: options.kind.unwrap_or(RunKind::Rotation),
            started_at: self.clock.now(),
            attempt_number: sync.map(|s| s.consecutive_failures).unwrap_or(0) + 1,
            alerts_enabled: location_settings.alerts_enabled,
        };

        tracing::debug!(
            location,
            provider,
            rotation_id = %attempt.rotation_id,
            attempt = attempt.attempt_number,
            probe = !attempt.probes.is_empty(),
            "Attempt starting"
        );

        let secrets = match self.engine.open(&record) {
            Ok(secrets) => secrets,
            Err(EnvelopeError::KeyUnavailable(reason)) => {
                self.release_probes(&attempt.probes).await;
                return Err(AttemptError::KeyUnavailable(reason));
            }
            Err(_) => {
                self.store_op("invalidate", self.engine.invalidate(&attempt.key, INVALID_CREDENTIALS))
                    .await?;
                return self
                    .fail(&attempt, ErrorClass::CiphertextInvalid, INVALID_CREDENTIALS, None)
                    .await;
            }
        };

        match self.call_provider(api.as_ref(), &secrets).await {
            Ok((grant, identity)) => self.succeed(&attempt, &record, &secrets, &grant, &identity).await,
            Err(err) => {
                let class = err.class();
                if class.invalidates_credentials() {
                    self.store_op("invalidate", self.engine.invalidate(&attempt.key, class.as_str()))
                        .await?;
                }
                let retry_after = (class == ErrorClass::RateLimited)
                    .then(|| rate_limit_delay(err.retry_after(), &self.settings.rate_limit_fallback))
                    .flatten();
                self.fail(&attempt, class, class.as_str(), retry_after).await
            }
        }
    }

    /// Token exchange plus identity check, under the attempt deadline.
    async fn call_provider(
        &self,
        api: &dyn ProviderApi,
        secrets: &ProviderSecrets,
    ) -> Result<(TokenGrant, Identity), ProviderError> {
        let per_call = self.settings.provider_request_timeout;
        let call = async {
            let grant = provider_call("exchange_token", per_call, api.exchange_token(secrets)).await?;
            let identity = provider_call("verify_identity", per_call, api.verify_identity(&grant.token)).await?;
            Ok::<_, ProviderError>((grant, identity))
        };
        match deadline("attempt", self.settings.attempt_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        }
    }

    async fn succeed(
        &self,
        attempt: &Attempt,
        record: &CredentialRecord,
        secrets: &ProviderSecrets,
        grant: &TokenGrant,
        identity: &Identity,
    ) -> AttemptResult<AttemptOutcome> {
        let rotated = secrets.rotated(&grant.token);
        let masked_hints = rotated.masked_hints();
        let ciphertext = self
            .engine
            .seal(&rotated)
            .map_err(|e| AttemptError::KeyUnavailable(e.to_string()))?;
        let now = self.clock.now();
        let expires_at = grant
            .expires_in
            .map(|secs| now + span(Duration::from_secs(secs)))
            .or(record.expires_at);

        let receipt = self
            .store_op(
                "rotate",
                self.engine.rotate(RotationRequest {
                    key: attempt.key.clone(),
                    rotation_id: attempt.rotation_id,
                    ciphertext,
                    masked_hints: masked_hints.clone(),
                    expires_at,
                }),
            )
            .await?;

        for scope in &attempt.scopes {
            let held = attempt.holds_probe(scope);
            self.store_op("breaker_success", self.breaker.record_success(scope, held))
                .await?;
        }
        self.store_op(
            "apply_sync_outcome",
            self.store.apply_sync_outcome(
                &attempt.key,
                &SyncOutcome::Success { items: 1 },
                &self.settings.backoff,
                self.clock.now(),
            ),
        )
        .await?;

        let status = match receipt.result {
            RotationResult::Rotated => AttemptStatus::Rotated,
            RotationResult::Idempotent => AttemptStatus::Idempotent,
        };
        let run_id = self
            .append_run(
                attempt,
                true,
                status,
                None,
                u32::from(status == AttemptStatus::Rotated),
                masked_hints.token_fingerprint.clone(),
            )
            .await?;

        tracing::info!(
            location = %attempt.key.location,
            provider = %attempt.key.provider,
            rotation_id = %attempt.rotation_id,
            result = receipt.result.as_str(),
            fingerprint = masked_hints.token_fingerprint.as_deref().unwrap_or("-"),
            identity = %identity.id,
            "Attempt succeeded"
        );

        Ok(AttemptOutcome {
            status,
            reason: None,
            rotation_id: Some(attempt.rotation_id),
            error_class: None,
            next_attempt_at: None,
            run_id: Some(run_id),
            skip: None,
        })
    }

    async fn fail(
        &self,
        attempt: &Attempt,
        class: ErrorClass,
        reason: &str,
        retry_after: Option<Duration>,
    ) -> AttemptResult<AttemptOutcome> {
        let mut transitions = Vec::with_capacity(attempt.scopes.len());
        for scope in &attempt.scopes {
            let held = attempt.holds_probe(scope);
            let transition = self
                .store_op("breaker_failure", self.breaker.record_failure(scope, held))
                .await?;
            transitions.push(transition);
        }

        let sync = self
            .store_op(
                "apply_sync_outcome",
                self.store.apply_sync_outcome(
                    &attempt.key,
                    &SyncOutcome::Failure {
                        error_class: class.as_str().to_string(),
                        retry_after,
                        jitter: self.settings.backoff.draw_jitter(),
                    },
                    &self.settings.backoff,
                    self.clock.now(),
                ),
            )
            .await?;

        let run_id = self
            .append_run(attempt, false, AttemptStatus::Failed, Some(class), 0, None)
            .await?;

        tracing::warn!(
            location = %attempt.key.location,
            provider = %attempt.key.provider,
            rotation_id = %attempt.rotation_id,
            error_class = class.as_str(),
            consecutive_failures = sync.consecutive_failures,
            next_attempt_at = ?sync.next_attempt_at,
            paused_until = ?sync.paused_until,
            "Attempt failed"
        );

        if attempt.alerts_enabled {
            self.raise_alerts(attempt, class, &transitions, &sync).await;
        }

        Ok(AttemptOutcome {
            status: AttemptStatus::Failed,
            reason: Some(reason.to_string()),
            rotation_id: Some(attempt.rotation_id),
            error_class: Some(class),
            next_attempt_at: sync.next_attempt_at,
            run_id: Some(run_id),
            skip: None,
        })
    }

    async fn raise_alerts(
        &self,
        attempt: &Attempt,
        class: ErrorClass,
        transitions: &[BreakerTransition],
        sync: &SyncStatus,
    ) {
        for t in transitions.iter().filter(|t| t.opened()) {
            let alert = Alert::new(
                Severity::Critical,
                format!("breaker_open:{}", t.row.scope),
                "Circuit breaker opened",
                format!(
                    "{} calls are being skipped after {} consecutive failures",
                    t.row.scope, t.row.failure_count
                ),
            )
            .with("provider", &attempt.key.provider)
            .with("location", &attempt.key.location)
            .with("error_class", class);
            self.notifier.notify(&alert).await;
        }

        if sync.consecutive_failures >= self.settings.backoff.pause_after {
            if let Some(until) = sync.paused_until {
                let alert = Alert::new(
                    Severity::Critical,
                    format!("paused:{}", attempt.key),
                    "Rotation paused",
                    format!("{} paused until {}", attempt.key, until.to_rfc3339()),
                )
                .with("consecutive_failures", sync.consecutive_failures)
                .with("error_class", class);
                self.notifier.notify(&alert).await;
            }
        } else if sync.consecutive_failures >= self.settings.failure_alert_threshold {
            let alert = Alert::new(
                Severity::Warning,
                format!("rotation_failures:{}", attempt.key),
                "Repeated rotation failures",
                format!(
                    "{} failed {} times in a row",
                    attempt.key, sync.consecutive_failures
                ),
            )
            .with("error_class", class);
            self.notifier.notify(&alert).await;
        }
    }

    async fn append_run(
        &self,
        attempt: &Attempt,
        ok: bool,
        status: AttemptStatus,
        error: Option<ErrorClass>,
        items: u32,
        token_fingerprint: Option<String>,
    ) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        self.store_op(
            "append_run",
            self.store.append_run(RunRecord {
                id,
                key: attempt.key.clone(),
                kind: attempt.kind,
                started_at: attempt.started_at,
                finished_at: self.clock.now(),
                ok,
                items,
                status: status.as_str().to_string(),
                error: error.map(|c| c.as_str().to_string()),
                attempt: attempt.attempt_number,
                rotation_id: Some(attempt.rotation_id),
                token_fingerprint,
            }),
        )
        .await?;
        Ok(id)
    }

    async fn release_probes(&self, probes: &[BreakerScope]) {
        for scope in probes {
            if let Err(e) = self.store_op("release_probe", self.breaker.release_probe(scope)).await {
                tracing::warn!(scope = %scope, error = %e, "Failed to release breaker probe");
            }
        }
    }

    fn skip(&self, key: &CredentialKey, reason: SkipReason, until: Option<DateTime<Utc>>) -> AttemptOutcome {
        tracing::debug!(
            location = %key.location,
            provider = %key.provider,
            reason = reason.as_str(),
            until = ?until,
            "Attempt skipped"
        );
        AttemptOutcome::skipped(reason, until)
    }
}
