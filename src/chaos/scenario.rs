//! Built-in fault scenarios.
//!
//! Every scenario drives the orchestrator against a [`FaultSimulator`] in a
//! fresh [`ChaosEnv`], then returns the violations it found and the traffic
//! counters it observed. Time between attempts is moved with the manual
//! clock, so backoff and cool-down windows cost nothing in wall time.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::chaos::env::{ChaosEnv, CHAOS_API_SECRET};
use crate::chaos::invariants::{self, Checks, Violation};
use crate::chaos::simulator::FaultMode;
use crate::chaos::{ChaosError, ChaosResult};
use crate::clock::{span, Clock};
use crate::config::{
    BackoffConfig, BreakerConfig, ChaosConfig, ProviderConfig, RotatorConfig, TimeoutConfig,
};
use crate::orchestrator::{AttemptOptions, AttemptOutcome, AttemptStatus, SkipReason};
use crate::rotation::RotationId;
use crate::store::{BreakerState, CredentialStore};

/// Slack allowed on top of the attempt deadline for scheduling jitter.
const TIMEOUT_SLACK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    ServerErrors,
    RateLimited,
    Timeouts,
    DuplicateRotation,
    BreakerRecovery,
}

impl ScenarioId {
    pub const ALL: [ScenarioId; 5] = [
        Self::ServerErrors,
        Self::RateLimited,
        Self::Timeouts,
        Self::DuplicateRotation,
        Self::BreakerRecovery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerErrors => "server_errors",
            Self::RateLimited => "rate_limited",
            Self::Timeouts => "timeouts",
            Self::DuplicateRotation => "duplicate_rotation",
            Self::BreakerRecovery => "breaker_recovery",
        }
    }
}

impl fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScenarioId {
    type Err = ChaosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| ChaosError::UnknownScenario(s.to_string()))
    }
}

/// Knobs for one run. Anything omitted takes the scenario default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Attempts driven by the failure scenarios.
    pub attempts: u32,
    /// Concurrent callers in `duplicate_rotation`.
    pub concurrency: u32,
    /// Probability of a 500 in `server_errors`.
    pub error_rate: f64,
    pub retry_after_secs: Option<u64>,
    /// Simulator response delay in `timeouts`.
    pub delay_ms: u64,
    pub request_timeout_secs: u64,
    pub breaker_threshold: u32,
    pub cool_down_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            attempts: 12,
            concurrency: 100,
            error_rate: 1.0,
            retry_after_secs: Some(5),
            delay_ms: 1500,
            request_timeout_secs: 1,
            breaker_threshold: 10,
            cool_down_secs: 24 * 60 * 60,
            backoff_base_secs: 1,
            backoff_cap_secs: 1800,
        }
    }
}

impl ScenarioConfig {
    pub fn defaults_for(id: ScenarioId, chaos: &ChaosConfig) -> Self {
        let base = Self {
            attempts: chaos.default_attempts,
            concurrency: chaos.default_concurrency,
            ..Self::default()
        };
        match id {
            ScenarioId::Timeouts | ScenarioId::BreakerRecovery => Self {
                attempts: 4,
                breaker_threshold: 3,
                ..base
            },
            _ => base,
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1) * 3)
    }

    /// Service configuration for the isolated environment.
    pub fn rotator_config(&self, provider: ProviderConfig) -> RotatorConfig {
        let request_secs = self.request_timeout_secs.max(1);
        RotatorConfig {
            breaker: BreakerConfig {
                threshold: self.breaker_threshold.max(1),
                cool_down_secs: self.cool_down_secs,
                ..BreakerConfig::default()
            },
            backoff: BackoffConfig {
                base_secs: self.backoff_base_secs.max(1),
                cap_secs: self.backoff_cap_secs.max(1),
                // No auto-pause inside scenarios.
                pause_after_failures: u32::MAX,
                ..BackoffConfig::default()
            },
            timeouts: TimeoutConfig {
                connect_secs: request_secs,
                provider_request_secs: request_secs,
                attempt_secs: self.attempt_timeout().as_secs(),
                ..TimeoutConfig::default()
            },
            providers: vec![provider],
            ..RotatorConfig::default()
        }
    }
}

/// Traffic and outcome counters for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChaosMetrics {
    pub provider_requests: u64,
    pub errors_injected: u64,
    pub rate_limits_injected: u64,
    pub timeouts_injected: u64,
    pub successful_responses: u64,
    pub breaker_transitions: u64,
    pub rotated: u64,
    pub idempotent_hits: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl ChaosMetrics {
    fn collect(env: &ChaosEnv) -> Self {
        let sim = env.simulator.counters();
        let tally = env.orchestrator.tally();
        Self {
            provider_requests: sim.requests,
            errors_injected: sim.errors_injected,
            rate_limits_injected: sim.rate_limits_injected,
            timeouts_injected: sim.timeouts_injected,
            successful_responses: sim.successful_responses,
            breaker_transitions: env.breaker_transitions(),
            rotated: tally.rotated,
            idempotent_hits: tally.idempotent_hits,
            failed: tally.failed,
            skipped: tally.skipped,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub violations: Vec<Violation>,
    pub metrics: ChaosMetrics,
}

pub async fn run_scenario(id: ScenarioId, location: &str, config: &ScenarioConfig) -> ChaosResult<ScenarioReport> {
    let mode = match id {
        ScenarioId::ServerErrors | ScenarioId::BreakerRecovery => FaultMode::ServerError {
            rate: config.error_rate.clamp(0.0, 1.0),
        },
        ScenarioId::RateLimited => FaultMode::RateLimited {
            retry_after_secs: config.retry_after_secs,
        },
        ScenarioId::Timeouts => FaultMode::Timeout {
            delay_ms: config.delay_ms,
        },
        ScenarioId::DuplicateRotation => FaultMode::Healthy,
    };

    let mut env = ChaosEnv::build(location, config, mode).await?;
    let mut checks = Checks::new();
    let mut outcomes = Vec::new();

    match id {
        ScenarioId::ServerErrors => server_errors(&mut env, config, &mut checks, &mut outcomes).await?,
        ScenarioId::RateLimited => rate_limited(&mut env, config, &mut checks, &mut outcomes).await?,
        ScenarioId::Timeouts => timeouts(&mut env, config, &mut checks, &mut outcomes).await?,
        ScenarioId::DuplicateRotation => duplicate_rotation(&mut env, config, &mut checks, &mut outcomes).await?,
        ScenarioId::BreakerRecovery => breaker_recovery(&mut env, config, &mut checks, &mut outcomes).await?,
    }

    scan_for_leaks(&env, &outcomes, &mut checks).await?;

    let report = ScenarioReport {
        violations: checks.into_violations(),
        metrics: ChaosMetrics::collect(&env),
    };
    env.simulator.stop().await;
    Ok(report)
}

async fn attempt(env: &mut ChaosEnv, outcomes: &mut Vec<AttemptOutcome>) -> ChaosResult<AttemptOutcome> {
    let outcome = env
        .orchestrator
        .run_attempt(env.location(), &env.key.provider)
        .await?;
    env.observe_breaker().await?;
    outcomes.push(outcome.clone());
    Ok(outcome)
}

/// Fail until the breaker opens. Returns the failure count at which it did.
async fn fail_until_open(
    env: &mut ChaosEnv,
    config: &ScenarioConfig,
    outcomes: &mut Vec<AttemptOutcome>,
) -> ChaosResult<Option<u32>> {
    let mut failures = 0;
    for _ in 0..config.attempts.max(config.breaker_threshold) {
        env.advance_past_gates().await?;
        let outcome = attempt(env, outcomes).await?;
        if outcome.status == AttemptStatus::Failed {
            failures += 1;
        }
        if env.observe_breaker().await? == BreakerState::Open {
            return Ok(Some(failures));
        }
    }
    Ok(None)
}

async fn server_errors(
    env: &mut ChaosEnv,
    config: &ScenarioConfig,
    checks: &mut Checks,
    outcomes: &mut Vec<AttemptOutcome>,
) -> ChaosResult<()> {
    let opened_after = fail_until_open(env, config, outcomes).await?;
    invariants::circuit_opens_within(checks, config.breaker_threshold, opened_after);
    if opened_after.is_none() {
        return Ok(());
    }

    let remaining = config.attempts.saturating_sub(outcomes.len() as u32).max(1);
    for _ in 0..remaining {
        env.advance_past_gates().await?;
        let before = env.simulator.counters().requests;
        let outcome = attempt(env, outcomes).await?;
        let after = env.simulator.counters().requests;
        invariants::short_circuit_made_no_call(checks, &outcome, before, after);
    }
    Ok(())
}

async fn rate_limited(
    env: &mut ChaosEnv,
    config: &ScenarioConfig,
    checks: &mut Checks,
    outcomes: &mut Vec<AttemptOutcome>,
) -> ChaosResult<()> {
    let failed_at = env.clock.now();
    let first = attempt(env, outcomes).await?;
    checks.check(
        invariants::RETRY_AFTER_HONORED,
        first.status == AttemptStatus::Failed,
        || format!("rate-limited attempt ended {}", first.status.as_str()),
    );

    let Some(retry_after) = config.retry_after_secs.map(Duration::from_secs) else {
        // No header: only require that some delay was scheduled.
        checks.check(invariants::RETRY_AFTER_HONORED, first.next_attempt_at.is_some(), || {
            "no retry scheduled after a 429".to_string()
        });
        return Ok(());
    };
    invariants::retry_after_honored(checks, first.next_attempt_at, failed_at, retry_after);

    // Retry well inside the window: must be gated without touching the provider.
    env.clock.advance(span(retry_after / 2));
    let before = env.simulator.counters().requests;
    let early = attempt(env, outcomes).await?;
    checks.check(
        invariants::EARLY_RETRY_SKIPPED,
        early.skip_reason() == Some(SkipReason::Backoff) && env.simulator.counters().requests == before,
        || format!("early retry ended {} ({:?})", early.status.as_str(), early.reason),
    );

    env.simulator.set_mode(FaultMode::Healthy);
    env.advance_past_gates().await?;
    let recovered = attempt(env, outcomes).await?;
    checks.check(
        invariants::RECOVERS_AFTER_FAULT,
        recovered.status == AttemptStatus::Rotated,
        || format!("attempt after the window ended {}", recovered.status.as_str()),
    );
    Ok(())
}

async fn timeouts(
    env: &mut ChaosEnv,
    config: &ScenarioConfig,
    checks: &mut Checks,
    outcomes: &mut Vec<AttemptOutcome>,
) -> ChaosResult<()> {
    let limit = config.attempt_timeout();
    let mut failures = 0;
    let mut opened_after = None;

    for _ in 0..config.attempts.max(1) {
        env.advance_past_gates().await?;
        let started = Instant::now();
        let outcome = attempt(env, outcomes).await?;
        if outcome.status == AttemptStatus::Skipped {
            continue;
        }
        invariants::attempt_within_timeout(checks, started.elapsed(), limit, TIMEOUT_SLACK);
        if outcome.status == AttemptStatus::Failed {
            failures += 1;
        }
        if opened_after.is_none() && env.observe_breaker().await? == BreakerState::Open {
            opened_after = Some(failures);
        }
    }

    invariants::circuit_opens_within(checks, config.breaker_threshold, opened_after);
    Ok(())
}

async fn duplicate_rotation(
    env: &mut ChaosEnv,
    config: &ScenarioConfig,
    checks: &mut Checks,
    outcomes: &mut Vec<AttemptOutcome>,
) -> ChaosResult<()> {
    let rotation_id = RotationId::new();
    let callers = (0..config.concurrency.max(1)).map(|_| {
        let orchestrator = env.orchestrator.clone();
        let key = env.key.clone();
        tokio::spawn(async move {
            orchestrator
                .run_attempt_with(
                    &key.location,
                    &key.provider,
                    AttemptOptions {
                        rotation_id: Some(rotation_id),
                        kind: None,
                    },
                )
                .await
        })
    });

    for joined in join_all(callers).await {
        let outcome = joined.map_err(|e| ChaosError::Setup(format!("attempt task: {e}")))??;
        outcomes.push(outcome);
    }
    env.observe_breaker().await?;

    invariants::single_effective_rotation(checks, outcomes);
    let record = env.store.load_credential(&env.key).await?;
    let runs = env.store.runs_for(&env.key).await?;
    invariants::stored_matches_winner(checks, record.as_ref(), &runs);
    Ok(())
}

async fn breaker_recovery(
    env: &mut ChaosEnv,
    config: &ScenarioConfig,
    checks: &mut Checks,
    outcomes: &mut Vec<AttemptOutcome>,
) -> ChaosResult<()> {
    let opened_after = fail_until_open(env, config, outcomes).await?;
    invariants::circuit_opens_within(checks, config.breaker_threshold, opened_after);
    if opened_after.is_none() {
        return Ok(());
    }

    env.clock.advance(span(Duration::from_secs(config.cool_down_secs)));
    env.advance_past_gates().await?;

    // Exactly one caller gets the half-open probe.
    let breaker = env.orchestrator.breaker().clone();
    let scope = env.scope();
    let first = breaker.check(&scope).await?;
    let second = breaker.check(&scope).await?;
    checks.check(
        invariants::SINGLE_HALF_OPEN_PROBE,
        first.allowed && first.is_probe && !second.allowed,
        || format!("first check {first:?}, second check {second:?}"),
    );
    if first.is_probe {
        breaker.release_probe(&scope).await?;
    }
    env.observe_breaker().await?;

    env.simulator.set_mode(FaultMode::Healthy);
    let probe = attempt(env, outcomes).await?;
    let state = env.observe_breaker().await?;
    checks.check(
        invariants::RECOVERS_AFTER_FAULT,
        probe.status == AttemptStatus::Rotated && state == BreakerState::Closed,
        || format!("probe ended {}, breaker {}", probe.status.as_str(), state.as_str()),
    );
    Ok(())
}

/// Everything the service persisted or emitted, serialized.
async fn scan_for_leaks(env: &ChaosEnv, outcomes: &[AttemptOutcome], checks: &mut Checks) -> ChaosResult<()> {
    let store = &env.store;
    let mut haystacks = Vec::new();
    let mut push = |value: serde_json::Result<String>| {
        if let Ok(json) = value {
            haystacks.push(json);
        }
    };

    push(serde_json::to_string(&store.runs_for(&env.key).await?));
    push(serde_json::to_string(&store.rotation_audit(&env.key).await?));
    push(serde_json::to_string(&store.load_sync_status(&env.key).await?));
    push(serde_json::to_string(
        &store.load_credential(&env.key).await?.map(|r| r.view()),
    ));
    push(serde_json::to_string(&env.alerts.alerts()));
    push(serde_json::to_string(outcomes));

    let mut secrets = env.simulator.issued_tokens();
    secrets.push(CHAOS_API_SECRET.to_string());
    invariants::no_secret_leak(checks, &secrets, &haystacks);
    Ok(())
}
