//! Circuit breaker for provider protection.
//!
//! # States
//! - Closed: normal operation, calls pass through, failures accumulate
//! - Open: provider assumed down, calls are skipped without a network attempt
//! - Half-Open: exactly one probe call is allowed
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= threshold
//! Open → Half-Open: cool-down elapsed since opened_at (claimed by the next check)
//! Half-Open → Closed: probe succeeds, failure_count resets
//! Half-Open → Open: probe fails, opened_at resets to now
//! ```
//!
//! Only the caller holding the probe moves a half-open breaker. Results of
//! calls admitted before the breaker opened are ignored while half-open.
//!
//! # Design Decisions
//! - One breaker per provider, optionally one more per (provider, location)
//! - State lives in the store; [`transition`] is applied by the store inside a
//!   single conditional write, so concurrent callers never lose an update
//! - A probe that never reports back is considered abandoned after one more
//!   cool-down and the slot is handed to the next caller

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::{span, Clock};
use crate::config::BreakerConfig;
use crate::observability::metrics;
use crate::store::{BreakerRow, BreakerScope, BreakerState, CredentialStore, StoreResult};

/// Thresholds applied to one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub threshold: u32,
    pub cool_down: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            threshold: 10,
            cool_down: Duration::from_secs(60),
        }
    }
}

/// Side effects fed into the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// Ask whether a call may proceed. May claim the half-open probe.
    Check,
    Success,
    Failure,
    /// Result of the call that claimed the half-open probe.
    ProbeSuccess,
    ProbeFailure,
    /// Give back a probe slot that was claimed but never used.
    ReleaseProbe,
}

/// Answer to a [`BreakerEvent::Check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerDecision {
    pub state: BreakerState,
    pub allowed: bool,
    pub is_probe: bool,
}

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerTransition {
    pub before: BreakerState,
    pub row: BreakerRow,
    pub decision: BreakerDecision,
}

impl BreakerTransition {
    pub fn changed(&self) -> bool {
        self.before != self.row.state
    }

    pub fn opened(&self) -> bool {
        self.before != BreakerState::Open && self.row.state == BreakerState::Open
    }
}

fn elapsed_at_least(since: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    match since {
        Some(at) => now - at >= span(window),
        None => true,
    }
}

/// Pure state machine step. Stores call this while holding the row.
pub fn transition(
    current: &BreakerRow,
    event: BreakerEvent,
    policy: &BreakerPolicy,
    now: DateTime<Utc>,
) -> BreakerTransition {
    let before = current.state;
    let mut row = current.clone();
    let mut allowed = row.state != BreakerState::Open;
    let mut is_probe = false;

    match (event, row.state) {
        (BreakerEvent::Check, BreakerState::Closed) => {}
        (BreakerEvent::Check, BreakerState::Open) => {
            if elapsed_at_least(row.opened_at, now, policy.cool_down) {
                row.state = BreakerState::HalfOpen;
                row.probe_started_at = Some(now);
                allowed = true;
                is_probe = true;
            }
        }
        (BreakerEvent::Check, BreakerState::HalfOpen) => {
            if elapsed_at_least(row.probe_started_at, now, policy.cool_down) {
                row.probe_started_at = Some(now);
                is_probe = true;
            } else {
                allowed = false;
            }
        }
        (BreakerEvent::Success | BreakerEvent::ProbeSuccess, BreakerState::Closed) => {
            row.failure_count = 0;
        }
        (BreakerEvent::ProbeSuccess, BreakerState::HalfOpen) => {
            row.state = BreakerState::Closed;
            row.failure_count = 0;
            row.opened_at = None;
            row.probe_started_at = None;
            allowed = true;
        }
        // A call that started before the breaker opened. Recovery only
        // happens through a probe.
        (BreakerEvent::Success | BreakerEvent::ProbeSuccess, BreakerState::Open) => {}
        (BreakerEvent::Success | BreakerEvent::Failure, BreakerState::HalfOpen) => {}
        (BreakerEvent::Failure | BreakerEvent::ProbeFailure, BreakerState::Closed) => {
            row.failure_count = row.failure_count.saturating_add(1);
            if row.failure_count >= policy.threshold {
                row.state = BreakerState::Open;
                row.opened_at = Some(now);
                allowed = false;
            }
        }
        (BreakerEvent::ProbeFailure, BreakerState::HalfOpen) => {
            row.failure_count = row.failure_count.saturating_add(1);
            row.state = BreakerState::Open;
            row.opened_at = Some(now);
            row.probe_started_at = None;
            allowed = false;
        }
        (BreakerEvent::Failure | BreakerEvent::ProbeFailure, BreakerState::Open) => {
            row.failure_count = row.failure_count.saturating_add(1);
        }
        (BreakerEvent::ReleaseProbe, BreakerState::HalfOpen) => {
            row.probe_started_at = None;
        }
        (BreakerEvent::ReleaseProbe, _) => {}
    }

    if row != *current {
        row.updated_at = now;
    }

    BreakerTransition {
        before,
        decision: BreakerDecision {
            state: row.state,
            allowed,
            is_probe,
        },
        row,
    }
}

/// Store-backed breaker front end.
#[derive(Clone)]
pub struct CircuitBreaker {
    store: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn CredentialStore>, clock: Arc<dyn Clock>, config: BreakerConfig) -> Self {
        Self { store, clock, config }
    }

    /// Effective policy for a provider, after per-provider overrides.
    pub fn policy_for(&self, provider: &str) -> BreakerPolicy {
        let mut policy = BreakerPolicy {
            threshold: self.config.threshold,
            cool_down: Duration::from_secs(self.config.cool_down_secs),
        };
        if let Some(o) = self.config.overrides.get(provider) {
            if let Some(threshold) = o.threshold {
                policy.threshold = threshold;
            }
            if let Some(secs) = o.cool_down_secs {
                policy.cool_down = Duration::from_secs(secs);
            }
        }
        policy
    }

    /// Scopes consulted for a key, widest first.
    pub fn scopes(&self, provider: &str, location: &str) -> Vec<BreakerScope> {
        let mut scopes = vec![BreakerScope::provider(provider)];
        if self.config.per_location {
            scopes.push(BreakerScope::location(provider, location));
        }
        scopes
    }

    /// `check(provider, location?)`.
    pub async fn check(&self, scope: &BreakerScope) -> StoreResult<BreakerDecision> {
        Ok(self.apply(scope, BreakerEvent::Check).await?.decision)
    }

    /// `probe` is the `is_probe` flag the caller got from [`check`](Self::check).
    pub async fn record_success(&self, scope: &BreakerScope, probe: bool) -> StoreResult<BreakerTransition> {
        let event = if probe { BreakerEvent::ProbeSuccess } else { BreakerEvent::Success };
        self.apply(scope, event).await
    }

    pub async fn record_failure(&self, scope: &BreakerScope, probe: bool) -> StoreResult<BreakerTransition> {
        let event = if probe { BreakerEvent::ProbeFailure } else { BreakerEvent::Failure };
        self.apply(scope, event).await
    }

    pub async fn release_probe(&self, scope: &BreakerScope) -> StoreResult<()> {
        self.apply(scope, BreakerEvent::ReleaseProbe).await.map(|_| ())
    }

    pub async fn state(&self, scope: &BreakerScope) -> StoreResult<Option<BreakerRow>> {
        self.store.load_breaker(scope).await
    }

    async fn apply(&self, scope: &BreakerScope, event: BreakerEvent) -> StoreResult<BreakerTransition> {
        let policy = self.policy_for(&scope.provider);
        let transition = self
            .store
            .apply_breaker_event(scope, event, &policy, self.clock.now())
            .await?;

        if transition.changed() {
            tracing::info!(
                scope = %scope,
                from = %transition.before,
                to = %transition.row.state,
                failure_count = transition.row.failure_count,
                "Circuit breaker transition"
            );
            metrics::record_breaker_transition(&scope.provider, transition.row.state.as_str());
        }
        Ok(transition)
    }
}
