//! Properties a scenario asserts, each reported as a named violation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::span;
use crate::orchestrator::{AttemptOutcome, AttemptStatus};
use crate::store::{CredentialRecord, RunRecord};

pub const CIRCUIT_OPENS_WITHIN_THRESHOLD: &str = "circuit_opens_within_threshold";
pub const OPEN_CIRCUIT_MAKES_NO_CALL: &str = "open_circuit_makes_no_call";
pub const ATTEMPT_WITHIN_TIMEOUT: &str = "attempt_within_timeout";
pub const NO_DOUBLE_APPLY: &str = "no_double_apply";
pub const STORED_MATCHES_WINNER: &str = "stored_ciphertext_matches_winner";
pub const RETRY_AFTER_HONORED: &str = "retry_after_honored";
pub const EARLY_RETRY_SKIPPED: &str = "early_retry_skipped";
pub const SINGLE_HALF_OPEN_PROBE: &str = "single_half_open_probe";
pub const RECOVERS_AFTER_FAULT: &str = "recovers_after_fault";
pub const NO_SECRET_LEAK: &str = "no_secret_leak";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub invariant: String,
    pub detail: String,
}

/// Accumulates violations for one run.
#[derive(Debug, Default)]
pub struct Checks {
    violations: Vec<Violation>,
}

impl Checks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, invariant: &str, holds: bool, detail: impl FnOnce() -> String) {
        if !holds {
            let detail = detail();
            tracing::warn!(invariant, %detail, "Chaos invariant violated");
            self.violations.push(Violation {
                invariant: invariant.to_string(),
                detail,
            });
        }
    }

    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn into_violations(self) -> Vec<Violation> {
        self.violations
    }
}

/// `opened_after` is the failure count at which the breaker was first seen open.
pub fn circuit_opens_within(checks: &mut Checks, threshold: u32, opened_after: Option<u32>) {
    checks.check(
        CIRCUIT_OPENS_WITHIN_THRESHOLD,
        opened_after.is_some_and(|n| n <= threshold),
        || match opened_after {
            Some(n) => format!("breaker opened after {n} failures, threshold {threshold}"),
            None => format!("breaker never opened within {threshold} failures"),
        },
    );
}

pub fn short_circuit_made_no_call(checks: &mut Checks, outcome: &AttemptOutcome, requests_before: u64, requests_after: u64) {
    checks.check(
        OPEN_CIRCUIT_MAKES_NO_CALL,
        outcome.status == AttemptStatus::Skipped && requests_after == requests_before,
        || {
            format!(
                "attempt after opening was {} with {} provider requests",
                outcome.status.as_str(),
                requests_after - requests_before
            )
        },
    );
}

pub fn attempt_within_timeout(checks: &mut Checks, elapsed: Duration, limit: Duration, slack: Duration) {
    checks.check(ATTEMPT_WITHIN_TIMEOUT, elapsed <= limit + slack, || {
        format!("attempt took {}ms, limit {}ms", elapsed.as_millis(), limit.as_millis())
    });
}

/// Exactly one `rotated`, every other call `idempotent`.
pub fn single_effective_rotation(checks: &mut Checks, outcomes: &[AttemptOutcome]) {
    let rotated = outcomes.iter().filter(|o| o.status == AttemptStatus::Rotated).count();
    let idempotent = outcomes.iter().filter(|o| o.status == AttemptStatus::Idempotent).count();
    checks.check(
        NO_DOUBLE_APPLY,
        rotated == 1 && rotated + idempotent == outcomes.len(),
        || {
            format!(
                "{rotated} rotated, {idempotent} idempotent, {} other of {}",
                outcomes.len() - rotated - idempotent,
                outcomes.len()
            )
        },
    );
}

/// The stored token fingerprint is the one the `rotated` run wrote.
pub fn stored_matches_winner(checks: &mut Checks, record: Option<&CredentialRecord>, runs: &[RunRecord]) {
    let winners: Vec<_> = runs
        .iter()
        .filter(|r| r.status == AttemptStatus::Rotated.as_str())
        .collect();
    let stored = record.and_then(|r| r.masked_hints.token_fingerprint.as_deref());
    let matches = match winners.as_slice() {
        [winner] => winner.token_fingerprint.as_deref() == stored && stored.is_some(),
        _ => false,
    };
    checks.check(STORED_MATCHES_WINNER, matches, || {
        format!(
            "{} rotated runs, stored fingerprint {}",
            winners.len(),
            stored.unwrap_or("none")
        )
    });
}

pub fn retry_after_honored(
    checks: &mut Checks,
    next_attempt_at: Option<DateTime<Utc>>,
    failed_at: DateTime<Utc>,
    retry_after: Duration,
) {
    let earliest = failed_at + span(retry_after);
    checks.check(
        RETRY_AFTER_HONORED,
        next_attempt_at.is_some_and(|at| at >= earliest),
        || {
            format!(
                "next attempt {:?}, expected at or after {}",
                next_attempt_at.map(|t| t.to_rfc3339()),
                earliest.to_rfc3339()
            )
        },
    );
}

/// Raw secret values must not appear in anything the service persisted or emitted.
pub fn no_secret_leak(checks: &mut Checks, secrets: &[String], haystacks: &[String]) {
    let leaked = secrets
        .iter()
        .filter(|s| !s.is_empty())
        .filter(|s| haystacks.iter().any(|h| h.contains(s.as_str())))
        .count();
    checks.check(NO_SECRET_LEAK, leaked == 0, || {
        format!("{leaked} secret values found in persisted records or alerts")
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::SkipReason;

    fn outcome(status: AttemptStatus) -> AttemptOutcome {
        AttemptOutcome {
            status,
            reason: None,
            rotation_id: None,
            error_class: None,
            next_attempt_at: None,
            run_id: None,
            skip: None,
        }
    }

    #[test]
    fn test_double_apply_detected() {
        let mut checks = Checks::new();
        single_effective_rotation(
            &mut checks,
            &[outcome(AttemptStatus::Rotated), outcome(AttemptStatus::Idempotent)],
        );
        assert!(checks.is_clean());

        single_effective_rotation(
            &mut checks,
            &[outcome(AttemptStatus::Rotated), outcome(AttemptStatus::Rotated)],
        );
        let violations = checks.into_violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].invariant, NO_DOUBLE_APPLY);
    }

    #[test]
    fn test_breaker_threshold_check() {
        let mut checks = Checks::new();
        circuit_opens_within(&mut checks, 10, Some(10));
        assert!(checks.is_clean());
        circuit_opens_within(&mut checks, 10, None);
        circuit_opens_within(&mut checks, 10, Some(11));
        assert_eq!(checks.into_violations().len(), 2);
    }

    #[test]
    fn test_short_circuit_requires_skip_without_traffic() {
        let mut checks = Checks::new();
        let skipped = AttemptOutcome::skipped(SkipReason::CircuitOpen, None);
        short_circuit_made_no_call(&mut checks, &skipped, 20, 20);
        assert!(checks.is_clean());
        short_circuit_made_no_call(&mut checks, &skipped, 20, 21);
        assert!(!checks.is_clean());
    }

    #[test]
    fn test_leak_scan() {
        let mut checks = Checks::new();
        let secrets = vec!["sim_abcdef".to_string()];
        no_secret_leak(&mut checks, &secrets, &["{\"hint\":\"****cdef\"}".to_string()]);
        assert!(checks.is_clean());
        no_secret_leak(&mut checks, &secrets, &["token=sim_abcdef".to_string()]);
        assert!(!checks.is_clean());
    }
}
