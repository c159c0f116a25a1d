//! Exponential backoff with jitter and auto-pause.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::clock::span;
use crate::config::BackoffConfig;
use crate::store::SyncStatus;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub jitter_min: f64,
    pub jitter_max: f64,
    /// Consecutive failures that trigger an auto-pause.
    pub pause_after: u32,
    pub pause_for: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            cap: Duration::from_secs(1800),
            jitter_min: 0.9,
            jitter_max: 1.1,
            pause_after: 5,
            pause_for: Duration::from_secs(2 * 60 * 60),
        }
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            base: Duration::from_secs(config.base_secs),
            cap: Duration::from_secs(config.cap_secs),
            jitter_min: config.jitter_min,
            jitter_max: config.jitter_max,
            pause_after: config.pause_after_failures,
            pause_for: Duration::from_secs(config.pause_secs),
        }
    }
}

impl BackoffPolicy {
    /// Draw a jitter factor uniformly from `[jitter_min, jitter_max]`.
    pub fn draw_jitter(&self) -> f64 {
        if self.jitter_max <= self.jitter_min {
            return self.jitter_min;
        }
        rand::thread_rng().gen_range(self.jitter_min..=self.jitter_max)
    }
}

/// `min(base * 2^failures, cap) * jitter`, in seconds.
pub fn backoff_seconds_with_jitter(failures: u32, policy: &BackoffPolicy, jitter: f64) -> f64 {
    let base = policy.base.as_secs_f64();
    let cap = policy.cap.as_secs_f64();
    let exponential = 2f64.powi(failures.min(i32::MAX as u32) as i32);
    (base * exponential).min(cap) * jitter
}

/// `computeBackoffSeconds(failures)` with a freshly drawn jitter factor.
pub fn compute_backoff_seconds(failures: u32, policy: &BackoffPolicy) -> f64 {
    backoff_seconds_with_jitter(failures, policy, policy.draw_jitter())
}

/// Outcome of an attempt as seen by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Success {
        items: u32,
    },
    Failure {
        error_class: String,
        /// Provider-mandated delay (Retry-After) that replaces the computed backoff.
        retry_after: Option<Duration>,
        jitter: f64,
    },
}

/// Fold an attempt outcome into the sync status. Pure; the store applies it
/// atomically per key.
pub fn apply_outcome(
    current: &SyncStatus,
    outcome: &SyncOutcome,
    policy: &BackoffPolicy,
    now: DateTime<Utc>,
) -> SyncStatus {
    let mut next = current.clone();
    next.last_run_at = Some(now);

    match outcome {
        SyncOutcome::Success { .. } => {
            next.consecutive_failures = 0;
            next.last_error = None;
            next.last_success_at = Some(now);
            next.next_attempt_at = None;
            next.paused_until = None;
        }
        SyncOutcome::Failure {
            error_class,
            retry_after,
            jitter,
        } => {
            next.consecutive_failures = current.consecutive_failures.saturating_add(1);
            next.last_error = Some(error_class.clone());

            let delay = match retry_after {
                Some(d) => *d,
                None => Duration::from_secs_f64(backoff_seconds_with_jitter(
                    next.consecutive_failures,
                    policy,
                    *jitter,
                )),
            };
            next.next_attempt_at = Some(now + span(delay));

            if next.consecutive_failures >= policy.pause_after {
                next.paused_until = Some(now + span(policy.pause_for));
            }
        }
    }
    next
}

/// Whether the scheduler lets an attempt start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Open,
    Backoff { until: DateTime<Utc> },
    Paused { until: DateTime<Utc> },
}

/// Pause wins over backoff so operators see the stronger signal.
pub fn gate(status: Option<&SyncStatus>, now: DateTime<Utc>) -> Gate {
    let Some(status) = status else {
        return Gate::Open;
    };
    if let Some(until) = status.paused_until {
        if until > now {
            return Gate::Paused { until };
        }
    }
    if let Some(until) = status.next_attempt_at {
        if until > now {
            return Gate::Backoff { until };
        }
    }
    Gate::Open
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CredentialKey;
    use chrono::Duration as ChronoDuration;

    fn status() -> SyncStatus {
        SyncStatus::new(CredentialKey::new("loc-1", "square"))
    }

    fn failure(jitter: f64) -> SyncOutcome {
        SyncOutcome::Failure {
            error_class: "transient".into(),
            retry_after: None,
            jitter,
        }
    }

    #[test]
    fn test_backoff_calculation() {
        let policy = BackoffPolicy::default();
        assert_eq!(backoff_seconds_with_jitter(0, &policy, 1.0), 60.0);
        assert_eq!(backoff_seconds_with_jitter(1, &policy, 1.0), 120.0);
        assert_eq!(backoff_seconds_with_jitter(4, &policy, 1.0), 960.0);
        assert_eq!(backoff_seconds_with_jitter(5, &policy, 1.0), 1800.0);
        assert_eq!(backoff_seconds_with_jitter(500, &policy, 1.0), 1800.0);
    }

    #[test]
    fn test_backoff_monotonic_until_cap() {
        let policy = BackoffPolicy::default();
        let mut previous = 0.0;
        for f in 0..40 {
            let secs = backoff_seconds_with_jitter(f, &policy, 1.0);
            assert!(secs >= previous, "backoff decreased at f={f}");
            previous = secs;
        }
    }

    #[test]
    fn test_saturated_backoff_within_jitter_band() {
        let policy = BackoffPolicy::default();
        for f in [5, 6, 10, 31, 32, 1000] {
            for _ in 0..50 {
                let secs = compute_backoff_seconds(f, &policy);
                assert!((1620.0..=1980.0).contains(&secs), "f={f} secs={secs}");
            }
        }
    }

    #[test]
    fn test_failure_advances_next_attempt() {
        let now = Utc::now();
        let next = apply_outcome(&status(), &failure(1.0), &BackoffPolicy::default(), now);
        assert_eq!(next.consecutive_failures, 1);
        assert_eq!(next.next_attempt_at, Some(now + ChronoDuration::seconds(120)));
        assert!(next.next_attempt_at.unwrap() >= now);
        assert_eq!(next.paused_until, None);
        assert_eq!(next.last_error.as_deref(), Some("transient"));
    }

    #[test]
    fn test_retry_after_replaces_backoff() {
        let now = Utc::now();
        let outcome = SyncOutcome::Failure {
            error_class: "rate_limited".into(),
            retry_after: Some(Duration::from_secs(5)),
            jitter: 1.0,
        };
        let next = apply_outcome(&status(), &outcome, &BackoffPolicy::default(), now);
        assert_eq!(next.next_attempt_at, Some(now + ChronoDuration::seconds(5)));

        assert!(matches!(gate(Some(&next), now + ChronoDuration::seconds(2)), Gate::Backoff { .. }));
        assert_eq!(gate(Some(&next), now + ChronoDuration::seconds(5)), Gate::Open);
    }

    #[test]
    fn test_auto_pause_after_five_failures() {
        let now = Utc::now();
        let policy = BackoffPolicy::default();
        let mut s = status();
        for _ in 0..4 {
            s = apply_outcome(&s, &failure(1.0), &policy, now);
        }
        assert_eq!(s.paused_until, None);

        s = apply_outcome(&s, &failure(1.0), &policy, now);
        assert_eq!(s.consecutive_failures, 5);
        assert_eq!(s.paused_until, Some(now + ChronoDuration::hours(2)));
        assert!(matches!(gate(Some(&s), now), Gate::Paused { .. }));
    }

    #[test]
    fn test_success_resets_everything() {
        let now = Utc::now();
        let policy = BackoffPolicy::default();
        let mut s = status();
        for _ in 0..5 {
            s = apply_outcome(&s, &failure(1.0), &policy, now);
        }
        let s = apply_outcome(&s, &SyncOutcome::Success { items: 1 }, &policy, now);
        assert_eq!(s.consecutive_failures, 0);
        assert_eq!(s.paused_until, None);
        assert_eq!(s.next_attempt_at, None);
        assert_eq!(s.last_success_at, Some(now));
        assert_eq!(gate(Some(&s), now), Gate::Open);
    }

    #[test]
    fn test_gate_without_status_is_open() {
        assert_eq!(gate(None, Utc::now()), Gate::Open);
    }
}
