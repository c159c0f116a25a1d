//! End-to-end attempt behaviour against the fault simulator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use pos_rotator::chaos::FaultMode;
use pos_rotator::clock::Clock;
use pos_rotator::envelope::fingerprint;
use pos_rotator::orchestrator::{AttemptError, AttemptOptions, AttemptStatus, SkipReason};
use pos_rotator::resilience::ErrorClass;
use pos_rotator::rotation::RotationId;
use pos_rotator::store::{
    BreakerScope, BreakerState, CredentialStatus, CredentialStore, CredentialUpsert, LocationSettings,
};

mod common;

use common::{Fixture, LOCATION, PROVIDER};

#[tokio::test]
async fn test_healthy_attempt_rotates() {
    let fx = Fixture::start(FaultMode::Healthy).await;

    let outcome = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
    assert_eq!(outcome.status, AttemptStatus::Rotated);

    let record = fx.store.load_credential(&fx.key).await.unwrap().unwrap();
    assert_eq!(record.status, CredentialStatus::Connected);
    assert!(record.last_verified_at.is_some());

    let issued = fx.simulator.issued_tokens();
    assert_eq!(issued.len(), 1);
    assert_eq!(
        record.masked_hints.token_fingerprint.as_deref(),
        Some(fingerprint(&issued[0]).as_str())
    );

    let runs = fx.store.runs_for(&fx.key).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].ok);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_apply_once() {
    let fx = Fixture::start(FaultMode::Healthy).await;
    let orchestrator = Arc::new(fx.orchestrator.clone());
    let rotation_id = RotationId::new();

    let handles = (0..100).map(|_| {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .run_attempt_with(
                    LOCATION,
                    PROVIDER,
                    AttemptOptions {
                        rotation_id: Some(rotation_id),
                        kind: None,
                    },
                )
                .await
        })
    });
    let outcomes: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let rotated = outcomes.iter().filter(|o| o.status == AttemptStatus::Rotated).count();
    let idempotent = outcomes.iter().filter(|o| o.status == AttemptStatus::Idempotent).count();
    assert_eq!(rotated, 1);
    assert_eq!(idempotent, 99);

    let audit = fx.store.rotation_audit(&fx.key).await.unwrap();
    let winners: Vec<_> = audit.iter().filter(|e| e.result == "rotated").collect();
    assert_eq!(winners.len(), 1);

    let record = fx.store.load_credential(&fx.key).await.unwrap().unwrap();
    assert_eq!(record.rotation_attempt_id, Some(rotation_id));
    assert_eq!(record.masked_hints.token_fingerprint, winners[0].token_fingerprint);

    let tally = fx.orchestrator.tally();
    assert_eq!(tally.idempotent_hits, 99);
    assert_eq!(tally.success_rate, Some(1.0));
}

#[tokio::test]
async fn test_breaker_opens_and_short_circuits() {
    let fx = Fixture::start_with(FaultMode::ServerError { rate: 1.0 }, |config| {
        config.breaker.threshold = 10;
        config.breaker.cool_down_secs = 24 * 60 * 60;
        config.backoff.pause_after_failures = u32::MAX;
    })
    .await;

    for attempt in 1..=10 {
        fx.skip_gates().await;
        let outcome = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
        assert_eq!(outcome.status, AttemptStatus::Failed, "attempt {attempt}");
        assert_eq!(outcome.error_class, Some(ErrorClass::Transient));
    }

    let row = fx
        .orchestrator
        .breaker()
        .state(&BreakerScope::provider(PROVIDER))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.state, BreakerState::Open);

    fx.skip_gates().await;
    let before = fx.simulator.counters().requests;
    let outcome = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
    assert_eq!(outcome.status, AttemptStatus::Skipped);
    assert_eq!(outcome.skip_reason(), Some(SkipReason::CircuitOpen));
    assert_eq!(fx.simulator.counters().requests, before);

    // Skips leave no run record.
    assert_eq!(fx.store.runs_for(&fx.key).await.unwrap().len(), 10);

    assert!(fx
        .alerts
        .alerts()
        .iter()
        .any(|a| a.condition.starts_with("breaker_open:")));

    let report = fx.orchestrator.status_report().await.unwrap();
    assert_eq!(report.tripped_breakers.len(), 1);
    assert_eq!(report.tripped_breakers[0].scope, BreakerScope::provider(PROVIDER));
}

#[tokio::test]
async fn test_breaker_recovers_after_cool_down() {
    let fx = Fixture::start_with(FaultMode::ServerError { rate: 1.0 }, |config| {
        config.breaker.threshold = 3;
        config.breaker.cool_down_secs = 60;
        config.backoff.pause_after_failures = u32::MAX;
    })
    .await;

    for _ in 0..3 {
        fx.skip_gates().await;
        fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
    }
    let scope = BreakerScope::provider(PROVIDER);
    let row = fx.orchestrator.breaker().state(&scope).await.unwrap().unwrap();
    assert_eq!(row.state, BreakerState::Open);

    fx.simulator.set_mode(FaultMode::Healthy);
    fx.clock.advance(chrono::Duration::seconds(61));
    fx.skip_gates().await;

    let outcome = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
    assert_eq!(outcome.status, AttemptStatus::Rotated);

    let row = fx.orchestrator.breaker().state(&scope).await.unwrap().unwrap();
    assert_eq!(row.state, BreakerState::Closed);
    assert_eq!(row.failure_count, 0);

    let sync = fx.store.load_sync_status(&fx.key).await.unwrap().unwrap();
    assert_eq!(sync.consecutive_failures, 0);
    assert!(sync.next_attempt_at.is_none());
}

#[tokio::test]
async fn test_straggler_results_leave_half_open_alone() {
    let fx = Fixture::start_with(FaultMode::Healthy, |config| {
        config.breaker.threshold = 3;
        config.breaker.cool_down_secs = 60;
    })
    .await;
    let breaker = fx.orchestrator.breaker();
    let scope = BreakerScope::provider(PROVIDER);

    // A call admitted while closed, still in flight when the breaker trips.
    let early = breaker.check(&scope).await.unwrap();
    assert!(early.allowed);
    assert_eq!(early.state, BreakerState::Closed);

    for _ in 0..3 {
        breaker.record_failure(&scope, false).await.unwrap();
    }
    fx.clock.advance(chrono::Duration::seconds(61));

    let trial = breaker.check(&scope).await.unwrap();
    assert!(trial.allowed);
    assert_eq!(trial.state, BreakerState::HalfOpen);

    // The early call finishing does not close the breaker.
    let t = breaker.record_success(&scope, false).await.unwrap();
    assert_eq!(t.row.state, BreakerState::HalfOpen);
    assert!(!breaker.check(&scope).await.unwrap().allowed);

    // The trial call's failure reopens it.
    let t = breaker.record_failure(&scope, true).await.unwrap();
    assert_eq!(t.row.state, BreakerState::Open);
    assert_eq!(t.row.opened_at, Some(fx.clock.now()));
}

#[tokio::test]
async fn test_backoff_skip_hands_back_half_open_slot() {
    let fx = Fixture::start_with(
        FaultMode::RateLimited {
            retry_after_secs: Some(300),
        },
        |config| {
            config.breaker.threshold = 1;
            config.breaker.cool_down_secs = 60;
        },
    )
    .await;
    let scope = BreakerScope::provider(PROVIDER);

    let outcome = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
    assert_eq!(outcome.error_class, Some(ErrorClass::RateLimited));
    let row = fx.orchestrator.breaker().state(&scope).await.unwrap().unwrap();
    assert_eq!(row.state, BreakerState::Open);

    // Past the cool-down but still inside Retry-After.
    fx.clock.advance(chrono::Duration::seconds(61));
    let before = fx.simulator.counters().requests;
    let outcome = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
    assert_eq!(outcome.skip_reason(), Some(SkipReason::Backoff));
    assert_eq!(fx.simulator.counters().requests, before);

    let row = fx.orchestrator.breaker().state(&scope).await.unwrap().unwrap();
    assert_eq!(row.state, BreakerState::HalfOpen);

    // The half-open slot is free again for the next eligible attempt.
    fx.simulator.set_mode(FaultMode::Healthy);
    fx.skip_gates().await;
    let outcome = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
    assert_eq!(outcome.status, AttemptStatus::Rotated);
    let row = fx.orchestrator.breaker().state(&scope).await.unwrap().unwrap();
    assert_eq!(row.state, BreakerState::Closed);
}

#[tokio::test]
async fn test_retry_after_is_honored() {
    let fx = Fixture::start(FaultMode::RateLimited {
        retry_after_secs: Some(5),
    })
    .await;

    let started = fx.clock.now();
    let outcome = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
    assert_eq!(outcome.status, AttemptStatus::Failed);
    assert_eq!(outcome.error_class, Some(ErrorClass::RateLimited));

    let next = outcome.next_attempt_at.unwrap();
    assert!(next >= started + chrono::Duration::seconds(5));

    fx.clock.advance(chrono::Duration::seconds(2));
    let before = fx.simulator.counters().requests;
    let early = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
    assert_eq!(early.skip_reason(), Some(SkipReason::Backoff));
    assert_eq!(fx.simulator.counters().requests, before);

    fx.simulator.set_mode(FaultMode::Healthy);
    fx.clock.set(next);
    let outcome = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
    assert_eq!(outcome.status, AttemptStatus::Rotated);
}

#[tokio::test]
async fn test_slow_provider_times_out() {
    let fx = Fixture::start(FaultMode::Timeout { delay_ms: 1500 }).await;

    let started = Instant::now();
    let outcome = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(outcome.status, AttemptStatus::Failed);
    assert_eq!(outcome.error_class, Some(ErrorClass::Timeout));

    let sync = fx.store.load_sync_status(&fx.key).await.unwrap().unwrap();
    assert_eq!(sync.consecutive_failures, 1);
    assert_eq!(sync.last_error.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn test_auth_failure_invalidates_credential() {
    let fx = Fixture::start(FaultMode::Unauthorized).await;

    let outcome = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
    assert_eq!(outcome.status, AttemptStatus::Failed);
    assert_eq!(outcome.error_class, Some(ErrorClass::Auth));

    let record = fx.store.load_credential(&fx.key).await.unwrap().unwrap();
    assert_eq!(record.status, CredentialStatus::Invalid);

    fx.simulator.set_mode(FaultMode::Healthy);
    fx.skip_gates().await;
    let before = fx.simulator.counters().requests;
    let outcome = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
    assert_eq!(outcome.skip_reason(), Some(SkipReason::CredentialsInvalid));
    assert_eq!(fx.simulator.counters().requests, before);
}

#[tokio::test]
async fn test_undecryptable_credential_is_invalidated() {
    let fx = Fixture::start(FaultMode::Healthy).await;

    let record = fx.store.load_credential(&fx.key).await.unwrap().unwrap();
    let mut ciphertext = record.ciphertext.clone();
    ciphertext.tag = "AAAAAAAAAAAAAAAAAAAAAA==".to_string();
    fx.store
        .upsert_credential(CredentialUpsert {
            key: fx.key.clone(),
            ciphertext,
            masked_hints: record.masked_hints.clone(),
            expires_at: None,
            now: fx.clock.now(),
        })
        .await
        .unwrap();

    let outcome = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
    assert_eq!(outcome.status, AttemptStatus::Failed);
    assert_eq!(outcome.reason.as_deref(), Some("invalid_credentials"));
    assert_eq!(outcome.error_class, Some(ErrorClass::CiphertextInvalid));
    assert_eq!(fx.simulator.counters().requests, 0);

    let record = fx.store.load_credential(&fx.key).await.unwrap().unwrap();
    assert_eq!(record.status, CredentialStatus::Invalid);

    let sync = fx.store.load_sync_status(&fx.key).await.unwrap().unwrap();
    assert_eq!(sync.consecutive_failures, 1);
    let row = fx
        .orchestrator
        .breaker()
        .state(&BreakerScope::provider(PROVIDER))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.failure_count, 1);

    fx.skip_gates().await;
    let outcome = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
    assert_eq!(outcome.skip_reason(), Some(SkipReason::CredentialsInvalid));
}

#[tokio::test]
async fn test_repeated_failures_pause_the_key() {
    let fx = Fixture::start_with(FaultMode::ServerError { rate: 1.0 }, |config| {
        config.breaker.threshold = 100;
        config.backoff.pause_after_failures = 5;
    })
    .await;

    for attempt in 1..=5 {
        fx.skip_gates().await;
        let outcome = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
        assert_eq!(outcome.status, AttemptStatus::Failed, "attempt {attempt}");
    }

    let sync = fx.store.load_sync_status(&fx.key).await.unwrap().unwrap();
    assert_eq!(sync.consecutive_failures, 5);
    let paused_until = sync.paused_until.unwrap();
    assert!(paused_until > fx.clock.now());

    let before = fx.simulator.counters().requests;
    let outcome = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
    assert_eq!(outcome.skip_reason(), Some(SkipReason::Paused));
    assert_eq!(outcome.next_attempt_at, Some(paused_until));
    assert_eq!(fx.simulator.counters().requests, before);

    assert!(fx
        .alerts
        .alerts()
        .iter()
        .any(|a| a.condition.starts_with("paused:")));
}

#[tokio::test]
async fn test_disabled_location_is_skipped() {
    let fx = Fixture::start(FaultMode::Healthy).await;
    fx.store
        .save_location_settings(
            LOCATION,
            LocationSettings {
                rotation_enabled: false,
                alerts_enabled: true,
            },
        )
        .await
        .unwrap();
    fx.orchestrator.settings_cache().invalidate(LOCATION);

    let outcome = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
    assert_eq!(outcome.status, AttemptStatus::Skipped);
    assert_eq!(outcome.skip_reason(), Some(SkipReason::Disabled));
    assert_eq!(fx.simulator.counters().requests, 0);
    assert!(fx.store.runs_for(&fx.key).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_store_outage_is_fatal() {
    let fx = Fixture::start(FaultMode::Healthy).await;
    fx.store.set_unavailable(true);

    let result = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await;
    assert!(matches!(result, Err(AttemptError::Store(_))));
    assert_eq!(fx.simulator.counters().requests, 0);

    fx.store.set_unavailable(false);
    let outcome = fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();
    assert_eq!(outcome.status, AttemptStatus::Rotated);
}

#[tokio::test]
async fn test_unknown_provider_is_rejected() {
    let fx = Fixture::start(FaultMode::Healthy).await;
    let result = fx.orchestrator.run_attempt(LOCATION, "clover").await;
    assert!(matches!(result, Err(AttemptError::UnknownProvider(p)) if p == "clover"));
}

#[tokio::test]
async fn test_status_report_reflects_attempts() {
    let fx = Fixture::start(FaultMode::ServerError { rate: 1.0 }).await;
    fx.orchestrator.run_attempt(LOCATION, PROVIDER).await.unwrap();

    let status = fx.orchestrator.key_status(&fx.key).await.unwrap().unwrap();
    assert_eq!(status.consecutive_failures, 1);
    assert_eq!(status.last_error.as_deref(), Some("transient"));
    assert!(status.next_attempt_at.is_some());
    assert_eq!(status.breaker, BreakerState::Closed);

    let report = fx.orchestrator.status_report().await.unwrap();
    assert_eq!(report.keys.len(), 1);
    assert_eq!(report.tally.failed, 1);
    assert!(report.tripped_breakers.is_empty());
}
