//! Every built-in scenario should pass against a correct rotator.

use std::sync::Arc;

use pos_rotator::chaos::{ChaosHarness, RunStatus, ScenarioId};
use pos_rotator::clock::SystemClock;
use pos_rotator::config::ChaosConfig;

fn harness() -> ChaosHarness {
    let config = ChaosConfig {
        poll_interval_ms: 50,
        max_wait_secs: 60,
        ..ChaosConfig::default()
    };
    ChaosHarness::new(config, Arc::new(SystemClock))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_all_scenarios_pass() {
    let harness = harness();

    for scenario in ScenarioId::ALL {
        let id = harness
            .run_chaos_scenario(scenario.as_str(), Some(format!("it-{scenario}")), None)
            .unwrap();
        let run = harness.wait_for_completion(id).await.unwrap();

        assert_eq!(
            run.status,
            RunStatus::Passed,
            "{scenario}: violations {:?}, error {:?}",
            run.violations,
            run.error
        );
        assert!(run.violations.is_empty());
        assert!(run.finished_at.is_some());
        assert!(run.metrics.provider_requests > 0, "{scenario} made no provider calls");
    }

    assert_eq!(harness.list_runs().len(), ScenarioId::ALL.len());
}

#[tokio::test]
async fn test_server_errors_open_the_breaker() {
    let harness = harness();
    let id = harness.run_chaos_scenario("server_errors", None, None).unwrap();
    let run = harness.wait_for_completion(id).await.unwrap();

    assert_eq!(run.status, RunStatus::Passed);
    assert!(run.metrics.breaker_transitions >= 1);
    assert!(run.metrics.skipped >= 1);
    assert_eq!(run.metrics.rotated, 0);
    assert!(run.metrics.errors_injected >= u64::from(run.config.breaker_threshold));
}

#[tokio::test]
async fn test_disabled_harness_refuses_runs() {
    let harness = ChaosHarness::new(
        ChaosConfig {
            enabled: false,
            ..ChaosConfig::default()
        },
        Arc::new(SystemClock),
    );
    assert!(harness.run_chaos_scenario("server_errors", None, None).is_err());
    assert!(harness.list_runs().is_empty());
}
