//! Chaos run registry.
//!
//! # Responsibilities
//! - Start a scenario in the background and hand back its run id
//! - Track each run through `pending → running → passed | failed | timed_out | error`
//! - Bound every run by the scenario duration cap and every caller wait
//!   by the poll cap
//! - Keep at most `max_retained_runs` finished runs; in-flight runs are
//!   never evicted

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::chaos::env::DEFAULT_LOCATION;
use crate::chaos::invariants::Violation;
use crate::chaos::scenario::{run_scenario, ChaosMetrics, ScenarioConfig, ScenarioId};
use crate::chaos::{ChaosError, ChaosResult};
use crate::clock::Clock;
use crate::config::ChaosConfig;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestRunId(pub Uuid);

impl TestRunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TestRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TestRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TestRunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Passed,
    Failed,
    TimedOut,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// A run as reported by `get_chaos_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosRun {
    pub id: TestRunId,
    pub scenario: ScenarioId,
    pub target_location: Option<String>,
    pub status: RunStatus,
    pub config: ScenarioConfig,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub violations: Vec<Violation>,
    pub metrics: ChaosMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct ChaosHarness {
    runs: Arc<DashMap<TestRunId, ChaosRun>>,
    tasks: Arc<DashMap<TestRunId, AbortHandle>>,
    config: ChaosConfig,
    clock: Arc<dyn Clock>,
}

impl ChaosHarness {
    pub fn new(config: ChaosConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            runs: Arc::new(DashMap::new()),
            tasks: Arc::new(DashMap::new()),
            config,
            clock,
        }
    }

    /// `runChaosScenario(scenarioId, targetLocation?, config)`. Must be
    /// called from within a Tokio runtime.
    pub fn run_chaos_scenario(
        &self,
        scenario_id: &str,
        target_location: Option<String>,
        config: Option<ScenarioConfig>,
    ) -> ChaosResult<TestRunId> {
        if !self.config.enabled {
            return Err(ChaosError::Disabled);
        }
        let scenario: ScenarioId = scenario_id.parse()?;
        let config = config.unwrap_or_else(|| ScenarioConfig::defaults_for(scenario, &self.config));
        let id = TestRunId::new();

        self.evict_finished(self.config.max_retained_runs.saturating_sub(1));
        self.runs.insert(
            id,
            ChaosRun {
                id,
                scenario,
                target_location: target_location.clone(),
                status: RunStatus::Pending,
                config: config.clone(),
                created_at: self.clock.now(),
                started_at: None,
                finished_at: None,
                duration_ms: None,
                violations: Vec::new(),
                metrics: ChaosMetrics::default(),
                error: None,
            },
        );

        tracing::info!(
            run_id = %id,
            scenario = scenario.as_str(),
            target_location = target_location.as_deref().unwrap_or(DEFAULT_LOCATION),
            "Chaos run queued"
        );

        // The task waits for its abort handle to be registered first.
        let (go_tx, go_rx) = oneshot::channel::<()>();
        let harness = self.clone();
        let task = tokio::spawn(async move {
            if go_rx.await.is_err() {
                return;
            }
            harness.execute(id, scenario, target_location, config).await;
        });
        self.tasks.insert(id, task.abort_handle());
        let _ = go_tx.send(());

        Ok(id)
    }

    async fn execute(&self, id: TestRunId, scenario: ScenarioId, target_location: Option<String>, config: ScenarioConfig) {
        self.update(id, |run| {
            run.status = RunStatus::Running;
            run.started_at = Some(self.clock.now());
        });

        let location = target_location.as_deref().unwrap_or(DEFAULT_LOCATION);
        let limit = Duration::from_secs(self.config.scenario_duration_secs);
        let result = tokio::time::timeout(limit, run_scenario(scenario, location, &config)).await;

        let (status, report, error) = match result {
            Ok(Ok(report)) if report.violations.is_empty() => (RunStatus::Passed, Some(report), None),
            Ok(Ok(report)) => (RunStatus::Failed, Some(report), None),
            Ok(Err(e)) => (RunStatus::Error, None, Some(e.to_string())),
            Err(_) => (
                RunStatus::TimedOut,
                None,
                Some(format!("scenario exceeded {}s", limit.as_secs())),
            ),
        };

        self.finish(id, status, |run| {
            if let Some(report) = report {
                run.violations = report.violations;
                run.metrics = report.metrics;
            }
            run.error = error;
        });
        self.tasks.remove(&id);
    }

    /// Drop the oldest finished runs until at most `keep` runs remain.
    fn evict_finished(&self, keep: usize) {
        let excess = self.runs.len().saturating_sub(keep);
        if excess == 0 {
            return;
        }
        let mut finished: Vec<_> = self
            .runs
            .iter()
            .filter(|r| r.status.is_terminal())
            .map(|r| (r.finished_at, r.created_at, r.id))
            .collect();
        finished.sort_by_key(|(finished_at, created_at, _)| (*finished_at, *created_at));

        let mut evicted = 0usize;
        for (_, _, id) in finished.into_iter().take(excess) {
            if self.runs.remove_if(&id, |_, run| run.status.is_terminal()).is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::debug!(evicted, retained = self.runs.len(), "Chaos runs evicted");
        }
    }

    fn update(&self, id: TestRunId, apply: impl FnOnce(&mut ChaosRun)) {
        if let Some(mut run) = self.runs.get_mut(&id) {
            apply(&mut run);
        }
    }

    /// Move a run to a terminal status unless it already has one.
    fn finish(&self, id: TestRunId, status: RunStatus, apply: impl FnOnce(&mut ChaosRun)) {
        let Some(mut run) = self.runs.get_mut(&id) else {
            return;
        };
        if run.status.is_terminal() {
            return;
        }
        apply(&mut run);
        let now = self.clock.now();
        run.status = status;
        run.finished_at = Some(now);
        run.duration_ms = run
            .started_at
            .and_then(|s| (now - s).num_milliseconds().try_into().ok());

        tracing::info!(
            run_id = %id,
            scenario = run.scenario.as_str(),
            status = status.as_str(),
            violations = run.violations.len(),
            "Chaos run finished"
        );
        metrics::record_chaos_run(run.scenario.as_str(), status.as_str());
    }

    /// `getChaosStatus(testRunId)`.
    pub fn get_chaos_status(&self, id: TestRunId) -> ChaosResult<ChaosRun> {
        self.runs
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(ChaosError::NotFound(id))
    }

    pub fn list_runs(&self) -> Vec<ChaosRun> {
        let mut runs: Vec<_> = self.runs.iter().map(|r| r.value().clone()).collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    /// Poll until the run is terminal. Past the wait cap the run is
    /// cancelled and reported as `timed_out`.
    pub async fn wait_for_completion(&self, id: TestRunId) -> ChaosResult<ChaosRun> {
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let cap = Duration::from_secs(self.config.max_wait_secs);
        let waited = tokio::time::timeout(cap, async {
            loop {
                let run = self.get_chaos_status(id)?;
                if run.status.is_terminal() {
                    return Ok(run);
                }
                tokio::time::sleep(poll).await;
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => {
                if let Some((_, task)) = self.tasks.remove(&id) {
                    task.abort();
                }
                self.finish(id, RunStatus::TimedOut, |run| {
                    run.error = Some(format!("no verdict within {}s", cap.as_secs()));
                });
                self.get_chaos_status(id)
            }
        }
    }
}
