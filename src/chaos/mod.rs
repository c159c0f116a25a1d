//! Chaos harness and fault simulator.
//!
//! # Data Flow
//! ```text
//! run_chaos_scenario(id, location?, config?)
//!     → harness registry (pending)
//!     → spawned run (running, bounded by scenario_duration_secs)
//!         → ChaosEnv: FaultSimulator + InMemoryStore + ManualClock + Orchestrator
//!         → scenario drives attempts, checks invariants
//!     → passed | failed | timed_out | error
//! get_chaos_status(run_id) → {status, violations[], metrics{}}
//! ```
//!
//! # Design Decisions
//! - Each run gets its own simulator, store and clock; production state is
//!   never touched
//! - Waiting on a run is capped; a run without a verdict at the cap is
//!   cancelled and reported `timed_out`

pub mod env;
pub mod harness;
pub mod invariants;
pub mod scenario;
pub mod simulator;

use thiserror::Error;

use crate::orchestrator::AttemptError;
use crate::store::StoreError;

pub use env::{ChaosEnv, RecordingNotifier};
pub use harness::{ChaosHarness, ChaosRun, RunStatus, TestRunId};
pub use invariants::Violation;
pub use scenario::{run_scenario, ChaosMetrics, ScenarioConfig, ScenarioId, ScenarioReport};
pub use simulator::{FaultMode, FaultSimulator, SimulatorCounters};

#[derive(Debug, Error)]
pub enum ChaosError {
    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),

    #[error("chaos run {0} not found")]
    NotFound(TestRunId),

    #[error("chaos runs are disabled")]
    Disabled,

    #[error("scenario setup failed: {0}")]
    Setup(String),

    #[error(transparent)]
    Attempt(#[from] AttemptError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ChaosResult<T> = Result<T, ChaosError>;
