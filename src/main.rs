//! POS credential rotator service.
//!
//! ```text
//!                ┌───────────────────────────────────────────────────────┐
//!                │                      ROTATOR                          │
//!   operator ────┼─▶ http API ──┐                                        │
//!                │              ▼                                        │
//!   scheduler ───┼──────▶ orchestrator ──▶ breaker / backoff gates       │
//!                │              │                                        │
//!                │              ├──▶ envelope (decrypt) ──▶ provider ────┼──▶ POS API
//!                │              │                                        │
//!                │              └──▶ rotation engine ──▶ store           │
//!                │                                                       │
//!                │   alerts (log, webhook, dedup)   heartbeat monitor    │
//!                │   chaos harness ──▶ fault simulator (isolated)        │
//!                └───────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;

use pos_rotator::config::{load_config, RotatorConfig};
use pos_rotator::lifecycle;
use pos_rotator::observability::logging::init_logging;

#[derive(Parser)]
#[command(name = "pos-rotator", version, about = "POS credential rotation service")]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "ROTATOR_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => RotatorConfig::default(),
    };

    init_logging(&config.observability);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?args.config,
        "pos-rotator starting"
    );

    lifecycle::run(config, args.config).await?;
    Ok(())
}
