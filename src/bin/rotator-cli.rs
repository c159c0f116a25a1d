use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "rotator-cli")]
#[command(about = "Operator CLI for the POS credential rotator", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080", env = "ROTATOR_URL")]
    url: String,

    #[arg(short, long, env = "ROTATOR_API_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Breaker, backoff and credential status, for all keys or one
    Status {
        location: Option<String>,
        provider: Option<String>,
    },
    /// Run one rotation attempt now
    Attempt {
        location: String,
        provider: String,
        /// Replay an earlier rotation id
        #[arg(long)]
        rotation_id: Option<String>,
    },
    /// Enable or disable rotation for a location
    Settings {
        location: String,
        #[arg(long)]
        rotation: Option<bool>,
        #[arg(long)]
        alerts: Option<bool>,
    },
    /// Chaos scenarios
    Chaos {
        #[command(subcommand)]
        command: ChaosCommands,
    },
}

#[derive(Subcommand)]
enum ChaosCommands {
    /// Start a scenario
    Run {
        scenario: String,
        #[arg(long)]
        location: Option<String>,
        /// Poll until the run has a verdict
        #[arg(long)]
        wait: bool,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 30 * 60)]
        max_wait_secs: u64,
    },
    /// Show a run's status, violations and metrics
    Status { run_id: String },
}

const TERMINAL: [&str; 4] = ["passed", "failed", "timed_out", "error"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    match cli.command {
        Commands::Status { location, provider } => {
            let path = match (location, provider) {
                (Some(l), Some(p)) => format!("/v1/status/{l}/{p}"),
                _ => "/v1/status".to_string(),
            };
            let res = client
                .get(format!("{}{}", cli.url, path))
                .headers(headers)
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Attempt {
            location,
            provider,
            rotation_id,
        } => {
            let res = client
                .post(format!("{}/v1/attempts", cli.url))
                .headers(headers)
                .json(&json!({
                    "location": location,
                    "provider": provider,
                    "rotation_id": rotation_id,
                }))
                .send()
                .await?;
            print_response(res).await?;
        }
        Commands::Settings {
            location,
            rotation,
            alerts,
        } => {
            let url = format!("{}/v1/locations/{}/settings", cli.url, location);
            let current: Value = client
                .get(&url)
                .headers(headers.clone())
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            if rotation.is_none() && alerts.is_none() {
                println!("{}", serde_json::to_string_pretty(&current)?);
                return Ok(());
            }
            let updated = json!({
                "rotation_enabled": rotation.unwrap_or(current["rotation_enabled"].as_bool().unwrap_or(true)),
                "alerts_enabled": alerts.unwrap_or(current["alerts_enabled"].as_bool().unwrap_or(true)),
            });
            let res = client.put(&url).headers(headers).json(&updated).send().await?;
            print_response(res).await?;
        }
        Commands::Chaos { command } => match command {
            ChaosCommands::Run {
                scenario,
                location,
                wait,
                max_wait_secs,
            } => {
                let res = client
                    .post(format!("{}/v1/chaos/runs", cli.url))
                    .headers(headers.clone())
                    .json(&json!({ "scenario": scenario, "target_location": location }))
                    .send()
                    .await?;
                if !wait {
                    return print_response(res).await;
                }

                let accepted: Value = res.error_for_status()?.json().await?;
                let run_id = accepted["run_id"].as_str().unwrap_or_default().to_string();
                eprintln!("Started chaos run {run_id}, waiting for a verdict");

                let started = Instant::now();
                let cap = Duration::from_secs(max_wait_secs);
                loop {
                    let run: Value = client
                        .get(format!("{}/v1/chaos/runs/{}", cli.url, run_id))
                        .headers(headers.clone())
                        .send()
                        .await?
                        .error_for_status()?
                        .json()
                        .await?;
                    let status = run["status"].as_str().unwrap_or_default();
                    if TERMINAL.contains(&status) {
                        println!("{}", serde_json::to_string_pretty(&run)?);
                        break;
                    }
                    if started.elapsed() >= cap {
                        eprintln!("Error: no verdict after {max_wait_secs}s (timed_out)");
                        println!("{}", serde_json::to_string_pretty(&run)?);
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
            ChaosCommands::Status { run_id } => {
                let res = client
                    .get(format!("{}/v1/chaos/runs/{}", cli.url, run_id))
                    .headers(headers)
                    .send()
                    .await?;
                print_response(res).await?;
            }
        },
    }

    Ok(())
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: rotator API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
