//! Fault-injecting stand-in for a provider API.
//!
//! # Responsibilities
//! - Serve the token and identity endpoints on an ephemeral local port
//! - Inject 500s at a rate, 429s with `Retry-After`, or slow responses
//! - Count what it injected and what it served so scenarios can assert
//!   against the traffic the orchestrator actually produced

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ProviderConfig;

pub const TOKEN_PATH: &str = "/oauth/token";
pub const IDENTITY_PATH: &str = "/v1/me";
pub const SIMULATED_MERCHANT: &str = "merchant-sim";

/// Token lifetime reported to callers.
const TOKEN_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum FaultMode {
    Healthy,
    /// HTTP 500 with probability `rate`.
    ServerError { rate: f64 },
    /// HTTP 429, with a `Retry-After` header when `retry_after_secs` is set.
    RateLimited { retry_after_secs: Option<u64> },
    /// Hold every response for `delay_ms` before answering.
    Timeout { delay_ms: u64 },
    /// HTTP 401 on every call.
    Unauthorized,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    errors_injected: AtomicU64,
    rate_limits_injected: AtomicU64,
    timeouts_injected: AtomicU64,
    successful_responses: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatorCounters {
    pub requests: u64,
    pub errors_injected: u64,
    pub rate_limits_injected: u64,
    pub timeouts_injected: u64,
    pub successful_responses: u64,
}

struct SimState {
    mode: ArcSwap<FaultMode>,
    counters: Counters,
    issued: DashSet<String>,
}

#[derive(Deserialize)]
struct TokenBody {
    api_key: String,
    api_secret: String,
}

pub struct FaultSimulator {
    addr: SocketAddr,
    state: Arc<SimState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl FaultSimulator {
    pub async fn start(mode: FaultMode) -> std::io::Result<Self> {
        let state = Arc::new(SimState {
            mode: ArcSwap::from_pointee(mode),
            counters: Counters::default(),
            issued: DashSet::new(),
        });

        let app = Router::new()
            .route(TOKEN_PATH, post(token))
            .route(IDENTITY_PATH, get(identity))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
            if let Err(e) = served {
                tracing::warn!(error = %e, "Fault simulator stopped with error");
            }
        });

        tracing::debug!(address = %addr, ?mode, "Fault simulator listening");

        Ok(Self {
            addr,
            state,
            shutdown: Some(tx),
            task,
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Provider entry pointing at this simulator.
    pub fn provider_config(&self, name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            base_url: self.base_url(),
            token_path: TOKEN_PATH.to_string(),
            identity_path: IDENTITY_PATH.to_string(),
        }
    }

    pub fn set_mode(&self, mode: FaultMode) {
        tracing::debug!(?mode, "Fault simulator mode changed");
        self.state.mode.store(Arc::new(mode));
    }

    pub fn counters(&self) -> SimulatorCounters {
        let c = &self.state.counters;
        SimulatorCounters {
            requests: c.requests.load(Ordering::Relaxed),
            errors_injected: c.errors_injected.load(Ordering::Relaxed),
            rate_limits_injected: c.rate_limits_injected.load(Ordering::Relaxed),
            timeouts_injected: c.timeouts_injected.load(Ordering::Relaxed),
            successful_responses: c.successful_responses.load(Ordering::Relaxed),
        }
    }

    /// Every token handed out so far.
    pub fn issued_tokens(&self) -> Vec<String> {
        self.state.issued.iter().map(|t| t.key().clone()).collect()
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut self.task).await;
    }
}

impl Drop for FaultSimulator {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.abort();
    }
}

/// Apply the current fault. `Some` short-circuits the handler.
async fn inject(state: &SimState) -> Option<Response> {
    let counters = &state.counters;
    counters.requests.fetch_add(1, Ordering::Relaxed);

    let mode = **state.mode.load();
    match mode {
        FaultMode::Healthy => None,
        FaultMode::ServerError { rate } => {
            if fastrand::f64() < rate {
                counters.errors_injected.fetch_add(1, Ordering::Relaxed);
                Some((StatusCode::INTERNAL_SERVER_ERROR, "simulated outage").into_response())
            } else {
                None
            }
        }
        FaultMode::RateLimited { retry_after_secs } => {
            counters.rate_limits_injected.fetch_add(1, Ordering::Relaxed);
            let mut response = (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response();
            if let Some(secs) = retry_after_secs {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(secs));
            }
            Some(response)
        }
        FaultMode::Timeout { delay_ms } => {
            counters.timeouts_injected.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Some((StatusCode::GATEWAY_TIMEOUT, "too late").into_response())
        }
        FaultMode::Unauthorized => {
            counters.errors_injected.fetch_add(1, Ordering::Relaxed);
            Some((StatusCode::UNAUTHORIZED, "bad credentials").into_response())
        }
    }
}

async fn token(State(state): State<Arc<SimState>>, Json(body): Json<TokenBody>) -> Response {
    if let Some(fault) = inject(&state).await {
        return fault;
    }
    if body.api_key.is_empty() || body.api_secret.is_empty() {
        return (StatusCode::UNAUTHORIZED, "missing credentials").into_response();
    }

    let token = format!("sim_{}", Uuid::new_v4().simple());
    state.issued.insert(token.clone());
    state.counters.successful_responses.fetch_add(1, Ordering::Relaxed);

    Json(json!({ "token": token, "expires_in": TOKEN_TTL_SECS })).into_response()
}

async fn identity(State(state): State<Arc<SimState>>, headers: HeaderMap) -> Response {
    if let Some(fault) = inject(&state).await {
        return fault;
    }

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));
    match presented {
        Some(token) if state.issued.contains(token) => {
            state.counters.successful_responses.fetch_add(1, Ordering::Relaxed);
            Json(json!({ "id": SIMULATED_MERCHANT })).into_response()
        }
        _ => (StatusCode::UNAUTHORIZED, "unknown token").into_response(),
    }
}
