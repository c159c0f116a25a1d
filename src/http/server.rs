//! Operator API server.
//!
//! # Responsibilities
//! - Build the Axum router with every handler
//! - Wire up middleware (API key auth, request timeout, tracing)
//! - Serve on a listener until the shutdown broadcast fires

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::chaos::ChaosHarness;
use crate::config::ServerConfig;
use crate::http::auth::api_key_auth;
use crate::http::handlers::*;
use crate::orchestrator::Orchestrator;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub harness: ChaosHarness,
    /// Swapped in place when the config file changes.
    pub api_key: Arc<ArcSwap<String>>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, harness: ChaosHarness, api_key: impl Into<String>) -> Self {
        Self {
            orchestrator,
            harness,
            api_key: Arc::new(ArcSwap::from_pointee(api_key.into())),
        }
    }

    pub fn set_api_key(&self, api_key: impl Into<String>) {
        self.api_key.store(Arc::new(api_key.into()));
    }
}

pub struct ApiServer {
    router: Router,
}

impl ApiServer {
    pub fn new(state: AppState, config: &ServerConfig) -> Self {
        let router = build_router(state, Duration::from_secs(config.request_timeout_secs));
        Self { router }
    }

    /// Run the server until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "Operator API listening");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Operator API draining");
            })
            .await?;

        tracing::info!("Operator API stopped");
        Ok(())
    }
}

/// Build the Axum router with all middleware layers.
#[allow(deprecated)]
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let api = Router::new()
        .route("/v1/credentials", post(connect_credentials))
        .route("/v1/attempts", post(run_attempt))
        .route("/v1/status", get(status))
        .route("/v1/status/{location}/{provider}", get(key_status))
        .route(
            "/v1/locations/{location}/settings",
            get(get_location_settings).put(put_location_settings),
        )
        .route("/v1/chaos/runs", post(start_chaos_run).get(list_chaos_runs))
        .route("/v1/chaos/runs/{id}", get(chaos_run_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), api_key_auth));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
}
