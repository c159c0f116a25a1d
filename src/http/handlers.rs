//! Operator API handlers.
//!
//! Error bodies carry a short reason and never a provider response body or
//! secret material.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::chaos::{ChaosError, ChaosRun, RunStatus, ScenarioConfig, TestRunId};
use crate::envelope::{EnvelopeError, ProviderSecrets};
use crate::http::server::AppState;
use crate::orchestrator::{AttemptError, AttemptOptions, AttemptOutcome, KeyStatus, StatusReport};
use crate::rotation::{ConnectRequest, RotationError, RotationId};
use crate::store::{CredentialKey, CredentialView, LocationSettings, StoreError};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Forbidden(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Forbidden(m) => (StatusCode::FORBIDDEN, m),
            Self::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => Self::NotFound(format!("no credential for {key}")),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

impl From<AttemptError> for ApiError {
    fn from(err: AttemptError) -> Self {
        match err {
            AttemptError::Store(e) => e.into(),
            AttemptError::KeyUnavailable(_) => Self::Unavailable("encryption key unavailable".into()),
            AttemptError::UnknownProvider(p) => Self::NotFound(format!("unknown provider '{p}'")),
        }
    }
}

impl From<RotationError> for ApiError {
    fn from(err: RotationError) -> Self {
        match err {
            RotationError::Store(e) => e.into(),
            RotationError::Envelope(EnvelopeError::KeyUnavailable(_)) => {
                Self::Unavailable("encryption key unavailable".into())
            }
            RotationError::Envelope(_) => Self::Internal("credential encryption failed".into()),
        }
    }
}

impl From<ChaosError> for ApiError {
    fn from(err: ChaosError) -> Self {
        match err {
            ChaosError::UnknownScenario(_) => Self::BadRequest(err.to_string()),
            ChaosError::NotFound(_) => Self::NotFound(err.to_string()),
            ChaosError::Disabled => Self::Forbidden(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Secrets arrive here once and are sealed immediately.
#[derive(Deserialize)]
pub struct ConnectBody {
    pub location: String,
    pub provider: String,
    pub api_key: String,
    pub api_secret: String,
    pub access_token: Option<String>,
    pub store_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub async fn connect_credentials(
    State(state): State<AppState>,
    Json(body): Json<ConnectBody>,
) -> Result<(StatusCode, Json<CredentialView>), ApiError> {
    if body.location.is_empty() || body.api_key.is_empty() || body.api_secret.is_empty() {
        return Err(ApiError::BadRequest(
            "location, api_key and api_secret are required".into(),
        ));
    }
    state
        .orchestrator
        .providers()
        .get(&body.provider)
        .map_err(|_| ApiError::NotFound(format!("unknown provider '{}'", body.provider)))?;

    let mut secrets = ProviderSecrets::new(body.api_key, body.api_secret);
    if let Some(token) = body.access_token {
        secrets = secrets.with_access_token(token);
    }
    if let Some(store_id) = body.store_id {
        secrets = secrets.with_store_id(store_id);
    }

    let view = state
        .orchestrator
        .engine()
        .connect(ConnectRequest {
            key: CredentialKey::new(body.location, body.provider),
            secrets,
            expires_at: body.expires_at,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

#[derive(Debug, Deserialize)]
pub struct AttemptBody {
    pub location: String,
    pub provider: String,
    /// Replays an earlier rotation instead of starting a new one.
    pub rotation_id: Option<RotationId>,
}

pub async fn run_attempt(
    State(state): State<AppState>,
    Json(body): Json<AttemptBody>,
) -> Result<Json<AttemptOutcome>, ApiError> {
    let outcome = state
        .orchestrator
        .run_attempt_with(
            &body.location,
            &body.provider,
            AttemptOptions {
                rotation_id: body.rotation_id,
                kind: None,
            },
        )
        .await?;
    Ok(Json(outcome))
}

pub async fn status(State(state): State<AppState>) -> Result<Json<StatusReport>, ApiError> {
    Ok(Json(state.orchestrator.status_report().await?))
}

pub async fn key_status(
    State(state): State<AppState>,
    Path((location, provider)): Path<(String, String)>,
) -> Result<Json<KeyStatus>, ApiError> {
    let key = CredentialKey::new(location, provider);
    state
        .orchestrator
        .key_status(&key)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("nothing known about {key}")))
}

pub async fn get_location_settings(
    State(state): State<AppState>,
    Path(location): Path<String>,
) -> Result<Json<LocationSettings>, ApiError> {
    Ok(Json(state.orchestrator.settings_cache().get(&location).await?))
}

pub async fn put_location_settings(
    State(state): State<AppState>,
    Path(location): Path<String>,
    Json(settings): Json<LocationSettings>,
) -> Result<Json<LocationSettings>, ApiError> {
    state
        .orchestrator
        .store()
        .save_location_settings(&location, settings.clone())
        .await?;
    state.orchestrator.settings_cache().invalidate(&location);
    tracing::info!(
        location = %location,
        rotation_enabled = settings.rotation_enabled,
        alerts_enabled = settings.alerts_enabled,
        "Location settings updated"
    );
    Ok(Json(settings))
}

#[derive(Debug, Deserialize)]
pub struct ChaosBody {
    pub scenario: String,
    pub target_location: Option<String>,
    pub config: Option<ScenarioConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChaosAccepted {
    pub run_id: TestRunId,
    pub status: RunStatus,
}

pub async fn start_chaos_run(
    State(state): State<AppState>,
    Json(body): Json<ChaosBody>,
) -> Result<(StatusCode, Json<ChaosAccepted>), ApiError> {
    let run_id = state
        .harness
        .run_chaos_scenario(&body.scenario, body.target_location, body.config)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ChaosAccepted {
            run_id,
            status: RunStatus::Pending,
        }),
    ))
}

pub async fn chaos_run_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChaosRun>, ApiError> {
    let id: TestRunId = id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid run id '{id}'")))?;
    Ok(Json(state.harness.get_chaos_status(id)?))
}

pub async fn list_chaos_runs(State(state): State<AppState>) -> Json<Vec<ChaosRun>> {
    Json(state.harness.list_runs())
}
