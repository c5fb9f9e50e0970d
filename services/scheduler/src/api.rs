//! Scheduler HTTP API.
//!
//! The operator-facing wire surface: declare and withdraw jobs, inspect
//! the desired set and the aggregated cluster state.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use convoy_broadcast::Broadcast;
use convoy_types::{JobConfig, JobHash};

use crate::proxy::ProxyHandle;
use crate::registry::{JobRegistryHandle, RegistryError};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub registry: JobRegistryHandle,
    pub proxy: ProxyHandle,
}

/// Build the scheduler router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v0/schedule", put(schedule))
        .route("/api/v0/unschedule", put(unschedule))
        .route("/api/v0/unschedule/{hash}", put(unschedule_hash))
        .route("/api/v0/registry", get(registry))
        .route("/api/v0/proxy", get(proxy))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until the task is dropped.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorBody {
                code: "internal",
                message: message.into(),
            },
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::AlreadyScheduled => {
                Self::bad_request("already_scheduled", e.to_string())
            }
            RegistryError::NotScheduled => Self::bad_request("not_scheduled", e.to_string()),
            RegistryError::Io(_) | RegistryError::Gone => Self::internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct ScheduleResponse {
    hash: JobHash,
}

async fn schedule(
    State(state): State<AppState>,
    Json(config): Json<JobConfig>,
) -> Result<(StatusCode, Json<ScheduleResponse>), ApiError> {
    if let Err(e) = config.validate() {
        return Err(ApiError::bad_request("invalid_job", e.to_string()));
    }

    let hash = state.registry.schedule(config).await?;
    Ok((StatusCode::ACCEPTED, Json(ScheduleResponse { hash })))
}

async fn unschedule(
    State(state): State<AppState>,
    Json(config): Json<JobConfig>,
) -> Result<StatusCode, ApiError> {
    state.registry.unschedule(config.hash()).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn unschedule_hash(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.unschedule(JobHash::from_hex(hash)).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn registry(State(state): State<AppState>) -> Response {
    Json(state.registry.snapshot().await).into_response()
}

async fn proxy(State(state): State<AppState>) -> Response {
    Json(state.proxy.snapshot().await).into_response()
}
