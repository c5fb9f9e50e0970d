//! Agent HTTP API.
//!
//! The wire surface under `/api/v0`: container CRUD and lifecycle, the
//! heartbeat endpoint, host resources, and the container event stream
//! (full snapshot first, then deltas of changed instances).

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::debug;

use convoy_types::{ContainerConfig, Heartbeat, HeartbeatReply};

use crate::container::OpError;
use crate::registry::{RegistryEvent, RegistryHandle};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,
}

/// Build the agent router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v0/containers", get(list_containers))
        .route(
            "/api/v0/containers/{id}",
            put(put_container).get(get_container).delete(delete_container),
        )
        .route("/api/v0/containers/{id}/start", post(start_container))
        .route("/api/v0/containers/{id}/stop", post(stop_container))
        .route("/api/v0/containers/{id}/heartbeat", post(heartbeat))
        .route("/api/v0/resources", get(resources))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until the task is dropped.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}

// =============================================================================
// Error mapping
// =============================================================================

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
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }
}

impl From<OpError> for ApiError {
    fn from(e: OpError) -> Self {
        let message = e.to_string();
        match e {
            OpError::NotFound => Self::new(StatusCode::NOT_FOUND, "not_found", message),
            OpError::AlreadyExists => Self::new(StatusCode::CONFLICT, "already_exists", message),
            OpError::AlreadyRunning => Self::new(StatusCode::CONFLICT, "already_running", message),
            OpError::NotRunning => Self::new(StatusCode::CONFLICT, "not_running", message),
            OpError::NotDown => Self::new(StatusCode::CONFLICT, "still_running", message),
            OpError::Internal(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn put_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(config): Json<ContainerConfig>,
) -> Result<StatusCode, ApiError> {
    if let Err(e) = config.validate() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_config",
            e.to_string(),
        ));
    }

    state.registry.register(&id, config).await?;
    Ok(StatusCode::CREATED)
}

async fn get_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    match state.registry.get(&id).await {
        Some(instance) => Ok(Json(instance).into_response()),
        None => Err(OpError::NotFound.into()),
    }
}

async fn delete_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.destroy(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.start(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn stop_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.stop(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(heartbeat): Json<Heartbeat>,
) -> Json<HeartbeatReply> {
    // The path segment is authoritative for the id.
    let want = state
        .registry
        .heartbeat(Heartbeat {
            id,
            state: heartbeat.state,
        })
        .await;
    Json(HeartbeatReply { want })
}

async fn list_containers(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let wants_stream = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);

    if !wants_stream {
        return Json(state.registry.instances().await).into_response();
    }

    debug!("event-stream subscriber connected");
    let (tx, rx) = tokio::sync::mpsc::channel(32);
    state.registry.notify(tx).await;

    let stream = ReceiverStream::new(rx).map(|event| {
        let (name, payload) = match event {
            RegistryEvent::Snapshot(snapshot) => ("snapshot", snapshot),
            RegistryEvent::Delta(delta) => ("delta", delta),
        };
        Ok::<_, Infallible>(
            Event::default()
                .event(name)
                .data(serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string())),
        )
    });

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

async fn resources(State(state): State<AppState>) -> Response {
    Json(state.registry.snapshot().await.resources).into_response()
}
