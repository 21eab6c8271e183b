//! HTTP handlers for the tunnel API

use crate::models::{CreateTunnelRequest, HealthResponse};
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{sse::Event, sse::KeepAlive, IntoResponse, Response, Sse},
    Json,
};
use futures::stream::Stream;
use portway_engine::{EngineError, TunnelEvent, TunnelPatch, TunnelRecord};
use problem_details::ProblemDetails;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::info;

/// Convert engine errors to Problem Details responses
fn engine_error_to_problem(error: EngineError) -> impl IntoResponse {
    let (status, title) = match &error {
        EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "Tunnel Not Found"),
        EngineError::DuplicateId(_) => (StatusCode::CONFLICT, "Duplicate Tunnel Id"),
        EngineError::PortConflict { .. } => (StatusCode::CONFLICT, "Port Conflict"),
        EngineError::InvalidParameter(_) => (StatusCode::BAD_REQUEST, "Invalid Parameter"),
        EngineError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Storage Failure"),
        EngineError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "Engine Shutting Down"),
    };

    let problem = ProblemDetails::new()
        .with_status(status)
        .with_title(title)
        .with_detail(error.to_string());

    (status, Json(problem))
}

/// Error wrapper so handlers can use `?` on engine calls
pub(crate) struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        engine_error_to_problem(self.0).into_response()
    }
}

/// Liveness plus a count of tunnels with an open session
pub(crate) async fn handle_health(
    State(state): State<AppState>,
) -> Result<Json<HealthResponse>, ApiError> {
    let tunnels = state.engine.list_tunnels().await?;
    let active = tunnels
        .iter()
        .filter(|t| t.status.state.has_session())
        .count();
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        active_tunnels: active,
    }))
}

/// List all tunnels with their runtime status
pub(crate) async fn handle_list_tunnels(
    State(state): State<AppState>,
) -> Result<Json<Vec<TunnelRecord>>, ApiError> {
    Ok(Json(state.engine.list_tunnels().await?))
}

/// Create a tunnel; starts it immediately unless `enabled` is false
pub(crate) async fn handle_create_tunnel(
    State(state): State<AppState>,
    Json(req): Json<CreateTunnelRequest>,
) -> Result<(StatusCode, Json<TunnelRecord>), ApiError> {
    let record = state.engine.create_tunnel(req.into_definition()).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// Get one tunnel by id
pub(crate) async fn handle_get_tunnel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TunnelRecord>, ApiError> {
    Ok(Json(state.engine.tunnel_status(&id).await?))
}

/// Apply a partial update; restarts the tunnel when connection
/// parameters change
pub(crate) async fn handle_update_tunnel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<TunnelPatch>,
) -> Result<Json<TunnelRecord>, ApiError> {
    Ok(Json(state.engine.update_tunnel(&id, patch).await?))
}

/// Delete a tunnel, stopping its supervisor first
pub(crate) async fn handle_delete_tunnel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete_tunnel(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn handle_enable_tunnel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TunnelRecord>, ApiError> {
    Ok(Json(state.engine.enable_tunnel(&id).await?))
}

pub(crate) async fn handle_disable_tunnel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TunnelRecord>, ApiError> {
    Ok(Json(state.engine.disable_tunnel(&id).await?))
}

/// Recent lifecycle events, oldest first
pub(crate) async fn handle_recent_events(
    State(state): State<AppState>,
) -> Result<Json<Vec<TunnelEvent>>, ApiError> {
    Ok(Json(state.engine.recent_events().await?))
}

/// Server-Sent Events stream of lifecycle transitions
pub(crate) async fn handle_event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("event stream client connected");

    // Subscribe before snapshotting the ring so nothing published in
    // between is lost; a transition may show up twice across the seam.
    let rx = state.events.subscribe();
    let broadcast_stream = BroadcastStream::new(rx);

    let backlog: Vec<TunnelEvent> = state.events.recent();

    let stream = futures::stream::iter(
        backlog
            .into_iter()
            .filter_map(|event| serde_json::to_string(&event).ok())
            .map(|json| Ok(Event::default().data(json))),
    )
    .chain(broadcast_stream.filter_map(|result| {
        let event = match result {
            Ok(event) => event,
            Err(_) => return None,
        };

        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(_) => return None,
        };

        Some(Ok(Event::default().data(json)))
    }));

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
