//! HTTP control surface for the tunnel engine using Axum
//!
//! Exposes the engine's command operations as a REST API plus a
//! Server-Sent Events stream of lifecycle transitions. The server holds an
//! [`EngineHandle`] and never touches the registry or supervisors directly;
//! every mutation goes through the engine's command loop.
//!
//! Routes:
//!
//! | Method | Path                        |                                 |
//! |--------|-----------------------------|---------------------------------|
//! | GET    | `/api/health`               | liveness + active tunnel count  |
//! | GET    | `/api/tunnels`              | list tunnels                    |
//! | POST   | `/api/tunnels`              | create a tunnel                 |
//! | GET    | `/api/tunnels/{id}`         | one tunnel with status          |
//! | PUT    | `/api/tunnels/{id}`         | partial update                  |
//! | DELETE | `/api/tunnels/{id}`         | delete                          |
//! | POST   | `/api/tunnels/{id}/enable`  | enable (restarts failed)        |
//! | POST   | `/api/tunnels/{id}/disable` | disable and stop                |
//! | GET    | `/api/events`               | recent lifecycle events         |
//! | GET    | `/api/events/stream`        | SSE stream of transitions       |
//!
//! Errors come back as RFC 9457 Problem Details documents.

mod handlers;
pub mod models;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use portway_engine::{EngineHandle, EventJournal};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub events: Arc<EventJournal>,
}

impl AppState {
    pub fn new(engine: EngineHandle, events: Arc<EventJournal>) -> Self {
        Self { engine, events }
    }
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    // Configure CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(handlers::handle_health))
        .route("/api/tunnels", get(handlers::handle_list_tunnels))
        .route("/api/tunnels", post(handlers::handle_create_tunnel))
        .route("/api/tunnels/{id}", get(handlers::handle_get_tunnel))
        .route("/api/tunnels/{id}", put(handlers::handle_update_tunnel))
        .route("/api/tunnels/{id}", delete(handlers::handle_delete_tunnel))
        .route(
            "/api/tunnels/{id}/enable",
            post(handlers::handle_enable_tunnel),
        )
        .route(
            "/api/tunnels/{id}/disable",
            post(handlers::handle_disable_tunnel),
        )
        .route("/api/events", get(handlers::handle_recent_events))
        .route("/api/events/stream", get(handlers::handle_event_stream))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve the API until the surrounding task is dropped
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), std::io::Error> {
    info!("🌐 API server listening on http://{}", addr);
    info!("   Tunnels: http://{}/api/tunnels", addr);
    info!("   Events:  http://{}/api/events/stream", addr);

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
