//! API tests against a real engine with a scripted connector

use axum::body::Body;
use axum::Router;
use http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use portway_api::{router, AppState};
use portway_engine::session::testing::ScriptedConnector;
use portway_engine::session::SshConnector;
use portway_engine::{
    command_channel, EngineSettings, EventJournal, Orchestrator, Registry, TunnelStore,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tower::ServiceExt;

struct TestApi {
    app: Router,
    _task: JoinHandle<()>,
    _temp: TempDir,
}

async fn start_api() -> TestApi {
    let temp = TempDir::new().unwrap();
    let store = TunnelStore::open(temp.path().join("tunnels")).unwrap();
    let registry = Arc::new(Registry::load(store).unwrap());
    let connector = Arc::new(ScriptedConnector::new()) as Arc<dyn SshConnector>;
    let events = Arc::new(EventJournal::default());
    let (handle, commands) = command_channel();
    let orchestrator = Orchestrator::new(registry, connector, events.clone(), EngineSettings::default());
    let task = tokio::spawn(orchestrator.run(commands));
    TestApi {
        app: router(AppState::new(handle, events)),
        _task: task,
        _temp: temp,
    }
}

fn tunnel_body(id: &str, local_port: u16) -> Value {
    json!({
        "id": id,
        "remote": {
            "host": "bastion.example.net",
            "username": "deploy",
            "credential_ref": "deploy-key"
        },
        "bind_addr": "127.0.0.1",
        "local_port": local_port,
        "remote_port": 5432
    })
}

fn json_request(method: Method, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn wait_for_state(app: &Router, id: &str, state: &str) {
    let outcome = timeout(Duration::from_secs(600), async {
        loop {
            let uri = format!("/api/tunnels/{}", id);
            let (status, body) = send(app, empty_request(Method::GET, &uri)).await;
            if status == StatusCode::OK && body["status"]["state"] == state {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(outcome.is_ok(), "tunnel '{}' never reached {}", id, state);
}

#[tokio::test(start_paused = true)]
async fn create_returns_record_with_defaults_applied() {
    let api = start_api().await;

    let (status, body) = send(
        &api.app,
        json_request(Method::POST, "/api/tunnels", &tunnel_body("pg", 15432)),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["definition"]["id"], "pg");
    assert_eq!(body["definition"]["enabled"], true);
    assert_eq!(body["definition"]["direction"], "local_to_remote");
    assert_eq!(body["definition"]["keep_alive_interval_secs"], 30);
    assert_eq!(body["definition"]["remote"]["ssh_port"], 22);

    wait_for_state(&api.app, "pg", "established").await;
}

#[tokio::test(start_paused = true)]
async fn health_counts_tunnels_with_open_sessions() {
    let api = start_api().await;

    let (status, body) = send(&api.app, empty_request(Method::GET, "/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_tunnels"], 0);

    send(
        &api.app,
        json_request(Method::POST, "/api/tunnels", &tunnel_body("pg", 15432)),
    )
    .await;
    wait_for_state(&api.app, "pg", "established").await;

    let (_, body) = send(&api.app, empty_request(Method::GET, "/api/health")).await;
    assert_eq!(body["active_tunnels"], 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_id_is_rejected_as_bad_request() {
    let api = start_api().await;

    let (status, body) = send(
        &api.app,
        json_request(Method::POST, "/api/tunnels", &tunnel_body("bad/id", 15432)),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["title"], "Invalid Parameter");
}

#[tokio::test(start_paused = true)]
async fn duplicate_id_and_port_conflict_are_conflicts() {
    let api = start_api().await;

    send(
        &api.app,
        json_request(Method::POST, "/api/tunnels", &tunnel_body("pg", 15432)),
    )
    .await;

    let (status, body) = send(
        &api.app,
        json_request(Method::POST, "/api/tunnels", &tunnel_body("pg", 15433)),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["title"], "Duplicate Tunnel Id");

    let (status, body) = send(
        &api.app,
        json_request(Method::POST, "/api/tunnels", &tunnel_body("pg2", 15432)),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["title"], "Port Conflict");
    assert!(body["detail"].as_str().unwrap().contains("15432"));
}

#[tokio::test(start_paused = true)]
async fn missing_tunnel_is_not_found() {
    let api = start_api().await;

    let (status, body) = send(&api.app, empty_request(Method::GET, "/api/tunnels/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["title"], "Tunnel Not Found");
    assert!(body["detail"].as_str().unwrap().contains("nope"));

    let (status, _) = send(&api.app, empty_request(Method::DELETE, "/api/tunnels/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn rename_keeps_tunnel_running() {
    let api = start_api().await;

    send(
        &api.app,
        json_request(Method::POST, "/api/tunnels", &tunnel_body("pg", 15432)),
    )
    .await;
    wait_for_state(&api.app, "pg", "established").await;

    let patch = json!({"name": "Prod Postgres"});
    let (status, body) = send(&api.app, json_request(Method::PUT, "/api/tunnels/pg", &patch)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["definition"]["name"], "Prod Postgres");
    assert_eq!(body["status"]["state"], "established");
}

#[tokio::test(start_paused = true)]
async fn delete_returns_no_content_and_forgets_the_tunnel() {
    let api = start_api().await;

    send(
        &api.app,
        json_request(Method::POST, "/api/tunnels", &tunnel_body("pg", 15432)),
    )
    .await;

    let (status, _) = send(&api.app, empty_request(Method::DELETE, "/api/tunnels/pg")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&api.app, empty_request(Method::GET, "/api/tunnels/pg")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn disable_and_enable_round_trip() {
    let api = start_api().await;

    send(
        &api.app,
        json_request(Method::POST, "/api/tunnels", &tunnel_body("pg", 15432)),
    )
    .await;
    wait_for_state(&api.app, "pg", "established").await;

    let (status, body) = send(
        &api.app,
        empty_request(Method::POST, "/api/tunnels/pg/disable"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["definition"]["enabled"], false);
    wait_for_state(&api.app, "pg", "stopped").await;

    let (status, body) = send(
        &api.app,
        empty_request(Method::POST, "/api/tunnels/pg/enable"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["definition"]["enabled"], true);
    wait_for_state(&api.app, "pg", "established").await;
}

#[tokio::test(start_paused = true)]
async fn events_endpoint_reports_transitions_oldest_first() {
    let api = start_api().await;

    send(
        &api.app,
        json_request(Method::POST, "/api/tunnels", &tunnel_body("pg", 15432)),
    )
    .await;
    wait_for_state(&api.app, "pg", "established").await;

    let (status, body) = send(&api.app, empty_request(Method::GET, "/api/events")).await;
    assert_eq!(status, StatusCode::OK);
    let events = body.as_array().unwrap();
    assert!(events.len() >= 2);
    assert_eq!(events[0]["tunnel_id"], "pg");
    assert_eq!(events[0]["state"], "connecting");
    assert_eq!(events.last().unwrap()["state"], "established");
}

#[tokio::test(start_paused = true)]
async fn event_stream_negotiates_server_sent_events() {
    let api = start_api().await;

    let response = api
        .app
        .clone()
        .oneshot(empty_request(Method::GET, "/api/events/stream"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("text/event-stream"));
}
