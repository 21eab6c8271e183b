//! IPC between the `portway` CLI and the daemon
//!
//! The daemon listens on a Unix domain socket inside the data directory and
//! the CLI connects to issue commands. Framing is one JSON document per line
//! in each direction; a connection may carry any number of request/response
//! pairs.

use anyhow::{Context, Result};
use chrono::Utc;
use portway_engine::{EngineError, TunnelDefinition, TunnelEvent, TunnelPatch, TunnelRecord};
use portway_engine::{ForwardDirection, TunnelState};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

/// IPC request from CLI to daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Check if the daemon is alive
    Ping,

    /// Create a tunnel definition; starts it immediately when enabled
    CreateTunnel { definition: TunnelDefinition },

    /// Apply a partial update to a definition
    UpdateTunnel { id: String, patch: TunnelPatch },

    /// Delete a definition, stopping its supervisor first
    DeleteTunnel { id: String },

    EnableTunnel { id: String },

    DisableTunnel { id: String },

    /// Get one tunnel with its runtime status
    GetTunnel { id: String },

    /// List all tunnels with runtime status
    ListTunnels,

    /// Recent lifecycle events, oldest first
    RecentEvents,

    /// Stop every tunnel and exit the daemon
    Shutdown,
}

/// Error category mirrored from the engine so clients can react without
/// parsing messages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    DuplicateId,
    PortConflict,
    InvalidParameter,
    Storage,
    Unavailable,
}

impl From<&EngineError> for ErrorKind {
    fn from(error: &EngineError) -> Self {
        match error {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::DuplicateId(_) => ErrorKind::DuplicateId,
            EngineError::PortConflict { .. } => ErrorKind::PortConflict,
            EngineError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            EngineError::Storage(_) => ErrorKind::Storage,
            EngineError::ShuttingDown => ErrorKind::Unavailable,
        }
    }
}

/// IPC response from daemon to CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    /// Pong response to ping
    Pong,

    /// One tunnel with status
    Record { record: TunnelRecord },

    /// All tunnels with status
    Records { records: Vec<TunnelRecord> },

    /// Recent lifecycle events
    Events { events: Vec<TunnelEvent> },

    /// Success acknowledgment
    Ok { message: Option<String> },

    /// Error response
    Error { kind: ErrorKind, message: String },
}

impl IpcResponse {
    pub fn engine_error(error: &EngineError) -> Self {
        IpcResponse::Error {
            kind: ErrorKind::from(error),
            message: error.to_string(),
        }
    }
}

/// IPC client for the CLI to connect to the daemon
pub struct IpcClient {
    stream: BufReader<UnixStream>,
}

impl IpcClient {
    /// Connect to a daemon socket
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("Failed to connect to daemon socket at {:?}", path))?;

        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    /// Send a request and receive a response
    pub async fn request(&mut self, req: &IpcRequest) -> Result<IpcResponse> {
        let mut json = serde_json::to_string(req)?;
        json.push('\n');

        self.stream
            .get_mut()
            .write_all(json.as_bytes())
            .await
            .context("Failed to send request")?;

        self.stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush request")?;

        let mut response_line = String::new();
        self.stream
            .read_line(&mut response_line)
            .await
            .context("Failed to read response")?;

        let response: IpcResponse =
            serde_json::from_str(&response_line).context("Failed to parse response")?;

        Ok(response)
    }
}

/// IPC server the daemon listens on
#[derive(Debug)]
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Bind to a socket path, taking over a stale socket if the previous
    /// daemon did not exit cleanly
    pub async fn bind(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if path.exists() {
            // Try to connect to see if a live daemon owns it
            match UnixStream::connect(path).await {
                Ok(_) => {
                    anyhow::bail!(
                        "Another daemon is already running (socket at {:?} is active)",
                        path
                    );
                }
                Err(_) => {
                    std::fs::remove_file(path)?;
                }
            }
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind to socket at {:?}", path))?;

        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
        })
    }

    /// Accept an incoming connection
    pub async fn accept(&self) -> Result<IpcConnection> {
        let (stream, _) = self.listener.accept().await?;
        Ok(IpcConnection {
            stream: BufReader::new(stream),
        })
    }

    /// Get the socket path
    pub fn path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

/// A single IPC connection from a client
pub struct IpcConnection {
    stream: BufReader<UnixStream>,
}

impl IpcConnection {
    /// Receive a request from the client
    pub async fn recv(&mut self) -> Result<IpcRequest> {
        let mut line = String::new();
        let bytes_read = self
            .stream
            .read_line(&mut line)
            .await
            .context("Failed to read request")?;

        if bytes_read == 0 {
            anyhow::bail!("Connection closed");
        }

        let request: IpcRequest = serde_json::from_str(&line).context("Failed to parse request")?;

        Ok(request)
    }

    /// Send a response to the client
    pub async fn send(&mut self, response: &IpcResponse) -> Result<()> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.stream
            .get_mut()
            .write_all(json.as_bytes())
            .await
            .context("Failed to send response")?;

        self.stream
            .get_mut()
            .flush()
            .await
            .context("Failed to flush response")?;

        Ok(())
    }
}

// ============================================================================
// Display helpers
// ============================================================================

/// Format duration in human-readable format
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        let hours = seconds / 3600;
        let minutes = (seconds % 3600) / 60;
        format!("{}h {}m", hours, minutes)
    }
}

/// One-line forwarding summary, arrow pointing the way traffic flows
pub fn forward_display(definition: &TunnelDefinition) -> String {
    match definition.direction {
        ForwardDirection::LocalToRemote => format!(
            "{}:{} -> :{}",
            definition.bind_addr, definition.local_port, definition.remote_port
        ),
        ForwardDirection::RemoteToLocal => format!(
            "{}:{} <- :{}",
            definition.bind_addr, definition.local_port, definition.remote_port
        ),
    }
}

/// Display-friendly state with uptime or error context
pub fn state_display(record: &TunnelRecord) -> String {
    if !record.definition.enabled && record.status.state == TunnelState::Stopped {
        return "○ Disabled".to_string();
    }

    match record.status.state {
        TunnelState::Stopped => "○ Stopped".to_string(),
        TunnelState::Connecting => "◐ Connecting".to_string(),
        TunnelState::Established => {
            let uptime = record
                .status
                .connected_since
                .map(|since| {
                    let secs = (Utc::now() - since).num_seconds().max(0) as u64;
                    format!(" ({})", format_duration(secs))
                })
                .unwrap_or_default();
            format!("● Established{}", uptime)
        }
        TunnelState::Degraded => {
            let error = record
                .status
                .last_error
                .as_ref()
                .map(|e| format!(": {}", e.message))
                .unwrap_or_default();
            format!("◑ Degraded{}", error)
        }
        TunnelState::Reconnecting => format!(
            "⟳ Reconnecting (attempt {})",
            record.status.consecutive_failures
        ),
        TunnelState::FailedPermanently => {
            let error = record
                .status
                .last_error
                .as_ref()
                .map(|e| format!(": {}", e.message))
                .unwrap_or_default();
            format!("✗ Failed{}", error)
        }
    }
}

/// Print tunnel table to stdout
pub fn print_tunnel_table(records: &[TunnelRecord]) {
    if records.is_empty() {
        println!("No tunnels configured.");
        return;
    }

    println!(
        "{:<16} {:<24} {:<30} STATE",
        "TUNNEL", "FORWARD", "REMOTE"
    );

    for record in records {
        println!(
            "{:<16} {:<24} {:<30} {}",
            record.definition.id,
            forward_display(&record.definition),
            record.definition.remote.to_string(),
            state_display(record)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use portway_engine::{RemoteHost, TunnelRuntimeStatus};

    fn sample_definition(id: &str) -> TunnelDefinition {
        TunnelDefinition {
            id: id.to_string(),
            name: None,
            description: None,
            remote: RemoteHost {
                host: "bastion.example.net".to_string(),
                ssh_port: 22,
                username: "deploy".to_string(),
                credential_ref: "deploy-key".to_string(),
            },
            bind_addr: "127.0.0.1".to_string(),
            local_port: 8022,
            remote_port: 5432,
            direction: ForwardDirection::LocalToRemote,
            enabled: true,
            keep_alive_interval_secs: 30,
            max_backoff_secs: 60,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_ipc_request_serialization() {
        let req = IpcRequest::Ping;
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);

        let req = IpcRequest::GetTunnel {
            id: "db".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"type":"get_tunnel","id":"db"}"#);

        let req = IpcRequest::ListTunnels;
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"type":"list_tunnels"}"#);

        let req = IpcRequest::Shutdown;
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"type":"shutdown"}"#);
    }

    #[test]
    fn test_ipc_request_with_definition_round_trips() {
        let req = IpcRequest::CreateTunnel {
            definition: sample_definition("db"),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""type":"create_tunnel""#));
        assert!(json.contains(r#""id":"db""#));

        let parsed: IpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_ipc_response_serialization() {
        let resp = IpcResponse::Pong;
        assert_eq!(serde_json::to_string(&resp).unwrap(), r#"{"type":"pong"}"#);

        let resp = IpcResponse::Ok {
            message: Some("Tunnel removed".to_string()),
        };
        assert_eq!(
            serde_json::to_string(&resp).unwrap(),
            r#"{"type":"ok","message":"Tunnel removed"}"#
        );

        let resp = IpcResponse::Error {
            kind: ErrorKind::NotFound,
            message: "Tunnel 'db' not found".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&resp).unwrap(),
            r#"{"type":"error","kind":"not_found","message":"Tunnel 'db' not found"}"#
        );
    }

    #[test]
    fn test_error_kind_mirrors_engine_errors() {
        let error = EngineError::NotFound("db".to_string());
        assert_eq!(ErrorKind::from(&error), ErrorKind::NotFound);

        let error = EngineError::PortConflict {
            bind_addr: "0.0.0.0".to_string(),
            port: 8022,
            existing: "old".to_string(),
        };
        let resp = IpcResponse::engine_error(&error);
        match resp {
            IpcResponse::Error { kind, message } => {
                assert_eq!(kind, ErrorKind::PortConflict);
                assert!(message.contains("8022"));
            }
            other => panic!("expected error response, got {:?}", other),
        }

        assert_eq!(
            ErrorKind::from(&EngineError::ShuttingDown),
            ErrorKind::Unavailable
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(60), "1m 0s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3600), "1h 0m");
        assert_eq!(format_duration(3660), "1h 1m");
    }

    #[test]
    fn test_forward_display_follows_direction() {
        let mut def = sample_definition("db");
        assert_eq!(forward_display(&def), "127.0.0.1:8022 -> :5432");

        def.direction = ForwardDirection::RemoteToLocal;
        assert_eq!(forward_display(&def), "127.0.0.1:8022 <- :5432");
    }

    #[test]
    fn test_state_display_variants() {
        let mut record = TunnelRecord {
            definition: sample_definition("db"),
            status: TunnelRuntimeStatus::default(),
        };
        assert_eq!(state_display(&record), "○ Stopped");

        record.definition.enabled = false;
        assert_eq!(state_display(&record), "○ Disabled");

        record.definition.enabled = true;
        record.status.state = TunnelState::Reconnecting;
        record.status.consecutive_failures = 3;
        assert_eq!(state_display(&record), "⟳ Reconnecting (attempt 3)");
    }

    #[tokio::test]
    async fn test_ipc_client_server_roundtrip() {
        use tempfile::TempDir;

        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();

        let server_handle = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();
            let request = conn.recv().await.unwrap();

            let response = match request {
                IpcRequest::Ping => IpcResponse::Pong,
                _ => IpcResponse::Error {
                    kind: ErrorKind::InvalidParameter,
                    message: "Unexpected request".to_string(),
                },
            };

            conn.send(&response).await.unwrap();
        });

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        let response = client.request(&IpcRequest::Ping).await.unwrap();

        assert_eq!(response, IpcResponse::Pong);

        server_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_ipc_multiple_requests_on_one_connection() {
        use tempfile::TempDir;

        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("multi.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();

        let server_handle = tokio::spawn(async move {
            let mut conn = server.accept().await.unwrap();

            let req1 = conn.recv().await.unwrap();
            assert_eq!(req1, IpcRequest::Ping);
            conn.send(&IpcResponse::Pong).await.unwrap();

            let req2 = conn.recv().await.unwrap();
            assert_eq!(req2, IpcRequest::ListTunnels);
            conn.send(&IpcResponse::Records { records: vec![] })
                .await
                .unwrap();
        });

        let mut client = IpcClient::connect(&socket_path).await.unwrap();

        let resp1 = client.request(&IpcRequest::Ping).await.unwrap();
        assert_eq!(resp1, IpcResponse::Pong);

        let resp2 = client.request(&IpcRequest::ListTunnels).await.unwrap();
        assert_eq!(resp2, IpcResponse::Records { records: vec![] });

        server_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_ipc_stale_socket_cleanup() {
        use tempfile::TempDir;

        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("stale.sock");

        // A leftover file that is not a live socket
        std::fs::write(&socket_path, "stale").unwrap();

        let server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());

        drop(server);

        // Socket is cleaned up on drop
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_ipc_refuses_to_displace_live_daemon() {
        use tempfile::TempDir;

        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("live.sock");

        let _server = IpcServer::bind(&socket_path).await.unwrap();

        let second = IpcServer::bind(&socket_path).await;
        assert!(second.is_err());
        assert!(second
            .unwrap_err()
            .to_string()
            .contains("already running"));
    }
}
