//! Daemon mode: the long-running process that owns the engine
//!
//! Wires the registry, orchestrator, and OpenSSH connector together, then
//! serves two control surfaces until shutdown: the Unix-socket IPC used by
//! the CLI, and optionally the HTTP API.

use anyhow::{Context, Result};
use portway_api::AppState;
use portway_engine::session::openssh::{DirCredentialResolver, OpenSshConnector};
use portway_engine::session::SshConnector;
use portway_engine::{
    command_channel, EngineHandle, EngineSettings, EventJournal, Orchestrator, Registry,
    TunnelStore,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::ipc::{IpcConnection, IpcRequest, IpcResponse, IpcServer};

/// Where the daemon keeps its state and how it can be reached
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Root directory: definitions under `tunnels/`, identity files under
    /// `keys/`, ssh client logs under `logs/`
    pub data_dir: PathBuf,
    /// Unix socket the CLI connects to
    pub socket_path: PathBuf,
    /// Serve the HTTP API here when set
    pub web_addr: Option<SocketAddr>,
    pub settings: EngineSettings,
}

impl DaemonOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let socket_path = data_dir.join("daemon.sock");
        Self {
            data_dir,
            socket_path,
            web_addr: None,
            settings: EngineSettings::default(),
        }
    }
}

/// Daemon for keeping the configured tunnels alive
pub struct Daemon {
    options: DaemonOptions,
}

impl Daemon {
    pub fn new(options: DaemonOptions) -> Self {
        Self { options }
    }

    /// Run until interrupted or told to shut down over IPC
    pub async fn run(self) -> Result<()> {
        info!("🚀 Daemon starting...");

        std::fs::create_dir_all(&self.options.data_dir)
            .with_context(|| format!("Failed to create data dir {:?}", self.options.data_dir))?;

        let store = TunnelStore::open(self.options.data_dir.join("tunnels"))
            .context("Failed to open tunnel store")?;
        let registry = Arc::new(Registry::load(store).context("Failed to load tunnel registry")?);

        let credentials = Arc::new(DirCredentialResolver::new(self.options.data_dir.join("keys")));
        let connector = Arc::new(OpenSshConnector::new(
            credentials,
            self.options.data_dir.join("logs"),
        )) as Arc<dyn SshConnector>;

        let events = Arc::new(EventJournal::default());
        let (engine, commands) = command_channel();
        let orchestrator = Orchestrator::new(
            registry,
            connector,
            events.clone(),
            self.options.settings,
        );
        let mut engine_task = tokio::spawn(orchestrator.run(commands));

        let ipc_server = IpcServer::bind(&self.options.socket_path).await?;
        info!("IPC server listening at {:?}", ipc_server.path());

        let shutdown = Arc::new(Notify::new());
        let ipc_task = tokio::spawn(run_ipc_server(
            ipc_server,
            engine.clone(),
            shutdown.clone(),
        ));

        let web_task = self.options.web_addr.map(|addr| {
            let state = AppState::new(engine.clone(), events.clone());
            tokio::spawn(async move {
                if let Err(e) = portway_api::serve(addr, state).await {
                    error!("API server error: {}", e);
                }
            })
        });

        info!("✅ Daemon ready");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down...");
            }
            _ = shutdown.notified() => {
                info!("Shutdown requested over IPC");
            }
            _ = &mut engine_task => {
                warn!("Engine command loop exited unexpectedly");
            }
        }

        // Stop every supervisor; harmless if the engine already exited.
        let _ = engine.shutdown().await;
        if !engine_task.is_finished() {
            let _ = engine_task.await;
        }

        // Dropping the IPC task drops the server, which removes the socket.
        ipc_task.abort();
        let _ = ipc_task.await;
        if let Some(task) = web_task {
            task.abort();
            let _ = task.await;
        }

        info!("✅ Daemon stopped");
        Ok(())
    }
}

/// Accept loop: one task per connection
async fn run_ipc_server(server: IpcServer, engine: EngineHandle, shutdown: Arc<Notify>) {
    loop {
        match server.accept().await {
            Ok(conn) => {
                let engine = engine.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(serve_connection(conn, engine, shutdown));
            }
            Err(e) => {
                error!("IPC accept error: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Handle requests on one connection until the client hangs up
async fn serve_connection(mut conn: IpcConnection, engine: EngineHandle, shutdown: Arc<Notify>) {
    loop {
        let request = match conn.recv().await {
            Ok(request) => request,
            Err(e) => {
                // EOF is the normal end of a CLI invocation
                if !e.to_string().contains("Connection closed") {
                    warn!("IPC recv error: {}", e);
                }
                return;
            }
        };

        let is_shutdown = request == IpcRequest::Shutdown;
        let response = handle_request(request, &engine, &shutdown).await;
        if let Err(e) = conn.send(&response).await {
            warn!("IPC send error: {}", e);
            return;
        }
        if is_shutdown {
            return;
        }
    }
}

/// Map one IPC request onto the engine's command surface
async fn handle_request(
    request: IpcRequest,
    engine: &EngineHandle,
    shutdown: &Notify,
) -> IpcResponse {
    match request {
        IpcRequest::Ping => IpcResponse::Pong,

        IpcRequest::CreateTunnel { definition } => match engine.create_tunnel(definition).await {
            Ok(record) => IpcResponse::Record { record },
            Err(e) => IpcResponse::engine_error(&e),
        },

        IpcRequest::UpdateTunnel { id, patch } => match engine.update_tunnel(&id, patch).await {
            Ok(record) => IpcResponse::Record { record },
            Err(e) => IpcResponse::engine_error(&e),
        },

        IpcRequest::DeleteTunnel { id } => match engine.delete_tunnel(&id).await {
            Ok(()) => IpcResponse::Ok {
                message: Some(format!("Tunnel '{}' removed", id)),
            },
            Err(e) => IpcResponse::engine_error(&e),
        },

        IpcRequest::EnableTunnel { id } => match engine.enable_tunnel(&id).await {
            Ok(record) => IpcResponse::Record { record },
            Err(e) => IpcResponse::engine_error(&e),
        },

        IpcRequest::DisableTunnel { id } => match engine.disable_tunnel(&id).await {
            Ok(record) => IpcResponse::Record { record },
            Err(e) => IpcResponse::engine_error(&e),
        },

        IpcRequest::GetTunnel { id } => match engine.tunnel_status(&id).await {
            Ok(record) => IpcResponse::Record { record },
            Err(e) => IpcResponse::engine_error(&e),
        },

        IpcRequest::ListTunnels => match engine.list_tunnels().await {
            Ok(records) => IpcResponse::Records { records },
            Err(e) => IpcResponse::engine_error(&e),
        },

        IpcRequest::RecentEvents => match engine.recent_events().await {
            Ok(events) => IpcResponse::Events { events },
            Err(e) => IpcResponse::engine_error(&e),
        },

        IpcRequest::Shutdown => {
            // The reply still goes out: connection tasks outlive the accept loop
            shutdown.notify_one();
            IpcResponse::Ok {
                message: Some("Daemon shutting down".to_string()),
            }
        }
    }
}
