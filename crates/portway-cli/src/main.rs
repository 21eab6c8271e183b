//! Portway CLI - manage supervised SSH port-forwarding tunnels

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portway_cli::daemon::{Daemon, DaemonOptions};
use portway_cli::ipc::{print_tunnel_table, IpcClient, IpcRequest, IpcResponse};
use portway_engine::{
    ForwardDirection, Registry, RemoteHost, TunnelDefinition, TunnelPatch, TunnelRecord,
    TunnelStore, DEFAULT_BIND_ADDR, DEFAULT_KEEP_ALIVE_SECS, DEFAULT_MAX_BACKOFF_SECS,
    DEFAULT_SSH_PORT,
};

/// Portway - keep SSH port-forwarding tunnels alive
#[derive(Parser, Debug)]
#[command(name = "portway")]
#[command(about = "Keep SSH port-forwarding tunnels alive", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory (tunnel definitions, keys, ssh logs)
    #[arg(long, env = "PORTWAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a new tunnel
    Add {
        /// Tunnel id (alphanumeric, hyphens, underscores)
        id: String,
        /// SSH server hostname or address
        #[arg(long)]
        host: String,
        /// Login user on the SSH server
        #[arg(short, long)]
        user: String,
        /// Identity reference: a key file name under <data-dir>/keys, or an
        /// absolute path
        #[arg(short, long)]
        key: String,
        /// SSH port on the server
        #[arg(long, default_value_t = DEFAULT_SSH_PORT)]
        ssh_port: u16,
        /// Port on this gateway
        #[arg(short, long)]
        local_port: u16,
        /// Port on the remote end
        #[arg(short, long)]
        remote_port: u16,
        /// Address the local listener binds to
        #[arg(long, default_value = DEFAULT_BIND_ADDR)]
        bind_addr: String,
        /// Traffic direction: local-to-remote (ssh -L) or remote-to-local (ssh -R)
        #[arg(long, default_value = "local-to-remote")]
        direction: String,
        /// Display name
        #[arg(long)]
        name: Option<String>,
        /// Free-form description
        #[arg(long)]
        description: Option<String>,
        /// Seconds between keepalive probes
        #[arg(long, default_value_t = DEFAULT_KEEP_ALIVE_SECS)]
        keep_alive: u64,
        /// Reconnect backoff ceiling in seconds
        #[arg(long, default_value_t = DEFAULT_MAX_BACKOFF_SECS)]
        max_backoff: u64,
        /// Create disabled; start later with 'portway enable <id>'
        #[arg(long)]
        disabled: bool,
    },
    /// List tunnels with their current state
    List,
    /// Show one tunnel as JSON
    Show {
        /// Tunnel id
        id: String,
    },
    /// Update fields of a tunnel
    Update {
        /// Tunnel id
        id: String,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        ssh_port: Option<u16>,
        #[arg(long)]
        local_port: Option<u16>,
        #[arg(long)]
        remote_port: Option<u16>,
        #[arg(long)]
        bind_addr: Option<String>,
        #[arg(long)]
        direction: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        keep_alive: Option<u64>,
        #[arg(long)]
        max_backoff: Option<u64>,
    },
    /// Remove a tunnel
    Remove {
        /// Tunnel id
        id: String,
    },
    /// Enable a tunnel (starts it when the daemon is running)
    Enable {
        /// Tunnel id
        id: String,
    },
    /// Disable a tunnel and stop it
    Disable {
        /// Tunnel id
        id: String,
    },
    /// Show recent tunnel lifecycle events
    Events,
    /// Manage the daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
}

#[derive(Subcommand, Debug, Clone)]
enum DaemonCommands {
    /// Run the daemon in the foreground
    Run {
        /// Also serve the HTTP API on this address (e.g. 127.0.0.1:7070)
        #[arg(long)]
        web_addr: Option<SocketAddr>,
    },
    /// Check whether the daemon is running
    Status,
    /// Stop a running daemon
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;

    let data_dir = match cli.data_dir.clone() {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    let socket_path = data_dir.join("daemon.sock");

    match cli.command {
        Commands::Add {
            id,
            host,
            user,
            key,
            ssh_port,
            local_port,
            remote_port,
            bind_addr,
            direction,
            name,
            description,
            keep_alive,
            max_backoff,
            disabled,
        } => {
            let definition = TunnelDefinition {
                id,
                name,
                description,
                remote: RemoteHost {
                    host,
                    ssh_port,
                    username: user,
                    credential_ref: key,
                },
                bind_addr,
                local_port,
                remote_port,
                direction: parse_direction(&direction)?,
                enabled: !disabled,
                keep_alive_interval_secs: keep_alive,
                max_backoff_secs: max_backoff,
                created_at: Utc::now(),
            };
            handle_add(&data_dir, &socket_path, definition).await
        }
        Commands::List => handle_list(&data_dir, &socket_path).await,
        Commands::Show { id } => handle_show(&data_dir, &socket_path, &id).await,
        Commands::Update {
            id,
            host,
            user,
            key,
            ssh_port,
            local_port,
            remote_port,
            bind_addr,
            direction,
            name,
            description,
            keep_alive,
            max_backoff,
        } => {
            let remote_override = RemoteOverride {
                host,
                user,
                key,
                ssh_port,
            };
            let patch = TunnelPatch {
                name,
                description,
                remote: None,
                bind_addr,
                local_port,
                remote_port,
                direction: direction.map(|d| parse_direction(&d)).transpose()?,
                keep_alive_interval_secs: keep_alive,
                max_backoff_secs: max_backoff,
            };
            handle_update(&data_dir, &socket_path, &id, patch, remote_override).await
        }
        Commands::Remove { id } => handle_remove(&data_dir, &socket_path, &id).await,
        Commands::Enable { id } => handle_set_enabled(&data_dir, &socket_path, &id, true).await,
        Commands::Disable { id } => handle_set_enabled(&data_dir, &socket_path, &id, false).await,
        Commands::Events => handle_events(&socket_path).await,
        Commands::Daemon { command } => match command {
            DaemonCommands::Run { web_addr } => {
                let mut options = DaemonOptions::new(data_dir);
                options.socket_path = socket_path;
                options.web_addr = web_addr;
                Daemon::new(options).run().await
            }
            DaemonCommands::Status => handle_daemon_status(&socket_path).await,
            DaemonCommands::Stop => handle_daemon_stop(&socket_path).await,
        },
    }
}

/// Commands go through the daemon when one is running; otherwise they apply
/// directly to the stored configuration and take effect on the next start.
enum Backend {
    Daemon(IpcClient),
    Offline(Registry),
}

async fn backend(data_dir: &Path, socket_path: &Path) -> Result<Backend> {
    match IpcClient::connect(socket_path).await {
        Ok(client) => Ok(Backend::Daemon(client)),
        Err(_) => {
            let store = TunnelStore::open(data_dir.join("tunnels"))?;
            let registry = Registry::load(store)?;
            Ok(Backend::Offline(registry))
        }
    }
}

fn expect_record(response: IpcResponse) -> Result<TunnelRecord> {
    match response {
        IpcResponse::Record { record } => Ok(record),
        IpcResponse::Error { message, .. } => bail!(message),
        other => bail!("Unexpected daemon response: {:?}", other),
    }
}

async fn get_record(backend: &mut Backend, id: &str) -> Result<TunnelRecord> {
    match backend {
        Backend::Daemon(client) => {
            let response = client
                .request(&IpcRequest::GetTunnel { id: id.to_string() })
                .await?;
            expect_record(response)
        }
        Backend::Offline(registry) => Ok(registry.get(id).await?),
    }
}

async fn handle_add(
    data_dir: &Path,
    socket_path: &Path,
    definition: TunnelDefinition,
) -> Result<()> {
    let id = definition.id.clone();
    let enabled = definition.enabled;

    let offline = match backend(data_dir, socket_path).await? {
        Backend::Daemon(mut client) => {
            expect_record(client.request(&IpcRequest::CreateTunnel { definition }).await?)?;
            false
        }
        Backend::Offline(registry) => {
            registry.add(definition).await?;
            true
        }
    };

    println!("✅ Tunnel '{}' added", id);
    println!(
        "   Configuration: {}",
        data_dir.join("tunnels").join(format!("{}.json", id)).display()
    );
    if !enabled {
        println!("   Disabled (use 'portway enable {}' to start it)", id);
    } else if offline {
        println!("   Daemon not running; starts on the next 'portway daemon run'");
    } else {
        println!("   Starting under daemon supervision");
    }
    Ok(())
}

async fn handle_list(data_dir: &Path, socket_path: &Path) -> Result<()> {
    match backend(data_dir, socket_path).await? {
        Backend::Daemon(mut client) => match client.request(&IpcRequest::ListTunnels).await? {
            IpcResponse::Records { records } => {
                print_tunnel_table(&records);
                Ok(())
            }
            IpcResponse::Error { message, .. } => bail!(message),
            other => bail!("Unexpected daemon response: {:?}", other),
        },
        Backend::Offline(registry) => {
            let records = registry.list().await;
            print_tunnel_table(&records);
            if !records.is_empty() {
                println!();
                println!("Daemon not running; states reflect the stored configuration.");
            }
            Ok(())
        }
    }
}

async fn handle_show(data_dir: &Path, socket_path: &Path, id: &str) -> Result<()> {
    let mut backend = backend(data_dir, socket_path).await?;
    let record = get_record(&mut backend, id).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

/// Remote host fields arrive as individual flags; a patch carries the whole
/// value, so partial changes merge with the current definition first.
struct RemoteOverride {
    host: Option<String>,
    user: Option<String>,
    key: Option<String>,
    ssh_port: Option<u16>,
}

impl RemoteOverride {
    fn is_empty(&self) -> bool {
        self.host.is_none() && self.user.is_none() && self.key.is_none() && self.ssh_port.is_none()
    }

    fn merge_onto(self, current: RemoteHost) -> RemoteHost {
        RemoteHost {
            host: self.host.unwrap_or(current.host),
            ssh_port: self.ssh_port.unwrap_or(current.ssh_port),
            username: self.user.unwrap_or(current.username),
            credential_ref: self.key.unwrap_or(current.credential_ref),
        }
    }
}

async fn handle_update(
    data_dir: &Path,
    socket_path: &Path,
    id: &str,
    mut patch: TunnelPatch,
    remote_override: RemoteOverride,
) -> Result<()> {
    let mut backend = backend(data_dir, socket_path).await?;

    if !remote_override.is_empty() {
        let current = get_record(&mut backend, id).await?.definition.remote;
        patch.remote = Some(remote_override.merge_onto(current));
    }

    if patch.is_empty() {
        bail!("Nothing to update; pass at least one field flag");
    }

    let restarts = patch.touches_connection();
    let record = match &mut backend {
        Backend::Daemon(client) => expect_record(
            client
                .request(&IpcRequest::UpdateTunnel {
                    id: id.to_string(),
                    patch,
                })
                .await?,
        )?,
        Backend::Offline(registry) => {
            registry.update(id, &patch).await?;
            registry.get(id).await?
        }
    };

    println!("✅ Tunnel '{}' updated", record.definition.id);
    if restarts && record.definition.enabled && matches!(backend, Backend::Daemon(_)) {
        println!("   Connection parameters changed; tunnel is restarting");
    }
    Ok(())
}

async fn handle_remove(data_dir: &Path, socket_path: &Path, id: &str) -> Result<()> {
    match backend(data_dir, socket_path).await? {
        Backend::Daemon(mut client) => {
            match client
                .request(&IpcRequest::DeleteTunnel { id: id.to_string() })
                .await?
            {
                IpcResponse::Ok { .. } => {}
                IpcResponse::Error { message, .. } => bail!(message),
                other => bail!("Unexpected daemon response: {:?}", other),
            }
        }
        Backend::Offline(registry) => {
            registry.remove(id).await?;
        }
    }
    println!("✅ Tunnel '{}' removed", id);
    Ok(())
}

async fn handle_set_enabled(
    data_dir: &Path,
    socket_path: &Path,
    id: &str,
    enabled: bool,
) -> Result<()> {
    let request = if enabled {
        IpcRequest::EnableTunnel { id: id.to_string() }
    } else {
        IpcRequest::DisableTunnel { id: id.to_string() }
    };

    let offline = match backend(data_dir, socket_path).await? {
        Backend::Daemon(mut client) => {
            expect_record(client.request(&request).await?)?;
            false
        }
        Backend::Offline(registry) => {
            registry.set_enabled(id, enabled).await?;
            true
        }
    };

    if enabled {
        println!("✅ Tunnel '{}' enabled", id);
        if offline {
            println!("   Daemon not running; starts on the next 'portway daemon run'");
        }
    } else {
        println!("✅ Tunnel '{}' disabled", id);
    }
    Ok(())
}

async fn handle_events(socket_path: &Path) -> Result<()> {
    let mut client = IpcClient::connect(socket_path)
        .await
        .context("Daemon is not running")?;

    match client.request(&IpcRequest::RecentEvents).await? {
        IpcResponse::Events { events } => {
            if events.is_empty() {
                println!("No events recorded yet.");
                return Ok(());
            }
            for event in events {
                let detail = event
                    .detail
                    .map(|d| format!(" - {}", d))
                    .unwrap_or_default();
                println!(
                    "{} [{}] {}{}",
                    event.at.format("%Y-%m-%d %H:%M:%S"),
                    event.tunnel_id,
                    event.state,
                    detail
                );
            }
            Ok(())
        }
        IpcResponse::Error { message, .. } => bail!(message),
        other => bail!("Unexpected daemon response: {:?}", other),
    }
}

async fn handle_daemon_status(socket_path: &Path) -> Result<()> {
    let mut client = match IpcClient::connect(socket_path).await {
        Ok(client) => client,
        Err(_) => {
            println!("Daemon is not running.");
            return Ok(());
        }
    };

    match client.request(&IpcRequest::Ping).await? {
        IpcResponse::Pong => {}
        other => bail!("Unexpected daemon response: {:?}", other),
    }

    println!("Daemon is running (socket {:?})", socket_path);

    if let IpcResponse::Records { records } = client.request(&IpcRequest::ListTunnels).await? {
        let active = records
            .iter()
            .filter(|r| r.status.state.has_session())
            .count();
        println!("   Tunnels: {} configured, {} active", records.len(), active);
    }
    Ok(())
}

async fn handle_daemon_stop(socket_path: &Path) -> Result<()> {
    let mut client = IpcClient::connect(socket_path)
        .await
        .context("Daemon is not running")?;

    match client.request(&IpcRequest::Shutdown).await? {
        IpcResponse::Ok { message } => {
            info!("{}", message.unwrap_or_else(|| "Daemon stopping".to_string()));
            println!("✅ Daemon stopping");
            Ok(())
        }
        IpcResponse::Error { message, .. } => bail!(message),
        other => bail!("Unexpected daemon response: {:?}", other),
    }
}

fn parse_direction(value: &str) -> Result<ForwardDirection> {
    match value.to_ascii_lowercase().as_str() {
        "local-to-remote" | "local" | "l" => Ok(ForwardDirection::LocalToRemote),
        "remote-to-local" | "remote" | "r" => Ok(ForwardDirection::RemoteToLocal),
        other => bail!(
            "Unknown direction '{}'; use local-to-remote or remote-to-local",
            other
        ),
    }
}

fn default_data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".portway"))
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
