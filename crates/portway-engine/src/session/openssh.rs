//! Production session adapter driving the system OpenSSH client
//!
//! One `ssh -N` process per session. stderr goes to a per-tunnel log file;
//! when the child dies during establishment the log tail is classified into
//! a [`SessionError`] so the supervisor can tell a flaky network from a bad
//! credential.

use super::{ForwardSpec, SshConnector, SshSession};
use crate::definition::ForwardDirection;
use crate::error::SessionError;
use async_trait::async_trait;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const DIAL_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_LOG_BYTES: u64 = 512 * 1024;
const LOG_TAIL_LINES: usize = 8;

/// Maps an opaque credential reference to an identity file path. The engine
/// never reads the key material itself; the path is handed to `ssh -i`.
pub trait CredentialResolver: Send + Sync {
    fn identity_path(&self, credential_ref: &str) -> Result<PathBuf, SessionError>;
}

/// Resolves references against a key directory. Absolute references pass
/// through untouched so existing `~/.ssh` keys can be used directly.
pub struct DirCredentialResolver {
    dir: PathBuf,
}

impl DirCredentialResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl CredentialResolver for DirCredentialResolver {
    fn identity_path(&self, credential_ref: &str) -> Result<PathBuf, SessionError> {
        let reference = Path::new(credential_ref);
        if reference.is_absolute() {
            return Ok(reference.to_path_buf());
        }
        // Relative references are plain filenames, never paths.
        let valid = !credential_ref.is_empty()
            && credential_ref
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !credential_ref.starts_with('.');
        if !valid {
            return Err(SessionError::AuthRejected(format!(
                "malformed credential reference '{}'",
                credential_ref
            )));
        }
        Ok(self.dir.join(credential_ref))
    }
}

/// Opens sessions by spawning `ssh`
pub struct OpenSshConnector {
    credentials: Arc<dyn CredentialResolver>,
    log_dir: PathBuf,
    connect_timeout: Duration,
    settle_delay: Duration,
}

impl OpenSshConnector {
    pub fn new(credentials: Arc<dyn CredentialResolver>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            credentials,
            log_dir: log_dir.into(),
            connect_timeout: Duration::from_secs(15),
            settle_delay: Duration::from_secs(2),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    fn log_path(&self, tunnel_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.log", tunnel_id))
    }

    fn build_command(&self, spec: &ForwardSpec, identity: &Path) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-N")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ExitOnForwardFailure=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!(
                "ServerAliveInterval={}",
                spec.keep_alive_interval.as_secs().max(1)
            ))
            .arg("-o")
            .arg("ServerAliveCountMax=3")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.connect_timeout.as_secs().max(1)
            ))
            .arg("-i")
            .arg(identity)
            .arg("-p")
            .arg(spec.remote.ssh_port.to_string());
        match spec.direction {
            ForwardDirection::LocalToRemote => {
                // Destination is the remote host itself, as seen from sshd.
                cmd.arg("-L").arg(format!(
                    "{}:{}:localhost:{}",
                    spec.bind_addr, spec.local_port, spec.remote_port
                ));
            }
            ForwardDirection::RemoteToLocal => {
                cmd.arg("-R").arg(format!(
                    "{}:localhost:{}",
                    spec.remote_port, spec.local_port
                ));
            }
        }
        cmd.arg(format!("{}@{}", spec.remote.username, spec.remote.host));
        cmd.stdin(Stdio::null()).stdout(Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl SshConnector for OpenSshConnector {
    async fn open(&self, spec: &ForwardSpec) -> Result<Box<dyn SshSession>, SessionError> {
        let identity = self.credentials.identity_path(&spec.remote.credential_ref)?;

        fs::create_dir_all(&self.log_dir).map_err(|e| {
            SessionError::LaunchFailed(format!("cannot create log directory: {}", e))
        })?;
        let log_path = self.log_path(&spec.tunnel_id);
        rotate_log(&log_path, MAX_LOG_BYTES);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| SessionError::LaunchFailed(format!("cannot open session log: {}", e)))?;

        let mut cmd = self.build_command(spec, &identity);
        cmd.stderr(Stdio::from(log));
        let mut child = cmd.spawn().map_err(|e| {
            SessionError::LaunchFailed(format!("ssh spawn failed ({}): is it installed?", e))
        })?;
        debug!(
            "[{}] spawned ssh for {} ({})",
            spec.tunnel_id, spec.remote, spec.direction
        );

        // Establishment: the child must stay up, and for local forwards the
        // listener must start accepting, all before the connect deadline.
        let deadline = Instant::now() + self.connect_timeout;
        let settled_at = Instant::now() + self.settle_delay;
        let probe_addr = spec.probe_addr();
        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| SessionError::Closed(e.to_string()))?
            {
                let tail = read_log_tail(&log_path);
                warn!(
                    "[{}] ssh exited during establishment ({}): {}",
                    spec.tunnel_id, status, tail
                );
                return Err(classify_ssh_failure(&tail, spec.local_port));
            }

            let ready = match spec.direction {
                ForwardDirection::LocalToRemote => {
                    matches!(
                        timeout(DIAL_TIMEOUT, TcpStream::connect(&probe_addr)).await,
                        Ok(Ok(_))
                    )
                }
                // No local listener to dial; surviving the settle window with
                // ExitOnForwardFailure set is the readiness signal.
                ForwardDirection::RemoteToLocal => Instant::now() >= settled_at,
            };
            if ready {
                break;
            }

            if Instant::now() >= deadline {
                let _ = child.kill().await;
                return Err(SessionError::Timeout);
            }
            sleep(POLL_INTERVAL).await;
        }

        Ok(Box::new(OpenSshSession {
            child,
            probe_addr,
            direction: spec.direction,
            log_path,
        }))
    }
}

/// A live `ssh` child process
struct OpenSshSession {
    child: Child,
    probe_addr: String,
    direction: ForwardDirection,
    log_path: PathBuf,
}

#[async_trait]
impl SshSession for OpenSshSession {
    async fn probe(&mut self) -> Result<(), SessionError> {
        if let Some(status) = self
            .child
            .try_wait()
            .map_err(|e| SessionError::Closed(e.to_string()))?
        {
            let tail = read_log_tail(&self.log_path);
            return Err(SessionError::Closed(format!("ssh exited ({}): {}", status, tail)));
        }
        match self.direction {
            ForwardDirection::LocalToRemote => {
                match timeout(DIAL_TIMEOUT, TcpStream::connect(&self.probe_addr)).await {
                    Ok(Ok(_)) => Ok(()),
                    _ => Err(SessionError::Unresponsive),
                }
            }
            // Child liveness is all that is observable from this side.
            ForwardDirection::RemoteToLocal => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if let Err(e) = self.child.start_kill() {
            // InvalidInput means the child already exited.
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(SessionError::Closed(format!("kill failed: {}", e)));
            }
        }
        let _ = self.child.wait().await;
        Ok(())
    }
}

/// If a log file exceeds max_bytes, rename it to .log.old (replacing any
/// previous .old file) so the new session starts with a fresh log.
fn rotate_log(path: &Path, max_bytes: u64) {
    if let Ok(meta) = fs::metadata(path) {
        if meta.len() > max_bytes {
            let mut old = path.to_path_buf();
            old.set_extension("log.old");
            let _ = fs::rename(path, old);
        }
    }
}

fn read_log_tail(path: &Path) -> String {
    let content = fs::read_to_string(path).unwrap_or_default();
    let lines: Vec<&str> = content
        .lines()
        .rev()
        .filter(|l| !l.trim().is_empty())
        .take(LOG_TAIL_LINES)
        .collect();
    lines
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Sort an ssh failure into the supervisor's error taxonomy based on what the
/// client wrote before exiting.
fn classify_ssh_failure(stderr: &str, local_port: u16) -> SessionError {
    let lower = stderr.to_lowercase();
    let detail = || {
        stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("ssh exited without output")
            .trim()
            .to_string()
    };

    if lower.contains("permission denied") || lower.contains("too many authentication failures") {
        SessionError::AuthRejected(detail())
    } else if lower.contains("host key verification failed")
        || lower.contains("remote host identification has changed")
    {
        SessionError::HostKeyMismatch(detail())
    } else if lower.contains("address already in use")
        || lower.contains("cannot listen to port")
        || lower.contains("bind: permission denied")
    {
        SessionError::PortInUse(local_port)
    } else if lower.contains("timed out") {
        SessionError::Timeout
    } else {
        // "No route to host", "Connection refused", resolver failures, and
        // anything unrecognized are treated as reachability problems worth
        // retrying.
        SessionError::Unreachable(detail())
    }
}
