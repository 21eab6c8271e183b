//! Tunnel definitions: the desired state authored through the command surface

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default keepalive probe interval in seconds
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;
/// Default reconnect backoff ceiling in seconds
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 60;
/// Default local bind address for forwarded listeners
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
/// Default SSH port on the remote host
pub const DEFAULT_SSH_PORT: u16 = 22;

const MAX_ID_LEN: usize = 64;

/// Which way traffic flows through the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardDirection {
    /// Listen on the local gateway, deliver to the remote host (`ssh -L`)
    LocalToRemote,
    /// Listen on the remote host, deliver to the local gateway (`ssh -R`)
    RemoteToLocal,
}

impl Default for ForwardDirection {
    fn default() -> Self {
        ForwardDirection::LocalToRemote
    }
}

impl fmt::Display for ForwardDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardDirection::LocalToRemote => write!(f, "local->remote"),
            ForwardDirection::RemoteToLocal => write!(f, "remote->local"),
        }
    }
}

/// Identity of the SSH server a tunnel runs through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteHost {
    /// Hostname or address of the SSH server
    pub host: String,
    /// SSH port on the server
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// Login user on the server
    pub username: String,
    /// Opaque credential identifier, resolved to key material outside the engine
    pub credential_ref: String,
}

impl fmt::Display for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.ssh_port)
    }
}

/// A tunnel definition: everything needed to establish and keep one forwarding
/// session alive. Persisted as one JSON document per definition; runtime
/// status never lives here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelDefinition {
    /// Stable client-supplied identifier, also the persistence filename
    pub id: String,
    /// Optional display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Optional free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// SSH server this tunnel runs through
    pub remote: RemoteHost,
    /// Address the local listener binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Port on the local gateway
    pub local_port: u16,
    /// Port on the remote end
    pub remote_port: u16,
    /// Forwarding direction
    #[serde(default)]
    pub direction: ForwardDirection,
    /// Whether the engine should keep this tunnel running
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between keepalive probes
    #[serde(default = "default_keep_alive")]
    pub keep_alive_interval_secs: u64,
    /// Ceiling for the reconnect backoff delay, in seconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    /// Creation timestamp; drives listing order
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_bind_addr() -> String {
    DEFAULT_BIND_ADDR.to_string()
}

fn default_true() -> bool {
    true
}

fn default_keep_alive() -> u64 {
    DEFAULT_KEEP_ALIVE_SECS
}

fn default_max_backoff() -> u64 {
    DEFAULT_MAX_BACKOFF_SECS
}

impl TunnelDefinition {
    /// Display name, falling back to the id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs.max(1))
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs.max(1))
    }

    /// Timeout for a single keepalive probe: half the interval, clamped so a
    /// hung probe can neither pile onto the next tick nor stall cancellation.
    pub fn probe_timeout(&self) -> Duration {
        let half = self.keep_alive_interval() / 2;
        half.clamp(Duration::from_secs(1), Duration::from_secs(10))
    }

    /// Validate id charset, ports, and host fields
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_id(&self.id)?;
        if self.remote.host.trim().is_empty() {
            return Err(EngineError::InvalidParameter(
                "remote host cannot be empty".to_string(),
            ));
        }
        if self.remote.username.trim().is_empty() {
            return Err(EngineError::InvalidParameter(
                "remote username cannot be empty".to_string(),
            ));
        }
        if self.remote.ssh_port == 0 {
            return Err(EngineError::InvalidParameter(
                "ssh port must be non-zero".to_string(),
            ));
        }
        if self.remote.credential_ref.trim().is_empty() {
            return Err(EngineError::InvalidParameter(
                "credential reference cannot be empty".to_string(),
            ));
        }
        if self.bind_addr.trim().is_empty() {
            return Err(EngineError::InvalidParameter(
                "bind address cannot be empty".to_string(),
            ));
        }
        if self.local_port == 0 {
            return Err(EngineError::InvalidParameter(
                "local port must be non-zero".to_string(),
            ));
        }
        if self.remote_port == 0 {
            return Err(EngineError::InvalidParameter(
                "remote port must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Validate a tunnel id (alphanumeric, hyphens, underscores; also the filename)
pub fn validate_id(id: &str) -> Result<(), EngineError> {
    if id.is_empty() {
        return Err(EngineError::InvalidParameter(
            "tunnel id cannot be empty".to_string(),
        ));
    }
    if id.len() > MAX_ID_LEN {
        return Err(EngineError::InvalidParameter(format!(
            "tunnel id cannot exceed {} characters",
            MAX_ID_LEN
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(EngineError::InvalidParameter(
            "tunnel id must contain only alphanumeric characters, hyphens, and underscores"
                .to_string(),
        ));
    }
    Ok(())
}

/// Partial update of a definition. `enabled` is deliberately absent; enabling
/// and disabling are their own operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteHost>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<ForwardDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_secs: Option<u64>,
}

impl TunnelPatch {
    pub fn is_empty(&self) -> bool {
        *self == TunnelPatch::default()
    }

    /// True when applying this patch changes how the session is established,
    /// which forces a supervisor restart. Name and description are cosmetic.
    pub fn touches_connection(&self) -> bool {
        self.remote.is_some()
            || self.bind_addr.is_some()
            || self.local_port.is_some()
            || self.remote_port.is_some()
            || self.direction.is_some()
            || self.keep_alive_interval_secs.is_some()
            || self.max_backoff_secs.is_some()
    }

    pub fn apply_to(&self, def: &mut TunnelDefinition) {
        if let Some(name) = &self.name {
            def.name = if name.is_empty() {
                None
            } else {
                Some(name.clone())
            };
        }
        if let Some(description) = &self.description {
            def.description = if description.is_empty() {
                None
            } else {
                Some(description.clone())
            };
        }
        if let Some(remote) = &self.remote {
            def.remote = remote.clone();
        }
        if let Some(bind_addr) = &self.bind_addr {
            def.bind_addr = bind_addr.clone();
        }
        if let Some(local_port) = self.local_port {
            def.local_port = local_port;
        }
        if let Some(remote_port) = self.remote_port {
            def.remote_port = remote_port;
        }
        if let Some(direction) = self.direction {
            def.direction = direction;
        }
        if let Some(secs) = self.keep_alive_interval_secs {
            def.keep_alive_interval_secs = secs;
        }
        if let Some(secs) = self.max_backoff_secs {
            def.max_backoff_secs = secs;
        }
    }
}
