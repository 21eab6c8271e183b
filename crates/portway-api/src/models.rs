//! Request and response bodies for the HTTP API
//!
//! Responses reuse the engine's serde types directly (`TunnelRecord`,
//! `TunnelEvent`); only requests get their own shapes here, so clients can
//! never smuggle server-owned fields like `created_at` into a definition.

use chrono::Utc;
use portway_engine::{
    ForwardDirection, RemoteHost, TunnelDefinition, DEFAULT_BIND_ADDR, DEFAULT_KEEP_ALIVE_SECS,
    DEFAULT_MAX_BACKOFF_SECS,
};
use serde::{Deserialize, Serialize};

/// Body of `POST /api/tunnels`
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTunnelRequest {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub remote: RemoteHost,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    pub local_port: u16,
    pub remote_port: u16,
    #[serde(default)]
    pub direction: ForwardDirection,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_interval_secs: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
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

impl CreateTunnelRequest {
    /// Build the definition the engine will own. Stamps `created_at` here;
    /// validation happens inside the engine.
    pub fn into_definition(self) -> TunnelDefinition {
        TunnelDefinition {
            id: self.id,
            name: self.name,
            description: self.description,
            remote: self.remote,
            bind_addr: self.bind_addr,
            local_port: self.local_port,
            remote_port: self.remote_port,
            direction: self.direction,
            enabled: self.enabled,
            keep_alive_interval_secs: self.keep_alive_interval_secs,
            max_backoff_secs: self.max_backoff_secs,
            created_at: Utc::now(),
        }
    }
}

/// Body of `GET /api/health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// Tunnels currently in Established or Degraded
    pub active_tunnels: usize,
}
