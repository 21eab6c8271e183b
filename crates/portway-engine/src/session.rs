//! SSH session capability
//!
//! The supervisor drives tunnels exclusively through [`SshConnector`] and
//! [`SshSession`]. There is exactly one production implementation
//! ([`openssh::OpenSshConnector`], which drives the system OpenSSH client)
//! and one deterministic fake for tests ([`testing::ScriptedConnector`]).

use crate::definition::{ForwardDirection, RemoteHost, TunnelDefinition};
use crate::error::SessionError;
use async_trait::async_trait;
use std::time::Duration;

pub mod openssh;
pub mod testing;

/// Everything the connector needs to establish one forwarding session
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardSpec {
    pub tunnel_id: String,
    pub remote: RemoteHost,
    pub bind_addr: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub direction: ForwardDirection,
    pub keep_alive_interval: Duration,
}

impl ForwardSpec {
    pub fn from_definition(def: &TunnelDefinition) -> Self {
        Self {
            tunnel_id: def.id.clone(),
            remote: def.remote.clone(),
            bind_addr: def.bind_addr.clone(),
            local_port: def.local_port,
            remote_port: def.remote_port,
            direction: def.direction,
            keep_alive_interval: def.keep_alive_interval(),
        }
    }

    /// Address a local connectivity probe should dial. Wildcard binds are
    /// probed over loopback; IPv6 literals need brackets.
    pub fn probe_addr(&self) -> String {
        let host = match self.bind_addr.as_str() {
            "" | "0.0.0.0" | "*" | "::" => "127.0.0.1",
            other => other,
        };
        if host.contains(':') {
            format!("[{}]:{}", host, self.local_port)
        } else {
            format!("{}:{}", host, self.local_port)
        }
    }
}

/// One open forwarding session
#[async_trait]
pub trait SshSession: Send {
    /// Cheap liveness check. An error here counts as one health-check strike.
    async fn probe(&mut self) -> Result<(), SessionError>;

    /// Tear the session down. Must be safe to call on an already-dead session.
    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Opens forwarding sessions
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn open(&self, spec: &ForwardSpec) -> Result<Box<dyn SshSession>, SessionError>;
}
