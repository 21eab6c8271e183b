//! Engine and session error types

use thiserror::Error;

/// Errors returned by the command surface
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Tunnel '{0}' not found")]
    NotFound(String),

    #[error("Tunnel '{0}' already exists")]
    DuplicateId(String),

    #[error("Local port {port} on {bind_addr} is already claimed by enabled tunnel '{existing}'")]
    PortConflict {
        bind_addr: String,
        port: u16,
        existing: String,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Engine is shutting down")]
    ShuttingDown,
}

/// Errors produced by the SSH session capability
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Remote host unreachable: {0}")]
    Unreachable(String),

    #[error("Connection timed out")]
    Timeout,

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Host key mismatch: {0}")]
    HostKeyMismatch(String),

    #[error("Local port {0} already in use")]
    PortInUse(u16),

    #[error("Could not launch ssh client: {0}")]
    LaunchFailed(String),

    #[error("Keepalive probe went unanswered")]
    Unresponsive,

    #[error("Session closed: {0}")]
    Closed(String),
}

impl SessionError {
    /// Returns true if this error is non-recoverable and retrying won't help
    pub fn is_non_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::AuthRejected(_)
                | SessionError::HostKeyMismatch(_)
                | SessionError::PortInUse(_)
                | SessionError::LaunchFailed(_)
        )
    }

    /// Returns true if this error is recoverable and retrying might succeed
    pub fn is_recoverable(&self) -> bool {
        !self.is_non_recoverable()
    }
}
