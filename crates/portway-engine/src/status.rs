//! Observed runtime state, published by supervisors and read by the command
//! surface. Never persisted.

use crate::definition::TunnelDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supervisor state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    /// Not running: disabled, deleted, or engine shutting down
    Stopped,
    /// Opening a session; also the state every (re)start begins in
    Connecting,
    /// Session open and the most recent probe succeeded
    Established,
    /// Session open but one or more recent probes failed
    Degraded,
    /// Session torn down, waiting out the backoff delay
    Reconnecting,
    /// Non-recoverable failure; stays put until explicitly re-enabled
    FailedPermanently,
}

impl TunnelState {
    /// True for states with no further automatic transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, TunnelState::Stopped | TunnelState::FailedPermanently)
    }

    /// True while a session is open
    pub fn has_session(&self) -> bool {
        matches!(self, TunnelState::Established | TunnelState::Degraded)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelState::Stopped => "stopped",
            TunnelState::Connecting => "connecting",
            TunnelState::Established => "established",
            TunnelState::Degraded => "degraded",
            TunnelState::Reconnecting => "reconnecting",
            TunnelState::FailedPermanently => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Most recent failure, kept for operator inspection even after recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusError {
    pub message: String,
    pub at: DateTime<Utc>,
}

impl StatusError {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Live status of one tunnel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelRuntimeStatus {
    pub state: TunnelState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StatusError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_since: Option<DateTime<Utc>>,
    /// Failed connect attempts since the last Established; drives backoff
    pub consecutive_failures: u32,
}

impl Default for TunnelRuntimeStatus {
    fn default() -> Self {
        Self {
            state: TunnelState::Stopped,
            last_error: None,
            connected_since: None,
            consecutive_failures: 0,
        }
    }
}

impl TunnelRuntimeStatus {
    /// Baseline after a supervisor stops: back to Stopped with counters
    /// cleared, keeping the last error visible.
    pub fn stopped(last_error: Option<StatusError>) -> Self {
        Self {
            state: TunnelState::Stopped,
            last_error,
            connected_since: None,
            consecutive_failures: 0,
        }
    }
}

/// The read model returned by status and list operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub definition: TunnelDefinition,
    pub status: TunnelRuntimeStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_session_states() {
        assert!(TunnelState::Stopped.is_terminal());
        assert!(TunnelState::FailedPermanently.is_terminal());
        assert!(!TunnelState::Reconnecting.is_terminal());

        assert!(TunnelState::Established.has_session());
        assert!(TunnelState::Degraded.has_session());
        assert!(!TunnelState::Connecting.has_session());
    }

    #[test]
    fn stopped_baseline_keeps_last_error() {
        let err = StatusError::now("probe timed out");
        let status = TunnelRuntimeStatus::stopped(Some(err.clone()));
        assert_eq!(status.state, TunnelState::Stopped);
        assert_eq!(status.last_error, Some(err));
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.connected_since.is_none());
    }
}
