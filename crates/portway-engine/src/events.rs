//! Tunnel lifecycle event journal
//!
//! Supervisors publish an event for every state transition. Events fan out to
//! live subscribers over a broadcast channel (the SSE stream and tests) and
//! land in a bounded in-memory ring for after-the-fact inspection. Like
//! runtime status, events are observations and are not persisted.

use crate::status::TunnelState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Default capacity of the in-memory event ring
pub const DEFAULT_JOURNAL_CAPACITY: usize = 256;

/// One supervisor state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelEvent {
    pub tunnel_id: String,
    pub state: TunnelState,
    /// Human-readable context: the error message, retry delay, strike count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl TunnelEvent {
    pub fn new(tunnel_id: &str, state: TunnelState, detail: Option<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.to_string(),
            state,
            detail,
            at: Utc::now(),
        }
    }
}

/// Bounded journal plus broadcast fan-out
#[derive(Debug)]
pub struct EventJournal {
    tx: broadcast::Sender<TunnelEvent>,
    recent: Mutex<VecDeque<TunnelEvent>>,
    capacity: usize,
}

impl EventJournal {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self {
            tx,
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn publish(&self, event: TunnelEvent) {
        {
            let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
            if recent.len() == self.capacity {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
        // Nobody listening is fine; the ring still has it.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }

    /// Snapshot of the ring, oldest first
    pub fn recent(&self) -> Vec<TunnelEvent> {
        let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.iter().cloned().collect()
    }
}

impl Default for EventJournal {
    fn default() -> Self {
        Self::new(DEFAULT_JOURNAL_CAPACITY)
    }
}
