//! Typed commands and the cloneable engine handle
//!
//! All mutations and reads funnel through one mpsc channel into the
//! orchestrator loop, which serializes them; two commands against the same
//! tunnel id always apply in submission order. Replies come back on oneshot
//! channels.

use crate::definition::{TunnelDefinition, TunnelPatch};
use crate::error::EngineError;
use crate::events::TunnelEvent;
use crate::status::TunnelRecord;
use tokio::sync::{mpsc, oneshot};

/// Default depth of the command channel
pub const COMMAND_BUFFER: usize = 32;

pub enum EngineCommand {
    Create {
        definition: TunnelDefinition,
        reply: oneshot::Sender<Result<TunnelRecord, EngineError>>,
    },
    Update {
        id: String,
        patch: TunnelPatch,
        reply: oneshot::Sender<Result<TunnelRecord, EngineError>>,
    },
    Delete {
        id: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Enable {
        id: String,
        reply: oneshot::Sender<Result<TunnelRecord, EngineError>>,
    },
    Disable {
        id: String,
        reply: oneshot::Sender<Result<TunnelRecord, EngineError>>,
    },
    Status {
        id: String,
        reply: oneshot::Sender<Result<TunnelRecord, EngineError>>,
    },
    List {
        reply: oneshot::Sender<Vec<TunnelRecord>>,
    },
    RecentEvents {
        reply: oneshot::Sender<Vec<TunnelEvent>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Create the command channel and its sending handle
pub fn command_channel() -> (EngineHandle, mpsc::Receiver<EngineCommand>) {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    (EngineHandle { tx }, rx)
}

/// Cheap-to-clone facade over the orchestrator loop. Holds no tunnel state
/// of its own, so any number of control surfaces can share it.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub async fn create_tunnel(
        &self,
        definition: TunnelDefinition,
    ) -> Result<TunnelRecord, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Create { definition, reply })
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)?
    }

    pub async fn update_tunnel(
        &self,
        id: &str,
        patch: TunnelPatch,
    ) -> Result<TunnelRecord, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Update {
                id: id.to_string(),
                patch,
                reply,
            })
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)?
    }

    pub async fn delete_tunnel(&self, id: &str) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Delete {
                id: id.to_string(),
                reply,
            })
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)?
    }

    pub async fn enable_tunnel(&self, id: &str) -> Result<TunnelRecord, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Enable {
                id: id.to_string(),
                reply,
            })
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)?
    }

    pub async fn disable_tunnel(&self, id: &str) -> Result<TunnelRecord, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Disable {
                id: id.to_string(),
                reply,
            })
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)?
    }

    pub async fn tunnel_status(&self, id: &str) -> Result<TunnelRecord, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Status {
                id: id.to_string(),
                reply,
            })
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)?
    }

    pub async fn list_tunnels(&self) -> Result<Vec<TunnelRecord>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::List { reply })
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)
    }

    pub async fn recent_events(&self) -> Result<Vec<TunnelEvent>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::RecentEvents { reply })
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)
    }

    /// Stop every supervisor and end the orchestrator loop. Resolves once
    /// shutdown has completed.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Shutdown { reply })
            .await
            .map_err(|_| EngineError::ShuttingDown)?;
        rx.await.map_err(|_| EngineError::ShuttingDown)
    }
}
