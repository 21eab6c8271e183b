//! Orchestrator: reconciles supervisors with the registry
//!
//! Owns the live supervisor map and processes every command in one loop.
//! Starting is spawning a supervisor task; stopping is a cancel signal, a
//! bounded wait on the task, and an abort as the last resort.

use crate::commands::EngineCommand;
use crate::definition::{TunnelDefinition, TunnelPatch};
use crate::error::EngineError;
use crate::events::EventJournal;
use crate::registry::Registry;
use crate::session::SshConnector;
use crate::status::{TunnelRecord, TunnelRuntimeStatus};
use crate::supervisor::Supervisor;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

/// Engine-wide timing and policy knobs
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Outer bound on one connect attempt
    pub connect_timeout: Duration,
    /// Consecutive failed probes before the session is considered lost
    pub probe_failure_threshold: u32,
    /// How long a stopping supervisor may spend closing its session
    pub stop_grace: Duration,
    /// How long shutdown waits for all supervisors before aborting
    pub shutdown_timeout: Duration,
    /// First reconnect delay; doubles per consecutive failure
    pub base_backoff: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            probe_failure_threshold: 3,
            stop_grace: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            base_backoff: crate::backoff::DEFAULT_BASE_BACKOFF,
        }
    }
}

struct SupervisorHandle {
    cancel_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

pub struct Orchestrator {
    registry: Arc<Registry>,
    connector: Arc<dyn SshConnector>,
    events: Arc<EventJournal>,
    settings: EngineSettings,
    supervisors: HashMap<String, SupervisorHandle>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<Registry>,
        connector: Arc<dyn SshConnector>,
        events: Arc<EventJournal>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            registry,
            connector,
            events,
            settings,
            supervisors: HashMap::new(),
        }
    }

    /// Process commands until shutdown (or until every handle is dropped),
    /// then stop all supervisors.
    pub async fn run(mut self, mut commands: mpsc::Receiver<EngineCommand>) {
        self.start_enabled().await;

        let mut shutdown_reply: Option<oneshot::Sender<()>> = None;
        while let Some(command) = commands.recv().await {
            match command {
                EngineCommand::Create { definition, reply } => {
                    let _ = reply.send(self.create(definition).await);
                }
                EngineCommand::Update { id, patch, reply } => {
                    let _ = reply.send(self.update(&id, patch).await);
                }
                EngineCommand::Delete { id, reply } => {
                    let _ = reply.send(self.delete(&id).await);
                }
                EngineCommand::Enable { id, reply } => {
                    let _ = reply.send(self.enable(&id).await);
                }
                EngineCommand::Disable { id, reply } => {
                    let _ = reply.send(self.disable(&id).await);
                }
                EngineCommand::Status { id, reply } => {
                    let _ = reply.send(self.registry.get(&id).await);
                }
                EngineCommand::List { reply } => {
                    let _ = reply.send(self.registry.list().await);
                }
                EngineCommand::RecentEvents { reply } => {
                    let _ = reply.send(self.events.recent());
                }
                EngineCommand::Shutdown { reply } => {
                    shutdown_reply = Some(reply);
                    break;
                }
            }
        }

        self.stop_all().await;
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
        info!("Engine stopped");
    }

    /// One supervisor per enabled definition, run at startup
    async fn start_enabled(&mut self) {
        let records = self.registry.list().await;
        let enabled: Vec<TunnelDefinition> = records
            .into_iter()
            .filter(|r| r.definition.enabled)
            .map(|r| r.definition)
            .collect();
        if !enabled.is_empty() {
            info!("Starting {} enabled tunnel(s)", enabled.len());
        }
        for definition in enabled {
            self.spawn_supervisor(definition);
        }
    }

    async fn create(&mut self, definition: TunnelDefinition) -> Result<TunnelRecord, EngineError> {
        let record = self.registry.add(definition).await?;
        info!("[{}] tunnel created", record.definition.id);
        if record.definition.enabled {
            self.spawn_supervisor(record.definition.clone());
        }
        Ok(record)
    }

    async fn update(&mut self, id: &str, patch: TunnelPatch) -> Result<TunnelRecord, EngineError> {
        if patch.is_empty() {
            return self.registry.get(id).await;
        }
        let updated = self.registry.update(id, &patch).await?;
        info!("[{}] tunnel updated", id);

        // No hot-patching: connection parameter changes restart the
        // supervisor with the new definition.
        if patch.touches_connection() {
            self.stop_supervisor(id).await;
            if updated.enabled {
                self.spawn_supervisor(updated);
            }
        }
        self.registry.get(id).await
    }

    async fn delete(&mut self, id: &str) -> Result<(), EngineError> {
        // Stop first so the task cannot publish into a removed record.
        if self.registry.get(id).await.is_err() {
            return Err(EngineError::NotFound(id.to_string()));
        }
        self.stop_supervisor(id).await;
        self.registry.remove(id).await?;
        info!("[{}] tunnel deleted", id);
        Ok(())
    }

    async fn enable(&mut self, id: &str) -> Result<TunnelRecord, EngineError> {
        let definition = self.registry.set_enabled(id, true).await?;

        // Also restarts a tunnel parked in FailedPermanently: its task has
        // exited, so it looks stale here and gets a fresh spawn.
        let running = self
            .supervisors
            .get(id)
            .map(|h| !h.task.is_finished())
            .unwrap_or(false);
        if !running {
            self.supervisors.remove(id);
            self.spawn_supervisor(definition);
        }
        self.registry.get(id).await
    }

    async fn disable(&mut self, id: &str) -> Result<TunnelRecord, EngineError> {
        self.registry.set_enabled(id, false).await?;
        self.stop_supervisor(id).await;
        // A running supervisor publishes Stopped on its way out; one parked
        // in FailedPermanently already exited without doing so. Settle the
        // record either way.
        self.registry
            .update_status(id, |status| {
                *status = TunnelRuntimeStatus::stopped(status.last_error.take());
            })
            .await;
        self.registry.get(id).await
    }

    fn spawn_supervisor(&mut self, definition: TunnelDefinition) {
        let id = definition.id.clone();
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        let supervisor = Supervisor::new(
            definition,
            self.registry.clone(),
            self.connector.clone(),
            self.events.clone(),
            self.settings,
        );
        let task = tokio::spawn(supervisor.run(cancel_rx));
        self.supervisors.insert(id, SupervisorHandle { cancel_tx, task });
    }

    /// Cancel one supervisor and wait for it, aborting if it overstays the
    /// grace period. No-op when the id has no live task.
    async fn stop_supervisor(&mut self, id: &str) {
        let Some(mut handle) = self.supervisors.remove(id) else {
            return;
        };
        // Send may fail if the task already exited; that's fine.
        let _ = handle.cancel_tx.send(()).await;
        let grace = self.settings.stop_grace.saturating_mul(2);
        if timeout(grace, &mut handle.task).await.is_err() {
            warn!("[{}] supervisor did not stop within grace, aborting", id);
            handle.task.abort();
            let _ = handle.task.await;
            self.registry
                .update_status(id, |status| {
                    *status = TunnelRuntimeStatus::stopped(status.last_error.take());
                })
                .await;
        }
    }

    /// Stop every supervisor concurrently, abort stragglers after the
    /// shutdown timeout. Aborted sessions die with their tasks.
    async fn stop_all(&mut self) {
        if self.supervisors.is_empty() {
            return;
        }
        info!("Stopping {} tunnel supervisor(s)", self.supervisors.len());

        let mut stopping: Vec<(String, SupervisorHandle)> = self.supervisors.drain().collect();
        for (_, handle) in stopping.iter() {
            let _ = handle.cancel_tx.try_send(());
        }

        let joins = join_all(stopping.iter_mut().map(|(_, handle)| &mut handle.task));
        if timeout(self.settings.shutdown_timeout, joins).await.is_err() {
            for (id, handle) in stopping.iter() {
                if !handle.task.is_finished() {
                    warn!("[{}] supervisor still running at shutdown deadline, aborting", id);
                    handle.task.abort();
                }
            }
        }

        for (id, _) in stopping.iter() {
            self.registry
                .update_status(id, |status| {
                    *status = TunnelRuntimeStatus::stopped(status.last_error.take());
                })
                .await;
        }
    }
}
