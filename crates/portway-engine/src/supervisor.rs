//! Per-tunnel supervisor task
//!
//! Owns one tunnel's lifecycle end to end: open a session, gate Established
//! on the first probe, run the keepalive loop, tear down and back off on
//! loss, park on permanent failure. Every await point also listens on the
//! cancel channel so disable/delete/shutdown interrupt promptly.
//!
//! The supervisor is the only writer of its tunnel's runtime status; each
//! transition is mirrored into the registry and published to the event
//! journal.

use crate::backoff::BackoffPolicy;
use crate::definition::TunnelDefinition;
use crate::error::SessionError;
use crate::events::{EventJournal, TunnelEvent};
use crate::orchestrator::EngineSettings;
use crate::registry::Registry;
use crate::session::{ForwardSpec, SshConnector, SshSession};
use crate::status::{StatusError, TunnelRuntimeStatus, TunnelState};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(PartialEq)]
enum LoopControl {
    Retry,
    Exit,
}

enum Teardown {
    Cancelled,
    Lost(SessionError),
}

pub(crate) struct Supervisor {
    definition: TunnelDefinition,
    registry: Arc<Registry>,
    connector: Arc<dyn SshConnector>,
    events: Arc<EventJournal>,
    settings: EngineSettings,
}

impl Supervisor {
    pub(crate) fn new(
        definition: TunnelDefinition,
        registry: Arc<Registry>,
        connector: Arc<dyn SshConnector>,
        events: Arc<EventJournal>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            definition,
            registry,
            connector,
            events,
            settings,
        }
    }

    pub(crate) async fn run(self, mut cancel_rx: mpsc::Receiver<()>) {
        let id = self.definition.id.clone();
        let spec = ForwardSpec::from_definition(&self.definition);
        let backoff = BackoffPolicy::new(self.settings.base_backoff, self.definition.max_backoff());
        let probe_timeout = self.definition.probe_timeout();
        let keep_alive = self.definition.keep_alive_interval();
        let mut status = TunnelRuntimeStatus::default();

        debug!("[{}] supervisor starting", id);
        loop {
            self.transition(&mut status, TunnelState::Connecting, None).await;
            info!("[{}] connecting to {}", id, self.definition.remote);

            let opened = tokio::select! {
                _ = cancel_rx.recv() => {
                    self.finish_stopped(&mut status).await;
                    return;
                }
                result = timeout(self.settings.connect_timeout, self.connector.open(&spec)) => {
                    match result {
                        Ok(inner) => inner,
                        Err(_) => Err(SessionError::Timeout),
                    }
                }
            };

            let mut session = match opened {
                Ok(session) => session,
                Err(err) => {
                    if self.fail_or_backoff(&mut status, err, &backoff, &mut cancel_rx).await
                        == LoopControl::Exit
                    {
                        return;
                    }
                    continue;
                }
            };

            // The session is not Established until the first probe succeeds;
            // ssh can hold a listener open while the far side is broken.
            let first_probe = tokio::select! {
                _ = cancel_rx.recv() => {
                    self.close_session(&id, &mut session).await;
                    self.finish_stopped(&mut status).await;
                    return;
                }
                result = timeout(probe_timeout, session.probe()) => flatten_probe(result),
            };
            if let Err(err) = first_probe {
                self.close_session(&id, &mut session).await;
                if self.fail_or_backoff(&mut status, err, &backoff, &mut cancel_rx).await
                    == LoopControl::Exit
                {
                    return;
                }
                continue;
            }

            status.connected_since = Some(Utc::now());
            status.consecutive_failures = 0;
            self.transition(&mut status, TunnelState::Established, None).await;
            info!("[{}] ✅ tunnel established", id);

            let teardown = self
                .health_loop(&id, &mut status, session.as_mut(), probe_timeout, keep_alive, &mut cancel_rx)
                .await;
            self.close_session(&id, &mut session).await;

            match teardown {
                Teardown::Cancelled => {
                    self.finish_stopped(&mut status).await;
                    return;
                }
                Teardown::Lost(err) => {
                    if self.fail_or_backoff(&mut status, err, &backoff, &mut cancel_rx).await
                        == LoopControl::Exit
                    {
                        return;
                    }
                }
            }
        }
    }

    /// Probe on every keepalive tick until the session is lost or we are
    /// cancelled. Strikes accumulate across consecutive failures and reset on
    /// success.
    async fn health_loop(
        &self,
        id: &str,
        status: &mut TunnelRuntimeStatus,
        session: &mut dyn SshSession,
        probe_timeout: Duration,
        keep_alive: Duration,
        cancel_rx: &mut mpsc::Receiver<()>,
    ) -> Teardown {
        let threshold = self.settings.probe_failure_threshold.max(1);
        let mut strikes: u32 = 0;
        // First tick lands one interval from now; the gating probe just ran.
        let mut ticker = interval_at(Instant::now() + keep_alive, keep_alive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel_rx.recv() => return Teardown::Cancelled,
                _ = ticker.tick() => {}
            }

            let probed = tokio::select! {
                _ = cancel_rx.recv() => return Teardown::Cancelled,
                result = timeout(probe_timeout, session.probe()) => flatten_probe(result),
            };

            match probed {
                Ok(()) => {
                    if strikes > 0 {
                        debug!("[{}] probe recovered after {} strike(s)", id, strikes);
                        strikes = 0;
                        status.consecutive_failures = 0;
                        self.transition(status, TunnelState::Established, None).await;
                    }
                }
                Err(err) => {
                    strikes += 1;
                    status.last_error = Some(StatusError::now(err.to_string()));
                    if strikes >= threshold {
                        warn!("[{}] session lost after {} failed probe(s): {}", id, strikes, err);
                        return Teardown::Lost(err);
                    }
                    warn!("[{}] keepalive probe failed ({}/{}): {}", id, strikes, threshold, err);
                    self.transition(
                        status,
                        TunnelState::Degraded,
                        Some(format!("keepalive probe failed ({}/{})", strikes, threshold)),
                    )
                    .await;
                }
            }
        }
    }

    /// After a failed attempt or a lost session: park permanently on a
    /// non-recoverable error, otherwise wait out the backoff delay.
    async fn fail_or_backoff(
        &self,
        status: &mut TunnelRuntimeStatus,
        err: SessionError,
        backoff: &BackoffPolicy,
        cancel_rx: &mut mpsc::Receiver<()>,
    ) -> LoopControl {
        let id = &self.definition.id;
        status.last_error = Some(StatusError::now(err.to_string()));
        status.connected_since = None;

        if err.is_non_recoverable() {
            error!("[{}] 🚫 permanent failure, supervision ends: {}", id, err);
            self.transition(status, TunnelState::FailedPermanently, Some(err.to_string()))
                .await;
            return LoopControl::Exit;
        }

        status.consecutive_failures += 1;
        let delay = backoff.next_delay(status.consecutive_failures);
        warn!(
            "[{}] 🔄 {} — reconnecting in {}s (failure #{})",
            id,
            err,
            delay.as_secs(),
            status.consecutive_failures
        );
        self.transition(
            status,
            TunnelState::Reconnecting,
            Some(format!("{}; retry in {}s", err, delay.as_secs())),
        )
        .await;

        tokio::select! {
            _ = cancel_rx.recv() => {
                self.finish_stopped(status).await;
                LoopControl::Exit
            }
            _ = sleep(delay) => LoopControl::Retry,
        }
    }

    async fn close_session(&self, id: &str, session: &mut Box<dyn SshSession>) {
        let closed = timeout(self.settings.stop_grace, session.close())
            .await
            .unwrap_or_else(|_| Err(SessionError::Closed("close timed out".to_string())));
        if let Err(e) = closed {
            warn!("[{}] session close failed: {}", id, e);
        }
    }

    /// Publish the final Stopped status and end the task
    async fn finish_stopped(&self, status: &mut TunnelRuntimeStatus) {
        *status = TunnelRuntimeStatus::stopped(status.last_error.take());
        let snapshot = status.clone();
        self.registry
            .update_status(&self.definition.id, move |s| *s = snapshot)
            .await;
        self.events
            .publish(TunnelEvent::new(&self.definition.id, TunnelState::Stopped, None));
        info!("[{}] supervisor stopped", self.definition.id);
    }

    async fn transition(
        &self,
        status: &mut TunnelRuntimeStatus,
        state: TunnelState,
        detail: Option<String>,
    ) {
        status.state = state;
        let snapshot = status.clone();
        self.registry
            .update_status(&self.definition.id, move |s| *s = snapshot)
            .await;
        self.events
            .publish(TunnelEvent::new(&self.definition.id, state, detail));
    }
}

fn flatten_probe(
    result: Result<Result<(), SessionError>, tokio::time::error::Elapsed>,
) -> Result<(), SessionError> {
    match result {
        Ok(inner) => inner,
        Err(_) => Err(SessionError::Unresponsive),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ForwardDirection, RemoteHost};
    use crate::session::testing::{OpenOutcome, ProbeOutcome, ScriptedConnector};
    use crate::store::TunnelStore;
    use tempfile::TempDir;

    struct Fixture {
        registry: Arc<Registry>,
        connector: Arc<ScriptedConnector>,
        events: Arc<EventJournal>,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = TunnelStore::open(temp.path()).unwrap();
        Fixture {
            registry: Arc::new(Registry::load(store).unwrap()),
            connector: Arc::new(ScriptedConnector::new()),
            events: Arc::new(EventJournal::default()),
            _temp: temp,
        }
    }

    fn definition(id: &str) -> TunnelDefinition {
        TunnelDefinition {
            id: id.to_string(),
            name: None,
            description: None,
            remote: RemoteHost {
                host: "bastion.example.net".to_string(),
                ssh_port: 22,
                username: "deploy".to_string(),
                credential_ref: "deploy-key".to_string(),
            },
            bind_addr: "127.0.0.1".to_string(),
            local_port: 8022,
            remote_port: 5432,
            direction: ForwardDirection::LocalToRemote,
            enabled: true,
            keep_alive_interval_secs: 30,
            max_backoff_secs: 60,
            created_at: Utc::now(),
        }
    }

    async fn spawn(
        fx: &Fixture,
        def: TunnelDefinition,
    ) -> (tokio::task::JoinHandle<()>, mpsc::Sender<()>) {
        fx.registry.add(def.clone()).await.unwrap();
        let supervisor = Supervisor::new(
            def,
            fx.registry.clone(),
            fx.connector.clone(),
            fx.events.clone(),
            EngineSettings::default(),
        );
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        (tokio::spawn(supervisor.run(cancel_rx)), cancel_tx)
    }

    async fn next_state(rx: &mut tokio::sync::broadcast::Receiver<TunnelEvent>) -> TunnelState {
        timeout(Duration::from_secs(600), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
            .state
    }

    #[tokio::test(start_paused = true)]
    async fn establishes_then_stops_on_cancel() {
        let fx = fixture();
        let mut rx = fx.events.subscribe();
        let (task, cancel_tx) = spawn(&fx, definition("pg")).await;

        assert_eq!(next_state(&mut rx).await, TunnelState::Connecting);
        assert_eq!(next_state(&mut rx).await, TunnelState::Established);

        let record = fx.registry.get("pg").await.unwrap();
        assert!(record.status.connected_since.is_some());
        assert_eq!(record.status.consecutive_failures, 0);

        cancel_tx.send(()).await.unwrap();
        assert_eq!(next_state(&mut rx).await, TunnelState::Stopped);
        timeout(Duration::from_secs(30), task).await.unwrap().unwrap();

        // Exactly one close for the one session that was opened.
        assert_eq!(fx.connector.open_count(), 1);
        assert_eq!(fx.connector.total_closes(), 1);
        let record = fx.registry.get("pg").await.unwrap();
        assert_eq!(record.status.state, TunnelState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_open_failure_backs_off_then_recovers() {
        let fx = fixture();
        fx.connector
            .push_refusal(SessionError::Unreachable("no route".to_string()));
        let mut rx = fx.events.subscribe();
        let (task, cancel_tx) = spawn(&fx, definition("pg")).await;

        assert_eq!(next_state(&mut rx).await, TunnelState::Connecting);
        assert_eq!(next_state(&mut rx).await, TunnelState::Reconnecting);
        assert_eq!(next_state(&mut rx).await, TunnelState::Connecting);
        assert_eq!(next_state(&mut rx).await, TunnelState::Established);

        let record = fx.registry.get("pg").await.unwrap();
        assert_eq!(record.status.consecutive_failures, 0);
        let last_error = record.status.last_error.expect("failure must be recorded");
        assert!(last_error.message.contains("no route"));

        cancel_tx.send(()).await.unwrap();
        timeout(Duration::from_secs(30), task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn auth_rejection_parks_permanently_without_retries() {
        let fx = fixture();
        fx.connector
            .push_refusal(SessionError::AuthRejected("bad key".to_string()));
        let mut rx = fx.events.subscribe();
        let (task, _cancel_tx) = spawn(&fx, definition("pg")).await;

        assert_eq!(next_state(&mut rx).await, TunnelState::Connecting);
        assert_eq!(next_state(&mut rx).await, TunnelState::FailedPermanently);
        timeout(Duration::from_secs(30), task).await.unwrap().unwrap();

        // A long quiet period passes with no further attempts.
        sleep(Duration::from_secs(3600)).await;
        assert_eq!(fx.connector.open_count(), 1);

        let record = fx.registry.get("pg").await.unwrap();
        assert_eq!(record.status.state, TunnelState::FailedPermanently);
        assert!(record.status.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn three_probe_failures_degrade_then_reconnect() {
        let fx = fixture();
        // First probe gates Established, then three strikes.
        fx.connector.push_session(vec![
            ProbeOutcome::Succeed,
            ProbeOutcome::Fail(SessionError::Unresponsive),
            ProbeOutcome::Fail(SessionError::Unresponsive),
            ProbeOutcome::Fail(SessionError::Unresponsive),
        ]);
        let mut rx = fx.events.subscribe();
        let (task, cancel_tx) = spawn(&fx, definition("pg")).await;

        assert_eq!(next_state(&mut rx).await, TunnelState::Connecting);
        assert_eq!(next_state(&mut rx).await, TunnelState::Established);
        assert_eq!(next_state(&mut rx).await, TunnelState::Degraded);
        assert_eq!(next_state(&mut rx).await, TunnelState::Degraded);
        assert_eq!(next_state(&mut rx).await, TunnelState::Reconnecting);
        // Second session comes from the exhausted script: all probes succeed.
        assert_eq!(next_state(&mut rx).await, TunnelState::Connecting);
        assert_eq!(next_state(&mut rx).await, TunnelState::Established);

        let record = fx.registry.get("pg").await.unwrap();
        assert_eq!(record.status.consecutive_failures, 0);
        assert_eq!(fx.connector.total_closes(), 1);

        cancel_tx.send(()).await.unwrap();
        timeout(Duration::from_secs(30), task).await.unwrap().unwrap();
        assert_eq!(fx.connector.total_closes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_session_recovers_on_probe_success() {
        let fx = fixture();
        fx.connector.push_session(vec![
            ProbeOutcome::Succeed,
            ProbeOutcome::Fail(SessionError::Unresponsive),
            ProbeOutcome::Succeed,
        ]);
        let mut rx = fx.events.subscribe();
        let (task, cancel_tx) = spawn(&fx, definition("pg")).await;

        assert_eq!(next_state(&mut rx).await, TunnelState::Connecting);
        assert_eq!(next_state(&mut rx).await, TunnelState::Established);
        assert_eq!(next_state(&mut rx).await, TunnelState::Degraded);
        assert_eq!(next_state(&mut rx).await, TunnelState::Established);

        // One session the whole way through.
        assert_eq!(fx.connector.open_count(), 1);

        cancel_tx.send(()).await.unwrap();
        timeout(Duration::from_secs(30), task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_hung_connect() {
        let fx = fixture();
        fx.connector.push(OpenOutcome::Hang);
        let mut rx = fx.events.subscribe();
        let (task, cancel_tx) = spawn(&fx, definition("pg")).await;

        assert_eq!(next_state(&mut rx).await, TunnelState::Connecting);
        cancel_tx.send(()).await.unwrap();
        assert_eq!(next_state(&mut rx).await, TunnelState::Stopped);
        timeout(Duration::from_secs(30), task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn hung_probe_counts_as_strike() {
        let fx = fixture();
        fx.connector.push_session(vec![
            ProbeOutcome::Succeed,
            ProbeOutcome::Hang,
        ]);
        let mut rx = fx.events.subscribe();
        let (task, cancel_tx) = spawn(&fx, definition("pg")).await;

        assert_eq!(next_state(&mut rx).await, TunnelState::Connecting);
        assert_eq!(next_state(&mut rx).await, TunnelState::Established);
        // The hung probe times out and registers as a strike.
        assert_eq!(next_state(&mut rx).await, TunnelState::Degraded);

        cancel_tx.send(()).await.unwrap();
        timeout(Duration::from_secs(30), task).await.unwrap().unwrap();
    }
}
