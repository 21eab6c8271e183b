//! Deterministic session fakes for scenario tests
//!
//! `ScriptedConnector` replays a queue of open outcomes; each opened session
//! replays its own queue of probe outcomes and then succeeds forever. Opens
//! and closes are counted so tests can assert exactly one close per session
//! and the absence of retries after a permanent failure.

use super::{ForwardSpec, SshConnector, SshSession};
use crate::error::SessionError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

/// Scripted result of one probe
#[derive(Debug)]
pub enum ProbeOutcome {
    Succeed,
    Fail(SessionError),
    /// Never completes on its own; exercises probe timeouts and cancellation
    Hang,
}

/// Scripted result of one open attempt
#[derive(Debug)]
pub enum OpenOutcome {
    /// Yield a session that replays these probe outcomes, then succeeds
    Session(Vec<ProbeOutcome>),
    Refuse(SessionError),
    /// Never completes on its own; exercises connect timeouts and cancellation
    Hang,
}

/// Per-session observation counters, shared with the test
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub probes: AtomicUsize,
    pub closes: AtomicUsize,
}

/// Connector replaying a script of open outcomes. With an empty script every
/// open yields a session whose probes always succeed.
#[derive(Default)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<OpenOutcome>>,
    opens: AtomicUsize,
    sessions: Mutex<Vec<Arc<SessionCounters>>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, outcome: OpenOutcome) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
    }

    /// Queue a successful open whose session replays `probes`
    pub fn push_session(&self, probes: Vec<ProbeOutcome>) {
        self.push(OpenOutcome::Session(probes));
    }

    /// Queue a failed open
    pub fn push_refusal(&self, error: SessionError) {
        self.push(OpenOutcome::Refuse(error));
    }

    /// Number of open attempts observed so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Counters for every session handed out, in open order
    pub fn sessions(&self) -> Vec<Arc<SessionCounters>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn total_closes(&self) -> usize {
        self.sessions()
            .iter()
            .map(|s| s.closes.load(Ordering::SeqCst))
            .sum()
    }

    fn make_session(&self, probes: Vec<ProbeOutcome>) -> Box<dyn SshSession> {
        let counters = Arc::new(SessionCounters::default());
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(counters.clone());
        Box::new(ScriptedSession {
            probes: probes.into(),
            counters,
        })
    }
}

#[async_trait]
impl SshConnector for ScriptedConnector {
    async fn open(&self, _spec: &ForwardSpec) -> Result<Box<dyn SshSession>, SessionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match outcome {
            None => Ok(self.make_session(Vec::new())),
            Some(OpenOutcome::Session(probes)) => Ok(self.make_session(probes)),
            Some(OpenOutcome::Refuse(error)) => Err(error),
            Some(OpenOutcome::Hang) => {
                sleep(Duration::from_secs(3600)).await;
                Err(SessionError::Timeout)
            }
        }
    }
}

struct ScriptedSession {
    probes: VecDeque<ProbeOutcome>,
    counters: Arc<SessionCounters>,
}

#[async_trait]
impl SshSession for ScriptedSession {
    async fn probe(&mut self) -> Result<(), SessionError> {
        self.counters.probes.fetch_add(1, Ordering::SeqCst);
        match self.probes.pop_front() {
            None | Some(ProbeOutcome::Succeed) => Ok(()),
            Some(ProbeOutcome::Fail(error)) => Err(error),
            Some(ProbeOutcome::Hang) => {
                sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
