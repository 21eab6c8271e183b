//! Portway engine: supervised SSH port-forwarding tunnels
//!
//! The engine keeps a durable registry of tunnel definitions and runs one
//! supervisor task per enabled tunnel. A supervisor opens an SSH forwarding
//! session through the [`session::SshConnector`] capability, gates
//! Established on a first successful probe, health-checks on a keepalive
//! interval, and reconnects with jittered exponential backoff. Auth
//! rejections, host key mismatches, and bound local ports park a tunnel in
//! FailedPermanently until it is explicitly re-enabled.
//!
//! Control surfaces talk to the engine through [`EngineHandle`], a cloneable
//! facade over one command loop, which serializes all mutations.
//!
//! ```no_run
//! use portway_engine::{
//!     command_channel, EngineSettings, EventJournal, Orchestrator, Registry, TunnelStore,
//! };
//! use portway_engine::session::openssh::{DirCredentialResolver, OpenSshConnector};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), portway_engine::EngineError> {
//! let store = TunnelStore::open("/var/lib/portway/tunnels")?;
//! let registry = Arc::new(Registry::load(store)?);
//! let events = Arc::new(EventJournal::default());
//! let connector = Arc::new(OpenSshConnector::new(
//!     Arc::new(DirCredentialResolver::new("/var/lib/portway/keys")),
//!     "/var/lib/portway/logs",
//! ));
//! let (handle, commands) = command_channel();
//! let orchestrator = Orchestrator::new(registry, connector, events, EngineSettings::default());
//! tokio::spawn(orchestrator.run(commands));
//!
//! let tunnels = handle.list_tunnels().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod commands;
pub mod definition;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod registry;
pub mod session;
pub mod status;
pub mod store;
mod supervisor;

pub use backoff::BackoffPolicy;
pub use commands::{command_channel, EngineCommand, EngineHandle};
pub use definition::{
    ForwardDirection, RemoteHost, TunnelDefinition, TunnelPatch, DEFAULT_BIND_ADDR,
    DEFAULT_KEEP_ALIVE_SECS, DEFAULT_MAX_BACKOFF_SECS, DEFAULT_SSH_PORT,
};
pub use error::{EngineError, SessionError};
pub use events::{EventJournal, TunnelEvent};
pub use orchestrator::{EngineSettings, Orchestrator};
pub use registry::Registry;
pub use status::{StatusError, TunnelRecord, TunnelRuntimeStatus, TunnelState};
pub use store::TunnelStore;
