//! Connection lifecycle for the dpitun engine.
//!
//! A [`ConnectionManager`] supervises exactly one engine process at a time. It
//! classifies the engine's output, negotiates a free port, probes readiness,
//! keeps the system proxy in lock-step with the process and reconnects with
//! backoff after crashes.

pub mod classifier;
pub mod command;
pub mod error;
pub mod journal;
pub mod launcher;
pub mod manager;
pub mod ports;
pub mod probe;
pub mod proxy;
pub mod retry_state;
pub mod session;
pub mod status;

pub use classifier::{LifecycleEvent, classify};
pub use command::EngineCommand;
pub use error::{EngineError, Guidance, ProxyError, Result};
pub use journal::{Journal, JournalEntry, JournalLevel};
pub use launcher::{
    EngineExit, EngineLauncher, EngineProcess, OutputLine, OutputStream, ProcessLauncher,
};
pub use manager::{Collaborators, ConnectionManager, ManagerHandle, Timings};
pub use ports::PortNegotiation;
pub use probe::{HttpReadinessProbe, ReadinessProbe};
pub use proxy::{OsProxy, ProxyBackend, ProxySynchronizer, SystemProxy};
pub use retry_state::{ReconnectAction, RetryState, retry_delay};
pub use session::{LifecyclePhase, SessionInfo, Snapshot};
pub use status::{ConnectionStatus, LogStatusSink, StatusSink};
