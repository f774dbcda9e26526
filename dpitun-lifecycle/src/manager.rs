//! The connection manager: one task owning the engine slot, its timers and
//! the system proxy.
//!
//! Callers never touch that state directly. They send requests through a
//! [`ManagerHandle`], and the owner loop in [`ConnectionManager::run`]
//! serializes them with engine output, process exit, probe results and the
//! three deadlines (fail-safe, port retry, reconnect). A timer is "cancelled"
//! by clearing its deadline, so at most one of each can ever be live.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use dpitun_core::{BindConfig, BindConfigProvider, BindError, DnsProvider, Settings};
use futures::future::Either;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::classifier::{LifecycleEvent, classify};
use crate::command::EngineCommand;
use crate::error::{EngineError, Result};
use crate::journal::Journal;
use crate::launcher::{EngineExit, EngineLauncher, EngineProcess, OutputLine};
use crate::ports::PortNegotiation;
use crate::probe::ReadinessProbe;
use crate::proxy::{ProxySynchronizer, SystemProxy};
use crate::retry_state::{ReconnectAction, RetryState};
use crate::session::{LifecyclePhase, SessionInfo, Snapshot};
use crate::status::{ConnectionStatus, StatusSink};

const REQUEST_CHANNEL_CAPACITY: usize = 32;

/// Bounds for the timers the manager arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Time after spawn before the session is optimistically marked connected.
    pub failsafe: Duration,
    /// Pause between a bind conflict and the next port.
    pub port_retry: Duration,
    /// How long a kill may take before the engine is abandoned.
    pub kill_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            failsafe: Duration::from_secs(2),
            port_retry: Duration::from_secs(1),
            kill_timeout: Duration::from_secs(2),
        }
    }
}

/// External collaborators of the manager.
#[derive(Clone)]
pub struct Collaborators {
    pub launcher: Arc<dyn EngineLauncher>,
    pub probe: Arc<dyn ReadinessProbe>,
    pub proxy: Arc<dyn SystemProxy>,
    pub bind: Arc<dyn BindConfigProvider>,
    pub status: Arc<dyn StatusSink>,
}

enum Request {
    Connect {
        reply: oneshot::Sender<Result<SessionInfo>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Journal {
        reply: oneshot::Sender<Journal>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to a running [`ConnectionManager`].
#[derive(Clone)]
pub struct ManagerHandle {
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ManagerHandle {
    /// Start a connection, or join the one in progress.
    ///
    /// Resolves once the session is connected, or with the error that ended
    /// the attempt. Reconnects scheduled in between do not resolve it.
    pub async fn connect(&self) -> Result<SessionInfo> {
        self.request(|reply| Request::Connect { reply }).await?
    }

    /// Stop the engine and clear the system proxy. Never reconnects.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Request::Disconnect { reply }).await
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.request(|reply| Request::Snapshot { reply }).await
    }

    pub async fn journal(&self) -> Result<Journal> {
        self.request(|reply| Request::Journal { reply }).await
    }

    /// Stop everything and end the manager task.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Request::Shutdown { reply }).await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| EngineError::ManagerClosed)?;
        rx.await.map_err(|_| EngineError::ManagerClosed)
    }
}

/// The bind decision shared by every attempt of one connect chain.
#[derive(Debug, Clone)]
struct Chain {
    requested_port: u16,
    bind: BindConfig,
}

struct PendingPortRetry {
    at: Instant,
    negotiation: PortNegotiation,
    chain: Chain,
}

struct ActiveSession {
    info: SessionInfo,
    process: EngineProcess,
    negotiation: PortNegotiation,
    chain: Chain,
    /// A ready line was seen and is being probed.
    ready_claimed: bool,
    probe: Option<JoinHandle<bool>>,
    failsafe_at: Option<Instant>,
    /// The fail-safe fired while a probe was in flight.
    failsafe_due: bool,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        if let Some(probe) = self.probe.take() {
            probe.abort();
        }
    }
}

enum Wake {
    Request(Request),
    RequestsClosed,
    Line(OutputLine),
    OutputClosed,
    Exit(EngineExit),
    Probe(bool),
    PortRetry,
    Reconnect,
    FailSafe,
}

pub struct ConnectionManager {
    launcher: Arc<dyn EngineLauncher>,
    probe: Arc<dyn ReadinessProbe>,
    bind: Arc<dyn BindConfigProvider>,
    status_sink: Arc<dyn StatusSink>,
    proxy: ProxySynchronizer,
    settings: watch::Receiver<Settings>,
    timings: Timings,
    requests: mpsc::Receiver<Request>,
    status_tx: watch::Sender<ConnectionStatus>,

    phase: LifecyclePhase,
    retry: RetryState,
    session: Option<ActiveSession>,
    port_retry: Option<PendingPortRetry>,
    reconnect_at: Option<Instant>,
    waiters: Vec<oneshot::Sender<Result<SessionInfo>>>,
    journal: Journal,
}

impl ConnectionManager {
    pub fn new(
        collaborators: Collaborators,
        settings: watch::Receiver<Settings>,
        timings: Timings,
    ) -> (Self, ManagerHandle) {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);

        let manager = Self {
            launcher: collaborators.launcher,
            probe: collaborators.probe,
            bind: collaborators.bind,
            status_sink: collaborators.status,
            proxy: ProxySynchronizer::new(collaborators.proxy),
            settings,
            timings,
            requests: request_rx,
            status_tx,
            phase: LifecyclePhase::Idle,
            retry: RetryState::default(),
            session: None,
            port_retry: None,
            reconnect_at: None,
            waiters: Vec::new(),
            journal: Journal::default(),
        };
        let handle = ManagerHandle {
            requests: request_tx,
            status: status_rx,
        };
        (manager, handle)
    }

    /// Drive the lifecycle until shutdown is requested or every handle is
    /// dropped. The proxy is cleared on the way in and on the way out.
    pub async fn run(mut self) {
        if let Err(e) = self.proxy.clear().await {
            warn!("Startup proxy cleanup failed: {}", e);
        }
        self.report(ConnectionStatus::Disconnected);

        loop {
            match self.next_wake().await {
                Wake::Request(Request::Shutdown { reply }) => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
                Wake::RequestsClosed => {
                    debug!("All manager handles dropped");
                    self.shutdown().await;
                    break;
                }
                Wake::Request(request) => self.on_request(request).await,
                Wake::Line(line) => self.on_line(line).await,
                Wake::OutputClosed => {
                    if let Some(session) = self.session.as_mut() {
                        session.process.output = None;
                    }
                }
                Wake::Exit(exit) => self.on_exit(exit).await,
                Wake::Probe(ok) => self.on_probe(ok).await,
                Wake::PortRetry => {
                    if let Some(retry) = self.port_retry.take() {
                        self.start_or_fail(retry.negotiation, retry.chain).await;
                    }
                }
                Wake::Reconnect => {
                    self.reconnect_at = None;
                    self.begin_chain().await;
                }
                Wake::FailSafe => self.on_failsafe().await,
            }
        }
        info!("Connection manager stopped");
    }

    async fn next_wake(&mut self) -> Wake {
        let failsafe = self.session.as_ref().and_then(|s| s.failsafe_at);
        let port_retry = self.port_retry.as_ref().map(|p| p.at);
        let reconnect = self.reconnect_at;

        let (output, exit, probe) = match self.session.as_mut() {
            Some(s) => (
                s.process.output.as_mut(),
                Some(&mut s.process.exit),
                s.probe.as_mut(),
            ),
            None => (None, None, None),
        };

        tokio::select! {
            biased;

            request = self.requests.recv() => match request {
                Some(request) => Wake::Request(request),
                None => Wake::RequestsClosed,
            },
            // Lines before exit: the launcher only reports the exit once
            // both pipes are drained.
            line = next_line(output) => match line {
                Some(line) => Wake::Line(line),
                None => Wake::OutputClosed,
            },
            exit = wait_exit(exit) => Wake::Exit(exit),
            ok = join_probe(probe) => Wake::Probe(ok),
            _ = make_deadline_future(port_retry) => Wake::PortRetry,
            _ = make_deadline_future(reconnect) => Wake::Reconnect,
            _ = make_deadline_future(failsafe) => Wake::FailSafe,
        }
    }

    async fn on_request(&mut self, request: Request) {
        match request {
            Request::Connect { reply } => self.on_connect(reply).await,
            Request::Disconnect { reply } => {
                self.on_disconnect().await;
                let _ = reply.send(());
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Request::Journal { reply } => {
                let _ = reply.send(self.journal.clone());
            }
            // Handled by the run loop.
            Request::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            phase: self.phase,
            session: self.session.as_ref().map(|s| s.info.clone()),
            attempt_count: self.retry.attempt_count(),
            max_attempts: self.retry.max_attempts(),
            proxy_port: self.proxy.applied(),
        }
    }

    async fn on_connect(&mut self, reply: oneshot::Sender<Result<SessionInfo>>) {
        self.retry.on_user_connect();
        self.reconnect_at = None;

        if let Some(session) = &self.session {
            if self.phase == LifecyclePhase::Connected {
                debug!("Connect requested while connected, returning active session");
                let _ = reply.send(Ok(session.info.clone()));
            } else {
                self.waiters.push(reply);
            }
            return;
        }

        self.waiters.push(reply);
        if self.port_retry.is_some() {
            return;
        }
        self.begin_chain().await;
    }

    async fn on_disconnect(&mut self) {
        self.retry.on_user_disconnect();
        self.reconnect_at = None;
        self.port_retry = None;

        if let Some(session) = self.session.take() {
            self.journal.info("Stopping engine");
            self.terminate(session).await;
        }
        self.finalize().await;
    }

    async fn shutdown(&mut self) {
        self.reconnect_at = None;
        self.port_retry = None;
        if let Some(session) = self.session.take() {
            self.terminate(session).await;
        }
        self.clear_proxy().await;
        self.retry.on_finalized();
        self.phase = LifecyclePhase::Idle;
        self.journal.info("Shut down");
        self.report(ConnectionStatus::Disconnected);
        self.fail_waiters(&EngineError::Cancelled);
    }

    /// Start a connect chain from the configured port.
    async fn begin_chain(&mut self) {
        let allow_lan = self.settings.borrow().lan_sharing;
        self.phase = LifecyclePhase::Connecting;

        let bind = match self.bind.negotiate(allow_lan).await {
            Ok(bind) => bind,
            Err(BindError::PortOutOfRange(port)) => {
                self.fail_chain(EngineError::NoAvailablePort {
                    last_port: port,
                    attempts: 0,
                })
                .await;
                return;
            }
        };
        let chain = Chain {
            requested_port: bind.port,
            bind,
        };
        self.start_or_fail(PortNegotiation::new(chain.requested_port), chain)
            .await;
    }

    async fn start_or_fail(&mut self, negotiation: PortNegotiation, chain: Chain) {
        if let Err(e) = self.start_attempt(negotiation, chain).await {
            self.fail_chain(e).await;
        }
    }

    async fn start_attempt(&mut self, negotiation: PortNegotiation, chain: Chain) -> Result<()> {
        let port = negotiation.check()?;
        if self.session.is_some() {
            debug!("Engine already running, not spawning another");
            return Ok(());
        }

        self.clear_proxy().await;

        let settings = self.settings.borrow().clone();
        let command = EngineCommand::build(
            &settings.engine,
            port,
            chain.bind.bind_address,
            settings.dns_override(),
            settings.dpi_method,
        );

        self.phase = LifecyclePhase::Connecting;
        self.journal.info(format!("Starting engine on port {port}"));
        self.report(ConnectionStatus::Connecting { port });

        let process = self.launcher.launch(&command).await?;
        info!("Engine started (pid {:?}): {}", process.pid(), command);

        let dns_override = match settings.dns.provider {
            DnsProvider::System => None,
            provider => Some(provider),
        };
        let info = SessionInfo {
            requested_port: chain.requested_port,
            bound_port: port,
            bind_address: chain.bind.bind_address,
            lan_endpoint: chain.bind.lan_endpoint(port),
            dns_override,
            ready_confirmed: false,
            optimistic: false,
            pid: process.pid(),
            started_at: Local::now(),
        };
        self.session = Some(ActiveSession {
            info,
            process,
            negotiation,
            chain,
            ready_claimed: false,
            probe: None,
            failsafe_at: Some(Instant::now() + self.timings.failsafe),
            failsafe_due: false,
        });
        Ok(())
    }

    async fn on_line(&mut self, line: OutputLine) {
        match classify(&line.text) {
            LifecycleEvent::Noise { line, visible } => {
                if visible {
                    self.journal.info(line);
                } else {
                    trace!("engine: {}", line);
                }
            }
            LifecycleEvent::GenericError { line } => self.journal.warn(line),
            LifecycleEvent::BindConflict { line, fatal } => {
                if fatal {
                    self.journal.error(line);
                    self.on_bind_conflict().await;
                } else {
                    self.journal.info(line);
                }
            }
            LifecycleEvent::Ready { line } => {
                self.journal.info(line);
                self.on_ready_claim();
            }
        }
    }

    fn on_ready_claim(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.ready_claimed || session.info.ready_confirmed {
            return;
        }
        session.ready_claimed = true;

        let probe = Arc::clone(&self.probe);
        let port = session.info.bound_port;
        debug!("Engine claims readiness, probing port {}", port);
        session.probe = Some(tokio::spawn(async move { probe.probe(port).await }));
    }

    async fn on_probe(&mut self, ok: bool) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.probe = None;
        let port = session.info.bound_port;

        if ok {
            if self.phase == LifecyclePhase::Connected {
                // Already connected by the fail-safe; upgrade without
                // touching the proxy again.
                session.info.ready_confirmed = true;
                session.info.optimistic = false;
                self.journal.info(format!("Port {port} confirmed ready"));
                return;
            }
            self.confirm(false).await;
            return;
        }

        session.ready_claimed = false;
        let due = session.failsafe_due;
        self.journal
            .warn(EngineError::ProbeTimeout { port }.to_string());
        if due {
            self.confirm(true).await;
        }
    }

    async fn on_failsafe(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.failsafe_at = None;
        if self.phase == LifecyclePhase::Connected || session.info.ready_confirmed {
            return;
        }
        if session.probe.is_some() {
            session.failsafe_due = true;
            return;
        }

        self.journal.warn(format!(
            "No readiness confirmation after {}s, assuming the engine is up",
            self.timings.failsafe.as_secs_f32()
        ));
        self.confirm(true).await;
    }

    /// Mark the session connected and point the system proxy at it.
    async fn confirm(&mut self, optimistic: bool) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.info.ready_confirmed = !optimistic;
        session.info.optimistic = optimistic;
        session.failsafe_at = None;
        session.failsafe_due = false;
        let info = session.info.clone();
        let port = info.bound_port;

        if let Err(e) = self.proxy.apply(port).await {
            self.journal
                .error(format!("Could not set the system proxy: {e}"));
        }

        self.retry.on_connected();
        self.phase = LifecyclePhase::Connected;
        self.journal
            .success(format!("Connected on {}", info.proxy_endpoint()));
        if let Some(lan) = info.lan_endpoint {
            self.journal
                .info(format!("LAN sharing: other devices can use {lan}"));
        }
        self.report(ConnectionStatus::Connected {
            port,
            dns: info.dns_override,
            lan: info.lan_endpoint,
            optimistic,
        });

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(info.clone()));
        }
    }

    async fn on_bind_conflict(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let port = session.info.bound_port;
        let negotiation = session.negotiation.next();
        let chain = session.chain.clone();

        warn!("{}", EngineError::PortBindConflict { port });
        self.terminate(session).await;
        self.clear_proxy().await;

        // Check the budget now so exhaustion surfaces without another wait.
        if let Err(e) = negotiation.check() {
            self.fail_chain(e).await;
            return;
        }

        self.phase = LifecyclePhase::Connecting;
        self.journal.warn(format!(
            "Port {port} is busy, retrying on {} in {}s",
            negotiation.port(),
            self.timings.port_retry.as_secs_f32()
        ));
        self.report(ConnectionStatus::Connecting {
            port: negotiation.port(),
        });
        self.port_retry = Some(PendingPortRetry {
            at: Instant::now() + self.timings.port_retry,
            negotiation,
            chain,
        });
    }

    async fn on_exit(&mut self, exit: EngineExit) {
        let Some(session) = self.session.take() else {
            return;
        };
        drop(session);
        debug!("Engine exited: {:?}", exit);

        if self.retry.user_intent_disconnect() {
            self.finalize().await;
            return;
        }

        self.clear_proxy().await;
        let err = if exit.is_clean() {
            self.journal.info("Engine stopped on its own (exit code 0)");
            EngineError::ProcessStopped
        } else {
            let err = EngineError::UnexpectedProcessExit { code: exit.code };
            self.journal.warn(err.to_string());
            err
        };
        self.phase = LifecyclePhase::Idle;
        self.report(ConnectionStatus::Disconnected);

        let auto_reconnect = self.settings.borrow().auto_reconnect;
        match self.retry.on_unexpected_exit(auto_reconnect) {
            ReconnectAction::None => {
                self.fail_waiters(&err);
            }
            ReconnectAction::Reconnect { delay, attempt } => {
                let max_attempts = self.retry.max_attempts();
                if delay.is_zero() {
                    self.journal.info(format!(
                        "Reconnecting now (attempt {attempt}/{max_attempts})"
                    ));
                    self.begin_chain().await;
                } else {
                    self.journal.info(format!(
                        "Reconnecting in {}s (attempt {attempt}/{max_attempts})",
                        delay.as_secs()
                    ));
                    self.phase = LifecyclePhase::Retrying;
                    self.report(ConnectionStatus::Retrying {
                        attempt,
                        max_attempts,
                        delay,
                    });
                    self.reconnect_at = Some(Instant::now() + delay);
                }
            }
            ReconnectAction::GiveUp { attempts } => {
                self.fail_chain(EngineError::MaxRetriesExceeded { attempts })
                    .await;
            }
        }
    }

    /// Clean end of a user-requested stop.
    async fn finalize(&mut self) {
        self.clear_proxy().await;
        self.retry.on_finalized();
        self.phase = LifecyclePhase::Idle;
        self.journal.info("Disconnected");
        self.report(ConnectionStatus::Disconnected);
        self.fail_waiters(&EngineError::Cancelled);
    }

    /// Terminal failure of the automatic flow. Only a user connect restarts.
    async fn fail_chain(&mut self, err: EngineError) {
        self.port_retry = None;
        self.reconnect_at = None;
        if let Some(session) = self.session.take() {
            self.terminate(session).await;
        }
        self.clear_proxy().await;
        self.retry.on_finalized();

        self.phase = LifecyclePhase::Failed;
        self.journal.error(err.to_string());
        if let Some(guidance) = err.guidance() {
            for line in guidance.lines() {
                self.journal.info(line);
            }
        }
        self.report(ConnectionStatus::Failed);
        self.fail_waiters(&err);
    }

    /// Kill the engine and wait a bounded time for it to go away.
    async fn terminate(&mut self, mut session: ActiveSession) {
        let pid = session.process.pid();
        if !session.process.kill() {
            debug!("Engine (pid {:?}) was already gone", pid);
        }
        match tokio::time::timeout(self.timings.kill_timeout, &mut session.process.exit).await {
            Ok(Ok(exit)) => debug!("Engine (pid {:?}) stopped: {:?}", pid, exit),
            Ok(Err(_)) => debug!("Engine (pid {:?}) exit channel closed", pid),
            Err(_) => warn!(
                "Engine (pid {:?}) did not exit within {:?}",
                pid, self.timings.kill_timeout
            ),
        }
    }

    async fn clear_proxy(&mut self) {
        if let Err(e) = self.proxy.clear().await {
            self.journal
                .warn(format!("Could not clear the system proxy: {e}"));
        }
    }

    fn fail_waiters(&mut self, err: &EngineError) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(err.duplicate()));
        }
    }

    fn report(&mut self, status: ConnectionStatus) {
        self.status_sink.report(&status);
        self.status_tx.send_replace(status);
    }
}

async fn next_line(output: Option<&mut mpsc::Receiver<OutputLine>>) -> Option<OutputLine> {
    match output {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_exit(exit: Option<&mut oneshot::Receiver<EngineExit>>) -> EngineExit {
    match exit {
        // A launcher that vanished without reporting counts as a crash.
        Some(rx) => rx.await.unwrap_or(EngineExit {
            code: None,
            killed: false,
        }),
        None => std::future::pending().await,
    }
}

async fn join_probe(probe: Option<&mut JoinHandle<bool>>) -> bool {
    match probe {
        Some(handle) => handle.await.unwrap_or(false),
        None => std::future::pending().await,
    }
}

fn make_deadline_future(
    deadline: Option<Instant>,
) -> Either<tokio::time::Sleep, std::future::Pending<()>> {
    match deadline {
        Some(d) => Either::Left(tokio::time::sleep_until(d)),
        None => Either::Right(std::future::pending()),
    }
}
