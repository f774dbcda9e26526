//! Fault-injected collaborators for driving the connection manager in tests.

// Each test file compiles separately, so not all helpers are used in each binary
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dpitun_core::{BindConfig, BindConfigProvider, BindError, ProxyBackendKind, Settings};
use dpitun_lifecycle::{
    Collaborators, ConnectionManager, ConnectionStatus, EngineCommand, EngineError, EngineExit,
    EngineLauncher, EngineProcess, ManagerHandle, OutputLine, ProxyError, ReadinessProbe, Result,
    StatusSink, SystemProxy, Timings,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};

/// Virtual time allowed for a condition to become true.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(120);

// ============================================================================
// Engine
// ============================================================================

/// What one fake engine run does.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub lines: Vec<&'static str>,
    /// Exit on its own with this code, after this long.
    pub exit_after: Option<(Duration, i32)>,
    /// Code reported when killed. `None` reports termination by signal.
    pub code_on_kill: Option<i32>,
}

impl Script {
    /// Announces readiness and keeps running.
    pub fn ready() -> Self {
        Self {
            lines: vec!["listening on :8080"],
            ..Default::default()
        }
    }

    /// Keeps running without a recognizable line.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Reports the port as taken.
    pub fn conflict() -> Self {
        Self {
            lines: vec!["FTL listen tcp: bind: address already in use"],
            ..Default::default()
        }
    }

    /// Exits with `code` right after starting.
    pub fn crash(code: i32) -> Self {
        Self {
            exit_after: Some((Duration::ZERO, code)),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Launch {
    pub command: EngineCommand,
    pub at: Instant,
}

impl Launch {
    pub fn port(&self) -> u16 {
        let args: Vec<_> = self
            .command
            .args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let index = args
            .iter()
            .position(|a| a == "-listen-port")
            .expect("launch without -listen-port");
        args[index + 1].parse().expect("numeric port")
    }
}

struct Control {
    lines: mpsc::Sender<OutputLine>,
    crash: oneshot::Sender<i32>,
}

/// Launcher whose engines follow queued [`Script`]s.
pub struct FakeLauncher {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    launches: Mutex<Vec<Launch>>,
    current: Mutex<Option<Control>>,
    fail_spawn: AtomicBool,
    next_pid: AtomicU32,
}

impl FakeLauncher {
    /// Every launch runs `fallback`.
    pub fn new(fallback: Script) -> Self {
        Self::with_scripts(Vec::new(), fallback)
    }

    /// Launches run `scripts` in order, then `fallback`.
    pub fn with_scripts(scripts: Vec<Script>, fallback: Script) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            fallback,
            launches: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            fail_spawn: AtomicBool::new(false),
            next_pid: AtomicU32::new(1000),
        }
    }

    pub fn fail_spawn(&self) {
        self.fail_spawn.store(true, Ordering::SeqCst);
    }

    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().unwrap().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }

    pub fn ports(&self) -> Vec<u16> {
        self.launches().iter().map(Launch::port).collect()
    }

    /// Print a line from the most recent engine.
    pub async fn emit(&self, line: &str) {
        let tx = self
            .current
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.lines.clone());
        if let Some(tx) = tx {
            let _ = tx.send(OutputLine::stdout(line)).await;
        }
    }

    /// Make the most recent engine exit on its own with `code`.
    pub fn crash(&self, code: i32) {
        if let Some(control) = self.current.lock().unwrap().take() {
            drop(control.lines);
            let _ = control.crash.send(code);
        }
    }
}

#[async_trait]
impl EngineLauncher for FakeLauncher {
    async fn launch(&self, command: &EngineCommand) -> Result<EngineProcess> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(EngineError::Spawn {
                program: command.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            });
        }

        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        self.launches.lock().unwrap().push(Launch {
            command: command.clone(),
            at: Instant::now(),
        });

        let (line_tx, line_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (crash_tx, crash_rx) = oneshot::channel::<i32>();
        *self.current.lock().unwrap() = Some(Control {
            lines: line_tx.clone(),
            crash: crash_tx,
        });

        tokio::spawn(async move {
            for line in &script.lines {
                let _ = line_tx.send(OutputLine::stdout(*line)).await;
            }
            let own_exit = async {
                match script.exit_after {
                    Some((delay, code)) => {
                        sleep(delay).await;
                        code
                    }
                    None => std::future::pending().await,
                }
            };

            let exit = tokio::select! {
                _ = kill_rx => EngineExit {
                    code: script.code_on_kill,
                    killed: script.code_on_kill.is_none(),
                },
                Ok(code) = crash_rx => EngineExit { code: Some(code), killed: false },
                code = own_exit => EngineExit { code: Some(code), killed: false },
            };
            drop(line_tx);
            let _ = exit_tx.send(exit);
        });

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(EngineProcess::new(Some(pid), line_rx, exit_rx, kill_tx))
    }
}

// ============================================================================
// Proxy, probe, bind, status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyCall {
    Apply(u16),
    Clear,
}

/// Records every proxy call in order.
#[derive(Default)]
pub struct CountingProxy {
    calls: Mutex<Vec<ProxyCall>>,
    fail_apply: AtomicBool,
}

impl CountingProxy {
    pub fn failing_apply() -> Self {
        let proxy = Self::default();
        proxy.fail_apply.store(true, Ordering::SeqCst);
        proxy
    }

    pub fn calls(&self) -> Vec<ProxyCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clears(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| **c == ProxyCall::Clear)
            .count()
    }

    pub fn applies(&self) -> Vec<u16> {
        self.calls()
            .iter()
            .filter_map(|c| match c {
                ProxyCall::Apply(port) => Some(*port),
                ProxyCall::Clear => None,
            })
            .collect()
    }

    pub fn last(&self) -> Option<ProxyCall> {
        self.calls().last().copied()
    }
}

#[async_trait]
impl SystemProxy for CountingProxy {
    async fn apply(&self, port: u16) -> std::result::Result<(), ProxyError> {
        self.calls.lock().unwrap().push(ProxyCall::Apply(port));
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(ProxyError::AccessDenied);
        }
        Ok(())
    }

    async fn clear(&self) -> std::result::Result<(), ProxyError> {
        self.calls.lock().unwrap().push(ProxyCall::Clear);
        Ok(())
    }
}

/// Probe with a fixed answer after a fixed delay.
pub struct ScriptedProbe {
    ok: bool,
    delay: Duration,
    probed: Mutex<Vec<u16>>,
}

impl ScriptedProbe {
    pub fn new(ok: bool, delay: Duration) -> Self {
        Self {
            ok,
            delay,
            probed: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(true, Duration::ZERO)
    }

    pub fn probed(&self) -> Vec<u16> {
        self.probed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReadinessProbe for ScriptedProbe {
    async fn probe(&self, port: u16) -> bool {
        self.probed.lock().unwrap().push(port);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.ok
    }
}

pub struct FixedBind(pub BindConfig);

#[async_trait]
impl BindConfigProvider for FixedBind {
    async fn negotiate(&self, _allow_lan: bool) -> std::result::Result<BindConfig, BindError> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    statuses: Mutex<Vec<ConnectionStatus>>,
}

impl RecordingSink {
    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        self.statuses.lock().unwrap().clone()
    }
}

impl StatusSink for RecordingSink {
    fn report(&self, status: &ConnectionStatus) {
        self.statuses.lock().unwrap().push(status.clone());
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub handle: ManagerHandle,
    pub launcher: Arc<FakeLauncher>,
    pub proxy: Arc<CountingProxy>,
    pub probe: Arc<ScriptedProbe>,
    pub sink: Arc<RecordingSink>,
    pub settings: watch::Sender<Settings>,
    pub task: JoinHandle<()>,
}

impl Harness {
    pub fn start(launcher: FakeLauncher, probe: ScriptedProbe) -> Self {
        Self::start_with(
            launcher,
            probe,
            CountingProxy::default(),
            BindConfig::loopback(8080),
        )
    }

    pub fn start_with(
        launcher: FakeLauncher,
        probe: ScriptedProbe,
        proxy: CountingProxy,
        bind: BindConfig,
    ) -> Self {
        let launcher = Arc::new(launcher);
        let probe = Arc::new(probe);
        let proxy = Arc::new(proxy);
        let sink = Arc::new(RecordingSink::default());

        let mut settings = Settings::default();
        settings.proxy.backend = ProxyBackendKind::None;
        let (settings_tx, settings_rx) = watch::channel(settings);

        let (manager, handle) = ConnectionManager::new(
            Collaborators {
                launcher: launcher.clone(),
                probe: probe.clone(),
                proxy: proxy.clone(),
                bind: Arc::new(FixedBind(bind)),
                status: sink.clone(),
            },
            settings_rx,
            Timings::default(),
        );
        let task = tokio::spawn(manager.run());

        Self {
            handle,
            launcher,
            proxy,
            probe,
            sink,
            settings: settings_tx,
            task,
        }
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.settings.send_modify(|s| s.auto_reconnect = enabled);
    }

    /// Issue `connect` from a separate task.
    pub fn spawn_connect(&self) -> JoinHandle<Result<dpitun_lifecycle::SessionInfo>> {
        let handle = self.handle.clone();
        tokio::spawn(async move { handle.connect().await })
    }
}

/// Poll `cond` in small virtual-time steps until it holds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(WAIT_TIMEOUT, async {
        while !cond() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Write an executable script into `dir`.
pub fn create_script(dir: &std::path::Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("Failed to write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("Failed to set permissions");
    }
    path
}
