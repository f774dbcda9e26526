//! The long-running `up` command.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dpitun_core::{DnsLatency, DnsMode, LocalBindConfig, Settings, is_elevated, rank_providers};
use dpitun_lifecycle::{
    Collaborators, ConnectionManager, HttpReadinessProbe, LogStatusSink,
    ManagerHandle, OsProxy, ProcessLauncher, Timings,
};
use miette::{IntoDiagnostic, Result};
use strum::{Display, EnumString};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::shutdown::Shutdown;

const DNS_RANK_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn run(settings_path: PathBuf, no_connect: bool) -> Result<()> {
    let shutdown = Shutdown::new();
    shutdown.install_signals();

    let mut settings = Settings::load(&settings_path)?;
    if cfg!(windows) && !is_elevated().await {
        warn!("Not running as administrator, the system proxy may not be writable");
    }
    pick_dns(&mut settings).await;

    let os_proxy = Arc::new(OsProxy::from_settings(&settings.proxy));
    info!(backend = %os_proxy.backend(), "Using system proxy backend");
    shutdown.set_pre_exit_hook({
        let os_proxy = Arc::clone(&os_proxy);
        move || {
            if let Err(e) = os_proxy.clear_blocking() {
                eprintln!("Failed to clear the system proxy: {e}");
            }
        }
    });

    let (settings_tx, settings_rx) = watch::channel(settings.clone());
    let collaborators = Collaborators {
        launcher: Arc::new(ProcessLauncher),
        probe: Arc::new(HttpReadinessProbe::default()),
        proxy: os_proxy,
        bind: Arc::new(LocalBindConfig::new(settings.engine.port)),
        status: Arc::new(LogStatusSink),
    };
    let (manager, handle) = ConnectionManager::new(collaborators, settings_rx, Timings::default());
    let manager_task = tokio::spawn(manager.run());

    if !no_connect {
        spawn_connect(handle.clone());
    }

    let mut console = Console::new(
        handle.clone(),
        settings_path,
        settings_tx,
        tokio::io::stdout(),
    );
    let result = console
        .run(BufReader::new(tokio::io::stdin()), &shutdown)
        .await;

    info!("Stopping");
    if let Err(e) = handle.shutdown().await {
        warn!("{}", e);
    }
    manager_task.await.into_diagnostic()?;
    result
}

/// In auto mode, replace the configured provider with the fastest one that
/// answers.
async fn pick_dns(settings: &mut Settings) {
    if settings.dns.mode != DnsMode::Auto {
        return;
    }

    let ranking = rank_providers(DNS_RANK_TIMEOUT).await;
    match ranking.first() {
        Some(DnsLatency {
            provider,
            latency: Some(latency),
        }) => {
            info!(
                "Fastest DNS is {} ({} ms)",
                provider.label(),
                latency.as_millis()
            );
            settings.dns.provider = *provider;
        }
        _ => warn!(
            "No DNS provider answered, keeping {}",
            settings.dns.provider.label()
        ),
    }
}

fn spawn_connect(handle: ManagerHandle) {
    tokio::spawn(async move {
        match handle.connect().await {
            Ok(session) => debug!("Connected on {}", session.proxy_endpoint()),
            Err(e) => error!("{}", e),
        }
    });
}

/// Commands accepted on stdin while `up` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ConsoleCommand {
    Connect,
    Disconnect,
    Status,
    Logs,
    Reload,
    Help,
    #[strum(serialize = "quit", serialize = "exit")]
    Quit,
}

const HELP: &str = "\
connect     start the engine and set the system proxy
disconnect  stop the engine and clear the system proxy
status      print the current state as JSON
logs        print the connection journal
reload      re-read the settings file
quit        stop everything and exit
";

pub struct Console<W> {
    handle: ManagerHandle,
    settings_path: PathBuf,
    settings_tx: watch::Sender<Settings>,
    out: W,
}

impl<W: AsyncWrite + Unpin> Console<W> {
    pub fn new(
        handle: ManagerHandle,
        settings_path: PathBuf,
        settings_tx: watch::Sender<Settings>,
        out: W,
    ) -> Self {
        Self {
            handle,
            settings_path,
            settings_tx,
            out,
        }
    }

    /// Read commands until `quit` or shutdown. A closed input keeps the
    /// session alive until a signal arrives.
    pub async fn run<R: AsyncBufRead + Unpin>(
        &mut self,
        input: R,
        shutdown: &Shutdown,
    ) -> Result<()> {
        let mut lines = input.lines();
        loop {
            let line = tokio::select! {
                _ = shutdown.wait_for_shutdown() => return Ok(()),
                line = lines.next_line() => line.into_diagnostic()?,
            };

            let Some(line) = line else {
                debug!("stdin closed, waiting for a signal");
                shutdown.wait_for_shutdown().await;
                return Ok(());
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match line.parse::<ConsoleCommand>() {
                Ok(ConsoleCommand::Quit) => return Ok(()),
                Ok(command) => self.execute(command).await?,
                Err(_) => warn!("Unknown command `{}`, try `help`", line),
            }
        }
    }

    async fn execute(&mut self, command: ConsoleCommand) -> Result<()> {
        match command {
            ConsoleCommand::Connect => spawn_connect(self.handle.clone()),
            ConsoleCommand::Disconnect => self.handle.disconnect().await?,
            ConsoleCommand::Status => {
                let snapshot = self.handle.snapshot().await?;
                let json = serde_json::to_string_pretty(&snapshot).into_diagnostic()?;
                self.print(&json).await?;
            }
            ConsoleCommand::Logs => {
                let journal = self.handle.journal().await?;
                self.print(&journal.export()).await?;
            }
            ConsoleCommand::Reload => self.reload().await?,
            ConsoleCommand::Help => self.print(HELP.trim_end()).await?,
            ConsoleCommand::Quit => {}
        }
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let mut settings = Settings::load(&self.settings_path)?;
        pick_dns(&mut settings).await;

        let previous = self.settings_tx.send_replace(settings);
        let current = self.settings_tx.borrow();
        if previous.engine.port != current.engine.port {
            warn!("The new engine port is used after dpitun restarts");
        }
        if previous.proxy != current.proxy {
            warn!("The new proxy backend is used after dpitun restarts");
        }
        info!("Reloaded settings from {}", self.settings_path.display());
        Ok(())
    }

    async fn print(&mut self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.out.write_all(text.as_bytes()).await.into_diagnostic()?;
        self.out.write_all(b"\n").await.into_diagnostic()?;
        self.out.flush().await.into_diagnostic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpitun_core::{DnsProvider, ProxyBackendKind};
    use dpitun_lifecycle::ProxyBackend;
    use pretty_assertions::assert_eq;

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.dns.mode = DnsMode::Manual;
        settings.proxy.backend = ProxyBackendKind::None;
        settings.engine.binary = PathBuf::from("dpitun-test-engine-that-does-not-exist");
        settings
    }

    fn start(settings: Settings) -> (ManagerHandle, watch::Sender<Settings>) {
        let (settings_tx, settings_rx) = watch::channel(settings);
        let (manager, handle) = ConnectionManager::new(
            Collaborators {
                launcher: Arc::new(ProcessLauncher),
                probe: Arc::new(HttpReadinessProbe::default()),
                proxy: Arc::new(OsProxy::new(ProxyBackend::Disabled)),
                bind: Arc::new(LocalBindConfig::default()),
                status: Arc::new(LogStatusSink),
            },
            settings_rx,
            Timings::default(),
        );
        tokio::spawn(manager.run());
        (handle, settings_tx)
    }

    #[test]
    fn parse_commands() {
        assert_eq!("status".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Status));
        assert_eq!("Connect".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Connect));
        assert_eq!("exit".parse::<ConsoleCommand>(), Ok(ConsoleCommand::Quit));
        assert!("launch".parse::<ConsoleCommand>().is_err());
        assert_eq!(ConsoleCommand::Quit.to_string(), "quit");
    }

    #[tokio::test]
    async fn status_prints_idle_snapshot() {
        let (handle, settings_tx) = start(settings());
        let shutdown = Shutdown::new();
        let mut console = Console::new(handle, PathBuf::new(), settings_tx, Vec::new());

        console
            .run(&b"status\nunknown\n\nquit\n"[..], &shutdown)
            .await
            .unwrap();

        let output = String::from_utf8(console.out).unwrap();
        let json: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(json["phase"], "idle");
        assert_eq!(json["session"], serde_json::Value::Null);
        assert_eq!(json["max_attempts"], 5);
    }

    #[tokio::test]
    async fn reload_replaces_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(
            &path,
            "auto_reconnect: false\ndns:\n  mode: manual\n  provider: google\nproxy:\n  backend: none\n",
        )
        .unwrap();

        let (handle, settings_tx) = start(settings());
        let settings_rx = settings_tx.subscribe();
        let shutdown = Shutdown::new();
        let mut console = Console::new(handle, path, settings_tx, Vec::new());

        console.run(&b"reload\nquit\n"[..], &shutdown).await.unwrap();

        let current = settings_rx.borrow().clone();
        assert!(!current.auto_reconnect);
        assert_eq!(current.dns.provider, DnsProvider::Google);
    }

    #[tokio::test]
    async fn failed_connect_shows_in_logs() {
        let (handle, settings_tx) = start(settings());
        let shutdown = Shutdown::new();

        let err = handle.connect().await.unwrap_err();
        assert!(err.to_string().contains("failed to start engine"));

        let mut console = Console::new(handle, PathBuf::new(), settings_tx, Vec::new());
        console.run(&b"logs\nquit\n"[..], &shutdown).await.unwrap();

        let output = String::from_utf8(console.out).unwrap();
        assert!(output.starts_with('['));
        assert!(output.contains("dpitun-test-engine-that-does-not-exist"));
    }

    #[tokio::test]
    async fn shutdown_stops_the_console() {
        let (handle, settings_tx) = start(settings());
        let shutdown = Shutdown::new();
        shutdown.shutdown();

        let mut console = Console::new(handle, PathBuf::new(), settings_tx, Vec::new());
        // An input that never ends.
        let (_writer, reader) = tokio::io::duplex(64);
        console.run(BufReader::new(reader), &shutdown).await.unwrap();
        assert!(console.out.is_empty());
    }
}
