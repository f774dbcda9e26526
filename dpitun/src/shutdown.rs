//! Signal-driven shutdown for the `up` command.
//!
//! The first interrupt cancels the token so the lifecycle can stop the engine
//! and clear the proxy in order. A second interrupt runs the pre-exit hook and
//! leaves immediately.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exit status used when a second interrupt forces the process down.
pub const FORCED_EXIT_CODE: i32 = 130;

type ExitHook = Box<dyn Fn() + Send + Sync>;

pub struct Shutdown {
    token: CancellationToken,
    signalled: AtomicBool,
    /// Runs right before a forced exit, when no async cleanup is possible.
    pre_exit_hook: Mutex<Option<ExitHook>>,
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("token", &self.token)
            .field("signalled", &self.signalled)
            .finish_non_exhaustive()
    }
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            signalled: AtomicBool::new(false),
            pre_exit_hook: Mutex::new(None),
        })
    }

    pub fn set_pre_exit_hook<F: Fn() + Send + Sync + 'static>(&self, hook: F) {
        if let Ok(mut slot) = self.pre_exit_hook.lock() {
            *slot = Some(Box::new(hook));
        }
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Install the signal listener. Must be called from within a runtime.
    pub fn install_signals(self: &Arc<Self>) {
        let shutdown = Arc::clone(self);

        tokio::spawn(async move {
            let mut signals = match Signals::new() {
                Ok(signals) => signals,
                Err(e) => {
                    warn!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

            loop {
                let name = signals.recv().await;

                if shutdown.register_signal() {
                    info!("Received second signal, forcing exit...");
                    shutdown.exit_process();
                }

                info!("Received {}, shutting down gracefully...", name);
                shutdown.shutdown();
            }
        });
    }

    /// Record an interrupt. Returns `true` if one had already been received.
    fn register_signal(&self) -> bool {
        self.signalled.swap(true, Ordering::SeqCst)
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    fn run_pre_exit_hook(&self) {
        if let Ok(guard) = self.pre_exit_hook.lock()
            && let Some(hook) = guard.as_ref()
        {
            hook();
        }
    }

    pub fn exit_process(&self) -> ! {
        self.run_pre_exit_hook();
        std::process::exit(FORCED_EXIT_CODE);
    }
}

#[cfg(unix)]
struct Signals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
    sighup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sighup: signal(SignalKind::hangup())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sighup.recv() => "SIGHUP",
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        "Ctrl-C"
    }
}
