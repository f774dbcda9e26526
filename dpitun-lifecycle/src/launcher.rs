//! Spawning the engine and turning its pipes into channels.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::command::EngineCommand;
use crate::error::{EngineError, Result};

const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Upper bound for draining the pipes after the engine exited. Grandchildren
/// may keep them open.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            text: text.into(),
        }
    }
}

/// How the engine ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineExit {
    /// `None` when terminated by a signal.
    pub code: Option<i32>,
    /// Whether the kill was requested by us.
    pub killed: bool,
}

impl EngineExit {
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

/// Handle to a running engine.
///
/// All output lines are delivered before `exit` resolves. Dropping the handle
/// kills the engine.
#[derive(Debug)]
pub struct EngineProcess {
    pub(crate) pid: Option<u32>,
    pub(crate) output: Option<mpsc::Receiver<OutputLine>>,
    pub(crate) exit: oneshot::Receiver<EngineExit>,
    kill: Option<oneshot::Sender<()>>,
}

impl EngineProcess {
    pub fn new(
        pid: Option<u32>,
        output: mpsc::Receiver<OutputLine>,
        exit: oneshot::Receiver<EngineExit>,
        kill: oneshot::Sender<()>,
    ) -> Self {
        Self {
            pid,
            output: Some(output),
            exit,
            kill: Some(kill),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request termination. Returns `false` if a kill was already requested or
    /// the engine is gone.
    pub fn kill(&mut self) -> bool {
        match self.kill.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, command: &EngineCommand) -> Result<EngineProcess>;
}

/// Launches the engine as a real child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

#[async_trait]
impl EngineLauncher for ProcessLauncher {
    async fn launch(&self, command: &EngineCommand) -> Result<EngineProcess> {
        // Resolve through PATH up front so spawn errors name the real file.
        let program = which::which(&command.program).unwrap_or_else(|_| command.program.clone());
        debug!("Launching {}", command);

        let mut cmd = Command::new(&program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd.spawn().map_err(|source| EngineError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();

        let (line_tx, line_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, OutputStream::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, OutputStream::Stderr, line_tx.clone()));
        }
        drop(line_tx);

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            // A dropped sender counts as a kill request too.
            let (status, killed) = tokio::select! {
                status = child.wait() => (status, false),
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill engine (pid {:?}): {}", pid, e);
                    }
                    (child.wait().await, true)
                }
            };

            if tokio::time::timeout(DRAIN_TIMEOUT, join_all(readers))
                .await
                .is_err()
            {
                debug!("Engine output did not close after exit");
            }

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Failed to wait for engine: {}", e);
                    None
                }
            };
            let _ = exit_tx.send(EngineExit { code, killed });
        });

        Ok(EngineProcess::new(pid, line_rx, exit_rx, kill_tx))
    }
}

fn spawn_reader<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    // Engines on localized Windows do not always emit UTF-8.
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(OutputLine { stream, text }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Engine {:?} read error: {}", stream, e);
                    break;
                }
            }
        }
    })
}
