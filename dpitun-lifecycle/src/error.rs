use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Likely causes and remedies attached to terminal failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guidance {
    pub causes: &'static [&'static str],
    pub remedies: &'static [&'static str],
}

impl Guidance {
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.causes.len() + self.remedies.len() + 2);
        lines.push("Likely causes:".to_string());
        lines.extend(self.causes.iter().map(|c| format!("  - {c}")));
        lines.push("Suggested fixes:".to_string());
        lines.extend(self.remedies.iter().map(|r| format!("  - {r}")));
        lines
    }
}

const RETRY_GUIDANCE: Guidance = Guidance {
    causes: &[
        "The internet connection dropped",
        "A firewall or antivirus is blocking the engine",
        "The engine ports (8080 and above) are taken by other programs",
    ],
    remedies: &[
        "Check the internet connection",
        "Allow the engine through the firewall",
        "Run with administrator rights",
        "Copy the journal (`logs`) when asking for support",
    ],
};

const PORT_GUIDANCE: Guidance = Guidance {
    causes: &["Every port between the configured port and 9000 is in use"],
    remedies: &[
        "Close programs listening on ports 8080-9000",
        "Set `engine.port` to a different starting port",
    ],
};

const SPAWN_GUIDANCE: Guidance = Guidance {
    causes: &[
        "The engine binary is not installed or not on PATH",
        "`engine.binary` in the settings points to a missing or non-executable file",
        "An antivirus quarantined or blocked the engine executable",
    ],
    remedies: &[
        "Install the engine or set `engine.binary` to its full path",
        "Restore the engine from quarantine and add an antivirus exception",
        "Copy the journal (`logs`) when asking for support",
    ],
};

#[derive(Debug, Error, Diagnostic)]
pub enum ProxyError {
    #[error("port {0} cannot be used for the system proxy (1024-65535 required)")]
    InvalidPort(u16),

    #[error("failed to run `{program}`")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` exited with {status}")]
    CommandFailed { program: String, status: String },

    #[error("no write access to the proxy settings")]
    #[diagnostic(help("Run dpitun with administrator rights"))]
    AccessDenied,
}

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("port {port} is already bound by another program")]
    PortBindConflict { port: u16 },

    #[error("no available port found (last tried {last_port} after {attempts} attempts)")]
    #[diagnostic(
        code(dpitun::no_available_port),
        help("Close programs listening on ports 8080-9000 or change `engine.port`")
    )]
    NoAvailablePort { last_port: u16, attempts: u16 },

    #[error("port {port} did not accept connections in time")]
    ProbeTimeout { port: u16 },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Proxy(#[from] ProxyError),

    #[error("engine exited unexpectedly ({})", describe_code(*code))]
    UnexpectedProcessExit { code: Option<i32> },

    #[error("engine stopped on its own (exit code 0)")]
    ProcessStopped,

    #[error("could not connect after {attempts} reconnect attempts")]
    #[diagnostic(
        code(dpitun::max_retries),
        help(
            "Check the internet connection and firewall, run with administrator rights, then connect again"
        )
    )]
    MaxRetriesExceeded { attempts: u32 },

    #[error("failed to start engine `{}`", program.display())]
    #[diagnostic(help("Install the engine binary or set `engine.binary` in the settings"))]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("connection attempt was cancelled")]
    Cancelled,

    #[error("the connection manager is no longer running")]
    ManagerClosed,
}

impl EngineError {
    /// Causes and remedies shown to the user for terminal failures.
    pub fn guidance(&self) -> Option<Guidance> {
        match self {
            EngineError::MaxRetriesExceeded { .. } => Some(RETRY_GUIDANCE),
            EngineError::NoAvailablePort { .. } => Some(PORT_GUIDANCE),
            EngineError::Spawn { .. } => Some(SPAWN_GUIDANCE),
            _ => None,
        }
    }

    /// Whether the automatic flow has given up and needs the user to act.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineError::NoAvailablePort { .. }
                | EngineError::MaxRetriesExceeded { .. }
                | EngineError::Spawn { .. }
        )
    }
}

impl ProxyError {
    fn duplicate(&self) -> Self {
        match self {
            ProxyError::InvalidPort(port) => ProxyError::InvalidPort(*port),
            ProxyError::Io { program, source } => ProxyError::Io {
                program: program.clone(),
                source: copy_io_error(source),
            },
            ProxyError::CommandFailed { program, status } => ProxyError::CommandFailed {
                program: program.clone(),
                status: status.clone(),
            },
            ProxyError::AccessDenied => ProxyError::AccessDenied,
        }
    }
}

impl EngineError {
    /// Copy of this error for fanning one failure out to several waiting
    /// callers. I/O sources keep their kind and message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            EngineError::PortBindConflict { port } => EngineError::PortBindConflict { port: *port },
            EngineError::NoAvailablePort {
                last_port,
                attempts,
            } => EngineError::NoAvailablePort {
                last_port: *last_port,
                attempts: *attempts,
            },
            EngineError::ProbeTimeout { port } => EngineError::ProbeTimeout { port: *port },
            EngineError::Proxy(e) => EngineError::Proxy(e.duplicate()),
            EngineError::UnexpectedProcessExit { code } => {
                EngineError::UnexpectedProcessExit { code: *code }
            }
            EngineError::ProcessStopped => EngineError::ProcessStopped,
            EngineError::MaxRetriesExceeded { attempts } => EngineError::MaxRetriesExceeded {
                attempts: *attempts,
            },
            EngineError::Spawn { program, source } => EngineError::Spawn {
                program: program.clone(),
                source: copy_io_error(source),
            },
            EngineError::Cancelled => EngineError::Cancelled,
            EngineError::ManagerClosed => EngineError::ManagerClosed,
        }
    }
}

fn copy_io_error(err: &std::io::Error) -> std::io::Error {
    std::io::Error::new(err.kind(), err.to_string())
}

fn describe_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "terminated by signal".to_string(),
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
