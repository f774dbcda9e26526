use std::ffi::OsString;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use dpitun_core::{DpiMethod, EngineSettings};

/// Program and argument vector for one engine launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl EngineCommand {
    /// Build the invocation for `port`.
    ///
    /// Argument order is fixed: listen port, optional listen address, optional
    /// DNS override, window size, DoH flag, timeout.
    pub fn build(
        engine: &EngineSettings,
        port: u16,
        bind_address: Option<IpAddr>,
        dns: Option<IpAddr>,
        method: DpiMethod,
    ) -> Self {
        let mut args: Vec<OsString> = vec!["-listen-port".into(), port.to_string().into()];
        if let Some(addr) = bind_address {
            args.push("-listen-addr".into());
            args.push(addr.to_string().into());
        }
        if let Some(dns) = dns {
            args.push("-dns-addr".into());
            args.push(dns.to_string().into());
        }
        args.push("-window-size".into());
        args.push(method.window_size().to_string().into());
        args.push("-enable-doh".into());
        args.push("-timeout".into());
        args.push(engine.timeout.to_string().into());

        Self {
            program: engine.binary.clone(),
            args,
        }
    }
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}
