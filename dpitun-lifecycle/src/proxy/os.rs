use std::process::Stdio;

use async_trait::async_trait;
use dpitun_core::{ProxyBackendKind, ProxySettings};
use strum::Display;
use tracing::{debug, warn};

use super::SystemProxy;
use crate::error::ProxyError;

const INTERNET_SETTINGS_KEY: &str =
    r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

const PROXY_HOST: &str = "127.0.0.1";

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// The OS mechanism that carries the proxy setting.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ProxyBackend {
    /// `reg` edits of the per-user Internet Settings key.
    WindowsRegistry,
    /// `gsettings` on `org.gnome.system.proxy`.
    Gnome,
    /// `networksetup` for each listed network service.
    MacNetworkSetup { services: Vec<String> },
    Disabled,
}

impl ProxyBackend {
    pub fn from_settings(settings: &ProxySettings) -> Self {
        match settings.backend {
            ProxyBackendKind::Auto => Self::detect(settings),
            ProxyBackendKind::Windows => Self::WindowsRegistry,
            ProxyBackendKind::Gnome => Self::Gnome,
            ProxyBackendKind::Macos => Self::MacNetworkSetup {
                services: settings.services.clone(),
            },
            ProxyBackendKind::None => Self::Disabled,
        }
    }

    fn detect(settings: &ProxySettings) -> Self {
        if cfg!(windows) {
            Self::WindowsRegistry
        } else if cfg!(target_os = "macos") {
            Self::MacNetworkSetup {
                services: settings.services.clone(),
            }
        } else if cfg!(target_os = "linux") {
            Self::Gnome
        } else {
            Self::Disabled
        }
    }
}

/// How a failing step affects the rest of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRole {
    /// Probes write access. Failure means `AccessDenied`.
    Check,
    /// Must succeed.
    Write,
    /// Failure is logged and ignored.
    Optional,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyStep {
    pub program: &'static str,
    pub args: Vec<String>,
    pub role: StepRole,
}

impl ProxyStep {
    fn new(program: &'static str, role: StepRole, args: &[&str]) -> Self {
        Self {
            program,
            args: args.iter().map(|a| a.to_string()).collect(),
            role,
        }
    }

    async fn run(&self) -> Result<(), ProxyError> {
        let mut cmd = tokio::process::Command::new(self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let output = cmd.output().await.map_err(|source| ProxyError::Io {
            program: self.program.to_string(),
            source,
        })?;
        check_status(self.program, output.status, &output.stderr)
    }

    fn run_blocking(&self) -> Result<(), ProxyError> {
        let mut cmd = std::process::Command::new(self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let output = cmd.output().map_err(|source| ProxyError::Io {
            program: self.program.to_string(),
            source,
        })?;
        check_status(self.program, output.status, &output.stderr)
    }
}

fn check_status(
    program: &str,
    status: std::process::ExitStatus,
    stderr: &[u8],
) -> Result<(), ProxyError> {
    if status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    let status = if stderr.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {stderr}")
    };
    Err(ProxyError::CommandFailed {
        program: program.to_string(),
        status,
    })
}

/// System proxy driven by the platform's own command-line tools.
#[derive(Debug, Clone)]
pub struct OsProxy {
    backend: ProxyBackend,
}

impl OsProxy {
    pub fn new(backend: ProxyBackend) -> Self {
        Self { backend }
    }

    pub fn from_settings(settings: &ProxySettings) -> Self {
        Self::new(ProxyBackend::from_settings(settings))
    }

    pub fn backend(&self) -> &ProxyBackend {
        &self.backend
    }

    /// Whether running clients must be told to re-read the proxy setting.
    /// WinINet caches the registry values until notified.
    pub fn refreshes_clients(&self) -> bool {
        self.backend == ProxyBackend::WindowsRegistry
    }

    fn refresh(&self) {
        if self.refreshes_clients() {
            wininet::notify_settings_changed();
        }
    }

    pub fn apply_plan(&self, port: u16) -> Result<Vec<ProxyStep>, ProxyError> {
        if self.backend == ProxyBackend::Disabled {
            return Ok(Vec::new());
        }
        if port < 1024 {
            return Err(ProxyError::InvalidPort(port));
        }
        let port = port.to_string();
        let server = format!("{PROXY_HOST}:{port}");

        let steps = match &self.backend {
            ProxyBackend::WindowsRegistry => vec![
                // Query the key itself, fresh profiles lack the ProxyEnable value.
                ProxyStep::new("reg", StepRole::Check, &["query", INTERNET_SETTINGS_KEY]),
                reg_add(StepRole::Optional, "ProxyOverride", "REG_SZ", "<local>"),
                reg_add(StepRole::Write, "ProxyServer", "REG_SZ", &server),
                reg_add(StepRole::Write, "ProxyEnable", "REG_DWORD", "1"),
            ],
            ProxyBackend::Gnome => {
                let mut steps = Vec::new();
                for schema in ["org.gnome.system.proxy.http", "org.gnome.system.proxy.https"] {
                    steps.push(gsettings(schema, "host", PROXY_HOST));
                    steps.push(gsettings(schema, "port", &port));
                }
                steps.push(gsettings("org.gnome.system.proxy", "mode", "manual"));
                steps
            }
            ProxyBackend::MacNetworkSetup { services } => services
                .iter()
                .flat_map(|service| {
                    ["-setwebproxy", "-setsecurewebproxy"].map(|flag| {
                        ProxyStep::new(
                            "networksetup",
                            StepRole::Write,
                            &[flag, service.as_str(), PROXY_HOST, port.as_str()],
                        )
                    })
                })
                .collect(),
            ProxyBackend::Disabled => Vec::new(),
        };
        Ok(steps)
    }

    pub fn clear_plan(&self) -> Vec<ProxyStep> {
        match &self.backend {
            ProxyBackend::WindowsRegistry => {
                vec![reg_add(StepRole::Write, "ProxyEnable", "REG_DWORD", "0")]
            }
            ProxyBackend::Gnome => vec![gsettings("org.gnome.system.proxy", "mode", "none")],
            ProxyBackend::MacNetworkSetup { services } => services
                .iter()
                .flat_map(|service| {
                    ["-setwebproxystate", "-setsecurewebproxystate"].map(|flag| {
                        ProxyStep::new("networksetup", StepRole::Write, &[flag, service.as_str(), "off"])
                    })
                })
                .collect(),
            ProxyBackend::Disabled => Vec::new(),
        }
    }

    /// Synchronous clear for contexts without a runtime, such as a forced
    /// exit. Runs every step even if an earlier one fails.
    pub fn clear_blocking(&self) -> Result<(), ProxyError> {
        let mut result = Ok(());
        for step in self.clear_plan() {
            if let Err(e) = step.run_blocking() {
                warn!("{}", e);
                result = Err(e);
            }
        }
        self.refresh();
        result
    }

    async fn execute(&self, steps: &[ProxyStep]) -> Result<(), ProxyError> {
        for step in steps {
            let Err(e) = step.run().await else {
                continue;
            };
            match step.role {
                StepRole::Optional => debug!("Ignoring failed optional step: {}", e),
                StepRole::Check => {
                    debug!("Access check failed: {}", e);
                    return Err(ProxyError::AccessDenied);
                }
                StepRole::Write => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SystemProxy for OsProxy {
    async fn apply(&self, port: u16) -> Result<(), ProxyError> {
        let steps = self.apply_plan(port)?;
        if let Err(e) = self.execute(&steps).await {
            if !matches!(e, ProxyError::AccessDenied) {
                // Never leave a half-written proxy enabled.
                if let Err(rollback) = self.execute(&self.clear_plan()).await {
                    warn!("Rolling back system proxy failed: {}", rollback);
                }
                self.refresh();
            }
            return Err(e);
        }
        self.refresh();
        Ok(())
    }

    async fn clear(&self) -> Result<(), ProxyError> {
        let result = self.execute(&self.clear_plan()).await;
        self.refresh();
        result
    }
}

fn reg_add(role: StepRole, value: &str, kind: &str, data: &str) -> ProxyStep {
    ProxyStep::new(
        "reg",
        role,
        &[
            "add",
            INTERNET_SETTINGS_KEY,
            "/v",
            value,
            "/t",
            kind,
            "/d",
            data,
            "/f",
        ],
    )
}

fn gsettings(schema: &str, key: &str, value: &str) -> ProxyStep {
    ProxyStep::new("gsettings", StepRole::Write, &["set", schema, key, value])
}

#[cfg(windows)]
mod wininet {
    use std::ptr::null_mut;

    use tracing::debug;
    use winapi::um::wininet::{
        INTERNET_OPTION_REFRESH, INTERNET_OPTION_SETTINGS_CHANGED, InternetSetOptionW,
    };

    pub(super) fn notify_settings_changed() {
        for option in [INTERNET_OPTION_SETTINGS_CHANGED, INTERNET_OPTION_REFRESH] {
            // SAFETY: a null handle targets the global settings and these
            // options take no buffer.
            let ok = unsafe { InternetSetOptionW(null_mut(), option, null_mut(), 0) };
            if ok == 0 {
                debug!(
                    "InternetSetOptionW({}) failed: {}",
                    option,
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

#[cfg(not(windows))]
mod wininet {
    pub(super) fn notify_settings_changed() {}
}
