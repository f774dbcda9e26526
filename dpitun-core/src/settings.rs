//! Persisted user settings.
//!
//! The lifecycle manager only ever reads these. They are stored as YAML and
//! every field has a default, so a missing or partial file is valid.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;
use tracing::debug;

use crate::bind::DEFAULT_PORT;
use crate::dns::DnsProvider;

const SETTINGS_DIR: &str = "dpitun";
const SETTINGS_FILE: &str = "settings.yaml";

#[derive(Debug, Error, Diagnostic)]
pub enum SettingsError {
    #[error("Failed to read settings from {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse settings in {path}")]
    #[diagnostic(help("Delete the file to fall back to defaults, or fix the YAML syntax"))]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Failed to serialize settings")]
    Serialize(#[from] serde_yaml::Error),
}

/// How the DNS override is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DnsMode {
    /// Rank providers by latency before connecting and use the fastest.
    #[default]
    Auto,
    /// Always use the configured provider.
    Manual,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    pub mode: DnsMode,
    pub provider: DnsProvider,
}

/// Fragmentation strength passed to the engine as `-window-size`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DpiMethod {
    /// Lower CPU usage.
    Fast,
    #[default]
    Strong,
}

impl DpiMethod {
    pub fn window_size(self) -> u8 {
        match self {
            DpiMethod::Fast => 0,
            DpiMethod::Strong => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Engine executable, resolved through `PATH` when relative.
    pub binary: PathBuf,
    /// First port tried by every connect chain.
    pub port: u16,
    /// Passed verbatim as `-timeout`.
    pub timeout: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("spoofdpi"),
            port: DEFAULT_PORT,
            timeout: 60,
        }
    }
}

/// Which OS mechanism carries the system proxy setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProxyBackendKind {
    /// Pick the backend for the current platform.
    #[default]
    Auto,
    Windows,
    Gnome,
    Macos,
    /// Never touch the system proxy.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub backend: ProxyBackendKind,
    /// macOS network services to configure.
    pub services: Vec<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            backend: ProxyBackendKind::Auto,
            services: vec!["Wi-Fi".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub auto_reconnect: bool,
    pub dns: DnsSettings,
    pub dpi_method: DpiMethod,
    pub lan_sharing: bool,
    pub engine: EngineSettings,
    pub proxy: ProxySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            dns: DnsSettings::default(),
            dpi_method: DpiMethod::default(),
            lan_sharing: false,
            engine: EngineSettings::default(),
            proxy: ProxySettings::default(),
        }
    }
}

impl Settings {
    /// `<config dir>/dpitun/settings.yaml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(SETTINGS_DIR).join(SETTINGS_FILE))
    }

    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        if contents.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(&contents).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_yaml(&self) -> Result<String, SettingsError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Resolver handed to the engine, `None` for the system default.
    pub fn dns_override(&self) -> Option<IpAddr> {
        self.dns.provider.ip()
    }
}
