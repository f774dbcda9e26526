use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Local};
use dpitun_core::DnsProvider;
use serde::Serialize;
use strum::Display;

/// Where the connection lifecycle currently stands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecyclePhase {
    #[default]
    Idle,
    Connecting,
    Connected,
    /// Waiting for a scheduled reconnect.
    Retrying,
    /// Automatic reconnects gave up; only the user can start again.
    Failed,
}

/// Public view of the active connection session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// First port of the connect chain that produced this session.
    pub requested_port: u16,
    /// Port the engine was started on.
    pub bound_port: u16,
    pub bind_address: Option<IpAddr>,
    /// Address other devices use when LAN sharing is on.
    pub lan_endpoint: Option<SocketAddr>,
    pub dns_override: Option<DnsProvider>,
    pub ready_confirmed: bool,
    /// Connected by the fail-safe timer rather than a probed readiness line.
    pub optimistic: bool,
    pub pid: Option<u32>,
    pub started_at: DateTime<Local>,
}

impl SessionInfo {
    pub fn proxy_endpoint(&self) -> String {
        format!("127.0.0.1:{}", self.bound_port)
    }
}

/// Snapshot answered to status queries.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub phase: LifecyclePhase,
    pub session: Option<SessionInfo>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Port the OS proxy currently points at, as last applied.
    pub proxy_port: Option<u16>,
}
