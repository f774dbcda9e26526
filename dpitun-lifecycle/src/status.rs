//! Status reporting for tray icons and other indicators.

use std::net::SocketAddr;
use std::time::Duration;

use dpitun_core::DnsProvider;
use serde::Serialize;
use tracing::info;

use crate::session::LifecyclePhase;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting {
        port: u16,
    },
    Connected {
        port: u16,
        dns: Option<DnsProvider>,
        lan: Option<SocketAddr>,
        optimistic: bool,
    },
    Retrying {
        attempt: u32,
        max_attempts: u32,
        delay: Duration,
    },
    Failed,
}

impl ConnectionStatus {
    pub fn phase(&self) -> LifecyclePhase {
        match self {
            ConnectionStatus::Disconnected => LifecyclePhase::Idle,
            ConnectionStatus::Connecting { .. } => LifecyclePhase::Connecting,
            ConnectionStatus::Connected { .. } => LifecyclePhase::Connected,
            ConnectionStatus::Retrying { .. } => LifecyclePhase::Retrying,
            ConnectionStatus::Failed => LifecyclePhase::Failed,
        }
    }

    /// Multi-line text for a tray tooltip.
    pub fn tooltip(&self) -> String {
        match self {
            ConnectionStatus::Disconnected => "dpitun - Off".to_string(),
            ConnectionStatus::Connecting { port } => format!("dpitun - Connecting (port {port})"),
            ConnectionStatus::Connected { port, dns, lan, .. } => {
                let dns = match dns {
                    Some(DnsProvider::System) | None => "SYSTEM".to_string(),
                    Some(provider) => provider.label(),
                };
                let mut text = format!("dpitun - Connected\n127.0.0.1:{port}\nDNS: {dns}");
                if let Some(lan) = lan {
                    text.push_str(&format!("\nLAN: {lan}"));
                }
                text
            }
            ConnectionStatus::Retrying {
                attempt,
                max_attempts,
                ..
            } => format!("dpitun - Reconnecting\nAttempt {attempt}/{max_attempts}..."),
            ConnectionStatus::Failed => "dpitun - Connection failed".to_string(),
        }
    }
}

/// Receives every status change, in order.
pub trait StatusSink: Send + Sync {
    fn report(&self, status: &ConnectionStatus);
}

/// Writes status changes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn report(&self, status: &ConnectionStatus) {
        info!(phase = %status.phase(), "{}", status.tooltip().replace('\n', " | "));
    }
}
