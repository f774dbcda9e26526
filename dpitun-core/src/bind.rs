//! Bind negotiation for the engine's listen socket.
//!
//! The negotiated config is consulted once per connect chain to pick the
//! initial port. Conflicts discovered after spawning are handled by the
//! lifecycle's linear port negotiation, which shares the bounds below.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

/// Port the engine listens on when nothing else is configured.
pub const DEFAULT_PORT: u16 = 8080;

/// Highest port the lifecycle will ever propose.
pub const MAX_PORT: u16 = 9000;

/// Maximum number of ports tried within one connect chain.
pub const MAX_PORT_ATTEMPTS: u16 = 20;

/// Loopback address the system proxy always points at.
pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Address used to discover the outbound interface. No packet is sent.
const LAN_DISCOVERY_TARGET: &str = "8.8.8.8:80";

#[derive(Debug, Error)]
pub enum BindError {
    #[error("port {0} is outside the allowed range (1024-{MAX_PORT})")]
    PortOutOfRange(u16),
}

/// Where the engine should listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindConfig {
    pub port: u16,
    /// `None` keeps the engine's default (loopback).
    pub bind_address: Option<IpAddr>,
    /// Address other devices on the network can use, when LAN sharing is on.
    pub lan_ip: Option<IpAddr>,
}

impl BindConfig {
    pub fn loopback(port: u16) -> Self {
        Self {
            port,
            bind_address: None,
            lan_ip: None,
        }
    }

    /// Address advertised to other devices for the given bound port.
    pub fn lan_endpoint(&self, port: u16) -> Option<SocketAddr> {
        self.lan_ip.map(|ip| SocketAddr::new(ip, port))
    }
}

/// Negotiates the bind configuration for a new connect chain.
#[async_trait]
pub trait BindConfigProvider: Send + Sync {
    async fn negotiate(&self, allow_lan: bool) -> Result<BindConfig, BindError>;
}

/// Picks the first locally bindable port starting at `base_port`.
#[derive(Debug, Clone)]
pub struct LocalBindConfig {
    base_port: u16,
}

impl LocalBindConfig {
    pub fn new(base_port: u16) -> Self {
        Self { base_port }
    }

    fn first_free_port(&self, host: IpAddr) -> u16 {
        for offset in 0..MAX_PORT_ATTEMPTS {
            let Some(port) = self.base_port.checked_add(offset) else {
                break;
            };
            if port > MAX_PORT {
                break;
            }
            // The listener is dropped right away so the engine can take the port.
            if TcpListener::bind(SocketAddr::new(host, port)).is_ok() {
                return port;
            }
            debug!("Port {} is busy on {}, trying next", port, host);
        }
        self.base_port
    }

    fn negotiate_blocking(&self, allow_lan: bool) -> BindConfig {
        let host = if allow_lan {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            LOOPBACK
        };
        let port = self.first_free_port(host);

        if !allow_lan {
            return BindConfig::loopback(port);
        }

        BindConfig {
            port,
            bind_address: Some(host),
            lan_ip: detect_lan_ip(),
        }
    }
}

impl Default for LocalBindConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PORT)
    }
}

#[async_trait]
impl BindConfigProvider for LocalBindConfig {
    /// Socket probing blocks, so it runs on the blocking pool.
    async fn negotiate(&self, allow_lan: bool) -> Result<BindConfig, BindError> {
        if !(1024..=MAX_PORT).contains(&self.base_port) {
            return Err(BindError::PortOutOfRange(self.base_port));
        }

        let provider = self.clone();
        match tokio::task::spawn_blocking(move || provider.negotiate_blocking(allow_lan)).await {
            Ok(config) => Ok(config),
            Err(e) => {
                // Conflicts after spawning are still caught by port negotiation.
                warn!("Bind negotiation task failed: {}", e);
                Ok(BindConfig::loopback(self.base_port))
            }
        }
    }
}

/// Local address of the interface that routes to the internet.
pub fn detect_lan_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(LAN_DISCOVERY_TARGET).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() || ip.is_loopback() {
        return None;
    }
    Some(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_config_has_no_bind_address() {
        let listener = TcpListener::bind((LOOPBACK, 0)).unwrap();
        let base = listener.local_addr().unwrap().port();
        drop(listener);
        if !(1024..=MAX_PORT).contains(&base) {
            return;
        }

        let config = LocalBindConfig::new(base).negotiate(false).await.unwrap();
        assert_eq!(config.bind_address, None);
        assert_eq!(config.lan_ip, None);
    }

    #[tokio::test]
    async fn busy_base_port_moves_up() {
        // Find a free pair inside the allowed range.
        let Some(base) = (4000..MAX_PORT - 1).find(|p| {
            TcpListener::bind((LOOPBACK, *p)).is_ok() && TcpListener::bind((LOOPBACK, *p + 1)).is_ok()
        }) else {
            return;
        };
        let _held = TcpListener::bind((LOOPBACK, base)).unwrap();

        let config = LocalBindConfig::new(base).negotiate(false).await.unwrap();
        assert!(config.port > base);
        assert!(config.port <= MAX_PORT);
    }

    #[tokio::test]
    async fn rejects_privileged_base_port() {
        let err = LocalBindConfig::new(80).negotiate(false).await.unwrap_err();
        assert!(matches!(err, BindError::PortOutOfRange(80)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn negotiation_does_not_stall_other_tasks() {
        let ticker = tokio::spawn(async { tokio::task::yield_now().await });
        let config = LocalBindConfig::default().negotiate(false).await.unwrap();
        ticker.await.unwrap();
        assert!((DEFAULT_PORT..=MAX_PORT).contains(&config.port));
    }

    #[test]
    fn lan_endpoint_uses_bound_port() {
        let config = BindConfig {
            port: 8080,
            bind_address: Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            lan_ip: Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))),
        };
        assert_eq!(
            config.lan_endpoint(8082),
            Some("192.168.1.20:8082".parse().unwrap())
        );
    }
}
