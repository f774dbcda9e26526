//! DNS override providers and latency ranking.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use tokio::net::TcpStream;
use tracing::debug;

/// DNS resolver handed to the engine with `-dns-addr`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DnsProvider {
    /// Keep the engine's default resolver.
    System,
    #[default]
    Cloudflare,
    Adguard,
    Google,
    #[serde(rename = "quad9")]
    #[strum(serialize = "quad9")]
    Quad9,
    Opendns,
}

impl DnsProvider {
    pub fn ip(self) -> Option<IpAddr> {
        let ip = match self {
            DnsProvider::System => return None,
            DnsProvider::Cloudflare => Ipv4Addr::new(1, 1, 1, 1),
            DnsProvider::Adguard => Ipv4Addr::new(94, 140, 14, 14),
            DnsProvider::Google => Ipv4Addr::new(8, 8, 8, 8),
            DnsProvider::Quad9 => Ipv4Addr::new(9, 9, 9, 9),
            DnsProvider::Opendns => Ipv4Addr::new(208, 67, 222, 222),
        };
        Some(IpAddr::V4(ip))
    }

    /// Providers that carry an explicit resolver address.
    pub fn with_address() -> impl Iterator<Item = DnsProvider> {
        DnsProvider::iter().filter(|p| p.ip().is_some())
    }

    /// Upper-case label used in status text.
    pub fn label(self) -> String {
        self.to_string().to_uppercase()
    }
}

/// Result of timing one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsLatency {
    pub provider: DnsProvider,
    /// `None` when the resolver did not answer within the timeout.
    pub latency: Option<Duration>,
}

/// Time a TCP connect to port 53 of every provider with an address.
///
/// Results are sorted fastest first; unreachable providers go last in table
/// order.
pub async fn rank_providers(timeout: Duration) -> Vec<DnsLatency> {
    let probes = DnsProvider::with_address().map(|provider| async move {
        DnsLatency {
            provider,
            latency: measure(provider, timeout).await,
        }
    });
    let mut results = join_all(probes).await;
    results.sort_by_key(|r| r.latency.unwrap_or(Duration::MAX));
    results
}

async fn measure(provider: DnsProvider, timeout: Duration) -> Option<Duration> {
    let ip = provider.ip()?;
    let started = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect(SocketAddr::new(ip, 53))).await {
        Ok(Ok(_)) => Some(started.elapsed()),
        Ok(Err(e)) => {
            debug!("DNS probe for {} failed: {}", provider, e);
            None
        }
        Err(_) => {
            debug!("DNS probe for {} timed out", provider);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn system_has_no_address() {
        assert_eq!(DnsProvider::System.ip(), None);
        assert!(DnsProvider::with_address().all(|p| p != DnsProvider::System));
        assert_eq!(DnsProvider::with_address().count(), 5);
    }

    #[test]
    fn provider_names_round_trip_through_strum() {
        assert_eq!(DnsProvider::from_str("quad9").unwrap(), DnsProvider::Quad9);
        assert_eq!(DnsProvider::Opendns.to_string(), "opendns");
        assert_eq!(DnsProvider::Adguard.label(), "ADGUARD");
    }

    #[test]
    fn provider_addresses() {
        assert_eq!(
            DnsProvider::Adguard.ip(),
            Some("94.140.14.14".parse().unwrap())
        );
        assert_eq!(
            DnsProvider::Opendns.ip(),
            Some("208.67.222.222".parse().unwrap())
        );
    }
}
