use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

/// Confirms that a port which the engine claims to serve accepts connections.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, port: u16) -> bool;
}

/// Sends `HEAD http://127.0.0.1:<port>/` until any HTTP response arrives.
///
/// The engine is itself an HTTP proxy, so a 4xx for the bare path is as good
/// as a 200. Requests bypass any proxy configured in the environment, which
/// may already point at this very port.
#[derive(Debug, Clone)]
pub struct HttpReadinessProbe {
    pub attempts: u32,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HttpReadinessProbe {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_millis(150),
            timeout: Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn probe(&self, port: u16) -> bool {
        let client = match reqwest::Client::builder()
            .no_proxy()
            .timeout(self.timeout)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!("Failed to build probe client: {}", e);
                return false;
            }
        };
        let url = format!("http://127.0.0.1:{port}/");

        for attempt in 1..=self.attempts {
            match client.head(&url).send().await {
                Ok(response) => {
                    debug!(
                        "Port {} answered probe {} with {}",
                        port,
                        attempt,
                        response.status()
                    );
                    return true;
                }
                Err(e) => {
                    debug!("Probe {}/{} of port {} failed: {}", attempt, self.attempts, port, e);
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal HTTP server answering every request with `status_line`.
    async fn spawn_test_server(status_line: &'static str) -> (u16, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 1024];
                let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
                let response = format!("{status_line}\r\nContent-Length: 0\r\n\r\n");
                let _ = tokio::io::AsyncWriteExt::write_all(&mut stream, response.as_bytes()).await;
            }
        });

        (port, handle)
    }

    fn fast_probe() -> HttpReadinessProbe {
        HttpReadinessProbe {
            attempts: 3,
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn succeeds_on_any_response() {
        let (port, _server) = spawn_test_server("HTTP/1.1 400 Bad Request").await;
        assert!(fast_probe().probe(port).await);
    }

    #[tokio::test]
    async fn fails_when_nothing_listens() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!fast_probe().probe(port).await);
    }
}
