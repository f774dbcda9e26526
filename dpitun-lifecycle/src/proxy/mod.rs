//! System proxy synchronization.
//!
//! The OS proxy is a single process-wide resource. Only the connection
//! manager touches it, through [`ProxySynchronizer`], so that it never points
//! at a port without a live engine behind it.

mod os;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::ProxyError;

pub use os::{OsProxy, ProxyBackend, ProxyStep, StepRole};

#[async_trait]
pub trait SystemProxy: Send + Sync {
    /// Point the system proxy at `127.0.0.1:<port>`.
    async fn apply(&self, port: u16) -> Result<(), ProxyError>;

    /// Remove the system proxy. Safe to call when nothing is set.
    async fn clear(&self) -> Result<(), ProxyError>;
}

/// Tracks what was last applied on top of a [`SystemProxy`].
///
/// There is no retry here. Failures are returned for the caller to log, and
/// the next lifecycle transition re-applies or re-clears anyway.
#[derive(Clone)]
pub struct ProxySynchronizer {
    proxy: Arc<dyn SystemProxy>,
    applied: Option<u16>,
}

impl std::fmt::Debug for ProxySynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySynchronizer")
            .field("applied", &self.applied)
            .finish_non_exhaustive()
    }
}

impl ProxySynchronizer {
    pub fn new(proxy: Arc<dyn SystemProxy>) -> Self {
        Self {
            proxy,
            applied: None,
        }
    }

    /// Port the system proxy was last successfully pointed at.
    pub fn applied(&self) -> Option<u16> {
        self.applied
    }

    pub async fn apply(&mut self, port: u16) -> Result<(), ProxyError> {
        debug!("Applying system proxy 127.0.0.1:{}", port);
        match self.proxy.apply(port).await {
            Ok(()) => {
                self.applied = Some(port);
                Ok(())
            }
            Err(e) => {
                // A failed apply may have left a partial write behind.
                self.applied = None;
                Err(e)
            }
        }
    }

    /// Always reaches the OS, even when nothing is believed to be applied.
    pub async fn clear(&mut self) -> Result<(), ProxyError> {
        debug!("Clearing system proxy");
        self.proxy.clear().await?;
        self.applied = None;
        Ok(())
    }
}
