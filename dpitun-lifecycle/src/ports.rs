//! Linear port negotiation within one connect chain.

use dpitun_core::bind::{MAX_PORT, MAX_PORT_ATTEMPTS};

use crate::error::EngineError;

/// Current candidate port and how many conflicts led to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortNegotiation {
    current_port: u16,
    retry_count: u16,
}

impl PortNegotiation {
    pub fn new(initial_port: u16) -> Self {
        Self {
            current_port: initial_port,
            retry_count: 0,
        }
    }

    pub fn port(&self) -> u16 {
        self.current_port
    }

    pub fn retry_count(&self) -> u16 {
        self.retry_count
    }

    /// Fails once the attempt budget or the port ceiling is exceeded.
    pub fn check(&self) -> Result<u16, EngineError> {
        if self.retry_count >= MAX_PORT_ATTEMPTS || self.current_port > MAX_PORT {
            return Err(EngineError::NoAvailablePort {
                last_port: self.current_port,
                attempts: self.retry_count,
            });
        }
        Ok(self.current_port)
    }

    /// Candidate after a bind conflict on the current port.
    pub fn next(&self) -> Self {
        Self {
            current_port: self.current_port.saturating_add(1),
            retry_count: self.retry_count.saturating_add(1),
        }
    }
}
