//! Relay health checking over TCP.

use std::time::Duration;

use edge_topology::{RelayHealthCheck, RelayServer};
use tokio::net::TcpStream;
use tracing::debug;

/// Considers a relay healthy if its TURN port accepts a TCP connection.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnectCheck {
    timeout: Duration,
}

impl TcpConnectCheck {
    /// Creates a check with a connect timeout.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl RelayHealthCheck for TcpConnectCheck {
    async fn check(&self, server: &RelayServer) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(server.address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(relay_id = %server.id, address = %server.address, error = %e, "Relay connect failed");
                false
            }
            Err(_) => {
                debug!(relay_id = %server.id, address = %server.address, "Relay connect timed out");
                false
            }
        }
    }
}
