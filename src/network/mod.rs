//! Network module - Handles TCP/TLS communication between hub and peers
//!
//! Provides:
//! - Hub for accepting peers, tracking membership and relaying payloads
//! - Peer for connecting to a hub
//! - Connection plumbing shared by both sides

mod client;
mod connection;
mod relay;
mod server;
mod session;
mod tls;
mod transmitter;

pub use client::*;
pub use connection::*;
pub use relay::*;
pub use server::*;
pub use session::*;
pub use tls::*;
pub use transmitter::*;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::context::Timings;

/// What a peer does when its hub connection goes away unexpectedly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InactiveAction {
    /// Exit the process
    Shutdown,
    /// Log and stay up; reconnecting is up to the application
    #[default]
    Retry,
}

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address to bind (hub) or hostname to connect to (peer)
    pub host: String,
    /// Port to listen on or connect to
    pub port: u16,
    /// Whether to use TLS encryption
    pub use_tls: bool,
    /// Connection and handshake timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Peer reaction to losing the hub
    pub inactive_action: InactiveAction,
    pub timings: Timings,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: crate::protocol::DEFAULT_PORT,
            use_tls: false,
            connect_timeout_ms: 5000,
            inactive_action: InactiveAction::default(),
            timings: Timings::default(),
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_tls(mut self) -> Self {
        self.use_tls = true;
        self
    }

    pub fn without_tls(mut self) -> Self {
        self.use_tls = false;
        self
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
