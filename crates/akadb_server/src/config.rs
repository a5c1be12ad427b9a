//! Server configuration.

use akadb_core::NodeId;
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Node used when a request names none.
    pub local_node: NodeId,
    /// How long a node may take to answer the status probe.
    pub probe_timeout: Duration,
    /// Time allowed to read one request.
    pub request_timeout: Duration,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// Default number of log entries returned by `/logs`.
    pub log_tail: usize,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            local_node: NodeId::CENTRAL,
            probe_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 1024 * 1024,
            log_tail: 50,
        }
    }

    /// Sets the local node.
    pub fn with_local_node(mut self, node: NodeId) -> Self {
        self.local_node = node;
        self
    }

    /// Sets the liveness probe timeout.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the maximum body size.
    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}
