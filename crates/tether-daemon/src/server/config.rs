//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// WebSocket server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP bind address.
    pub listen_addr: SocketAddr,

    /// Largest client message accepted, in bytes.
    pub max_message_bytes: usize,

    /// Capacity of each connection's outbound frame queue.
    pub outbound_capacity: usize,

    /// Longest a single socket write may block before the client is dropped.
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7780)),
            max_message_bytes: 10 * 1024 * 1024, // 10 MB
            outbound_capacity: 256,
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Create a new server config listening on `addr`.
    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            listen_addr: addr,
            ..Default::default()
        }
    }

    /// Set the maximum client message size.
    #[must_use]
    pub const fn with_max_message_bytes(mut self, max: usize) -> Self {
        self.max_message_bytes = max;
        self
    }

    /// Set the per-connection outbound queue capacity.
    #[must_use]
    pub const fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    #[must_use]
    pub const fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_loopback() {
        let config = ServerConfig::default();
        assert!(config.listen_addr.ip().is_loopback());
        assert_eq!(config.max_message_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn builder_overrides() {
        let addr = SocketAddr::from(([0, 0, 0, 0], 9000));
        let config = ServerConfig::tcp(addr).with_max_message_bytes(4096);
        assert_eq!(config.listen_addr, addr);
        assert_eq!(config.max_message_bytes, 4096);
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.write_timeout, Duration::from_secs(10));

        let config = config
            .with_outbound_capacity(4)
            .with_write_timeout(Duration::from_millis(250));
        assert_eq!(config.outbound_capacity, 4);
        assert_eq!(config.write_timeout, Duration::from_millis(250));
    }
}
