//! Listener configuration

use std::net::IpAddr;
use std::time::Duration;

/// Configuration of one listening server (control or live stream)
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Addresses to bind, one listener per address family
    pub bind_addrs: Vec<IpAddr>,

    /// Port to listen on (0 = ephemeral)
    pub port: u16,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Timeout for reading a request line or header
    pub read_timeout: Duration,

    /// Longest accepted request or header line
    pub max_line_length: usize,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addrs: vec![
                IpAddr::from([0, 0, 0, 0]),
                IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 0]),
            ],
            port: 8080,
            max_connections: 0, // Unlimited
            read_timeout: Duration::from_secs(10),
            max_line_length: 1024,
            tcp_nodelay: true,
        }
    }
}

impl ServerConfig {
    /// Default config listening on `port`
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Replace the bind addresses
    pub fn bind(mut self, addrs: Vec<IpAddr>) -> Self {
        self.bind_addrs = addrs;
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set read timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set maximum line length
    pub fn max_line_length(mut self, len: usize) -> Self {
        self.max_line_length = len;
        self
    }
}
