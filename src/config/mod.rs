//! Configuration management

use crate::transport::TransportConfig;
use crate::tunnel::ConnectionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Client configuration
    pub client: ClientConfig,
    /// Multiplexing and liveness tunables, shared by both ends
    pub tunnel: TunnelConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Maximum concurrent tunnel connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9090".to_string(),
            max_connections: 1000,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address
    pub server: String,
    /// Local SOCKS5 proxy address
    pub socks5_listen: String,
    /// Login name
    pub username: String,
    /// Login password
    pub password: String,
    /// Seconds between reconnect attempts while the tunnel is down
    pub reconnect_interval: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:9090".to_string(),
            socks5_listen: "127.0.0.1:1080".to_string(),
            username: "Allen".to_string(),
            password: "Allen".to_string(),
            reconnect_interval: 5,
        }
    }
}

/// Tunnel tunables. Durations are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Ping interval of the dialing side
    pub heartbeat_interval: u64,
    /// Connection is dropped after this long without ping/pong
    pub heartbeat_timeout: u64,
    /// Deadline for login and channel setup requests
    pub rpc_timeout: u64,
    /// Destination connect timeout
    pub connect_timeout: u64,
    /// Inbound queue capacity per channel, in chunks
    pub channel_queue: usize,
    /// Outbound queue capacity per connection, in frames
    pub outbound_queue: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: 5,
            heartbeat_timeout: 15,
            rpc_timeout: 5,
            connect_timeout: 10,
            channel_queue: crate::tunnel::DEFAULT_CHANNEL_QUEUE,
            outbound_queue: crate::tunnel::DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

impl TunnelConfig {
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval.max(1)),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout),
            outbound_queue: self.outbound_queue,
            channel_queue: self.channel_queue,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            ..TransportConfig::default()
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config::default()
}
