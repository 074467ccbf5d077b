//! Ingress edge
//!
//! Provides:
//! - SOCKS5 proxy server feeding accepted sockets into tunnel channels

#[cfg(feature = "socks5")]
mod socks5;

#[cfg(feature = "socks5")]
pub use socks5::{handle_connection, Socks5Server};

use crate::tunnel::{Channel, TunnelError};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(ip, port) => {
                write!(f, "{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
            }
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// Opens a tunnel channel to a destination on behalf of the ingress edge
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    /// `destination` is `host:port`; `trace_id` tags the request in logs on
    /// both ends
    async fn open_channel(
        &self,
        destination: &str,
        trace_id: &str,
    ) -> Result<Arc<Channel>, TunnelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        assert_eq!(Address::Ipv4([127, 0, 0, 1], 8080).to_string(), "127.0.0.1:8080");
        assert_eq!(
            Address::Domain("example.com".to_string(), 443).to_string(),
            "example.com:443"
        );
    }
}
