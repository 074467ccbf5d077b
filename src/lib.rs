//! # muxtunnel
//!
//! A SOCKS5 ingress that carries many TCP connections over one persistent
//! tunnel connection to a remote endpoint, which dials the real
//! destinations.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Ingress Layer                     │
//! │        (SOCKS5 CONNECT, client login/reconnect)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Multiplexing Layer                  │
//! │     (Virtual channels, flow forwarding, id space)    │
//! ├─────────────────────────────────────────────────────┤
//! │                    Control Layer                     │
//! │      (Request/response correlation, processors)      │
//! ├─────────────────────────────────────────────────────┤
//! │                   Connection Layer                   │
//! │   (Envelopes, framing, read/write/heartbeat tasks)   │
//! ├─────────────────────────────────────────────────────┤
//! │                   Transport Layer                    │
//! │                         (TCP)                        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod protocol;
pub mod proxy;
pub mod rpc;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use client::{Client, ClientOptions, ClientState};
pub use config::Config;
pub use server::{Server, ServerOptions};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),
}
