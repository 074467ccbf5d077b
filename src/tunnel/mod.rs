//! Tunnel layer - virtual channels multiplexed over one physical connection
//!
//! Provides:
//! - Connection (read/write/heartbeat tasks, envelope dispatch)
//! - Virtual channels with bounded inbound queues
//! - Flow forwarding between a channel and a real socket
//! - Id generation for channels and requests

mod channel;
mod connection;
mod forward;
mod id;

pub use channel::{Channel, ChannelState};
pub use connection::{Connection, ConnectionConfig, ConnectionState, Role};
pub use forward::{flow_forward, Forward, RemoteConn};
pub use id::IdGenerator;

use crate::protocol::ProtocolError;
use thiserror::Error;
use tokio::sync::watch;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Channel id already in use: {0}")]
    ChannelExists(u32),

    #[error("Request id already in use: {0}")]
    RequestExists(u32),

    #[error("Request timed out")]
    Timeout,

    #[error("Request failed with code {code}: {message}")]
    RequestFailed { code: i32, message: String },

    #[error("Tunnel not ready")]
    NotReady,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Default inbound queue capacity of a channel, in chunks
pub const DEFAULT_CHANNEL_QUEUE: usize = 1024;

/// Default outbound queue capacity of a connection, in frames
pub const DEFAULT_OUTBOUND_QUEUE: usize = 1024;

/// Resolves once the watched flag turns true or its sender is gone
pub(crate) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}
