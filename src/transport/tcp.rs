//! TCP dialing

use super::{TransportConfig, TransportError};
use tokio::net::TcpStream;
use tracing::debug;

/// Connect to `addr` (`host:port`), bounded by the configured timeout
pub async fn dial(addr: &str, config: &TransportConfig) -> Result<TcpStream, TransportError> {
    let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

    // Configure TCP options
    if config.nodelay {
        stream.set_nodelay(true).ok();
    }

    debug!("Dialed {}", addr);
    Ok(stream)
}
