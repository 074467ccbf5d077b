//! Bidirectional pump between a virtual channel and a real socket

use super::{wait_closed, Channel, ChannelState};
use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Read buffer size of the socket-to-channel pump
pub const FORWARD_BUFFER_SIZE: usize = 16 * 1024;

/// Open/closed flag for the socket side of a flow.
///
/// The socket halves themselves are owned by the pumps; closing the
/// `RemoteConn` makes both pumps drop them.
pub struct RemoteConn {
    label: String,
    state: Mutex<ChannelState>,
    closed: watch::Sender<bool>,
}

impl RemoteConn {
    pub fn new(label: impl Into<String>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            label: label.into(),
            state: Mutex::new(ChannelState::Open),
            closed,
        }
    }

    pub fn available(&self) -> bool {
        *self.lock_state() == ChannelState::Open
    }

    pub fn close(&self) {
        let mut state = self.lock_state();
        if *state == ChannelState::Closed {
            return;
        }
        *state = ChannelState::Closed;
        self.closed.send_replace(true);
        debug!("Closed remote conn {}", self.label);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Display for RemoteConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Handles of the two pumps of one flow
pub struct Forward {
    /// Channel to socket; yields bytes written to the socket
    pub to_remote: JoinHandle<u64>,
    /// Socket to channel; yields bytes written to the channel
    pub to_channel: JoinHandle<u64>,
}

impl Forward {
    /// Wait for both directions to finish
    pub async fn join(self) -> (u64, u64) {
        let to_remote = self.to_remote.await.unwrap_or(0);
        let to_channel = self.to_channel.await.unwrap_or(0);
        (to_remote, to_channel)
    }
}

/// Splice `channel` and `stream` together.
///
/// Both directions run as independent tasks. Whichever finishes first closes
/// both ends, which in turn stops the other direction.
pub fn flow_forward<S>(channel: Arc<Channel>, stream: S, label: impl Into<String>) -> Forward
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let remote = Arc::new(RemoteConn::new(label));
    let (reader, writer) = tokio::io::split(stream);

    debug!("Start forwarding {} <-> {}", channel, remote);

    let to_remote = tokio::spawn(channel_to_remote(
        Arc::clone(&channel),
        Arc::clone(&remote),
        writer,
    ));
    let to_channel = tokio::spawn(remote_to_channel(channel, remote, reader));

    Forward {
        to_remote,
        to_channel,
    }
}

async fn channel_to_remote<W>(channel: Arc<Channel>, remote: Arc<RemoteConn>, mut writer: W) -> u64
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;

    if channel.available() && remote.available() {
        let mut remote_closed = remote.subscribe();

        loop {
            let data = tokio::select! {
                data = channel.read() => match data {
                    Ok(data) => data,
                    Err(_) => break,
                },
                _ = wait_closed(&mut remote_closed) => break,
            };

            let result = tokio::select! {
                result = writer.write_all(&data) => result,
                _ = wait_closed(&mut remote_closed) => break,
            };
            if let Err(e) = result {
                debug!("Write to {} failed: {}", remote, e);
                break;
            }
            written += data.len() as u64;
        }
    }

    let _ = writer.shutdown().await;
    remote.close();
    channel.close();

    debug!("Stop {} -> {}, written: {}", channel, remote, written);
    written
}

async fn remote_to_channel<R>(channel: Arc<Channel>, remote: Arc<RemoteConn>, mut reader: R) -> u64
where
    R: AsyncRead + Unpin,
{
    let mut written = 0u64;

    if channel.available() && remote.available() {
        let mut remote_closed = remote.subscribe();
        let mut buf = vec![0u8; FORWARD_BUFFER_SIZE];

        loop {
            let n = tokio::select! {
                result = reader.read(&mut buf) => match result {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Read from {} failed: {}", remote, e);
                        break;
                    }
                },
                _ = wait_closed(&mut remote_closed) => break,
                _ = channel.closed() => break,
            };

            if let Err(e) = channel.write(Bytes::copy_from_slice(&buf[..n])).await {
                debug!("Write to channel {} failed: {}", channel, e);
                break;
            }
            written += n as u64;
        }
    }

    remote.close();
    channel.close();

    debug!("Stop {} -> {}, written: {}", remote, channel, written);
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::ProcessorRegistry;
    use crate::tunnel::{Connection, ConnectionConfig, Role, TunnelError};

    fn pair() -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let registry = Arc::new(ProcessorRegistry::new());
        (
            Connection::spawn(
                a,
                "responder",
                Role::Initiator,
                ConnectionConfig::default(),
                Arc::clone(&registry),
            ),
            Connection::spawn(b, "initiator", Role::Responder, ConnectionConfig::default(), registry),
        )
    }

    #[tokio::test]
    async fn test_forward_both_directions() {
        let (initiator, responder) = pair();
        let remote_end = responder.apply_channel().unwrap();
        let local = initiator.register_channel(remote_end.id()).unwrap();

        let (socket, mut app) = tokio::io::duplex(1024);
        let forward = flow_forward(Arc::clone(&remote_end), socket, "app");

        local.write(Bytes::from_static(b"request")).await.unwrap();
        let mut buf = [0u8; 7];
        app.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        app.write_all(b"response").await.unwrap();
        assert_eq!(&local.read().await.unwrap()[..], b"response");

        drop(app);
        let (to_remote, to_channel) = forward.join().await;
        assert_eq!(to_remote, 7);
        assert_eq!(to_channel, 8);
        assert!(!remote_end.available());
        assert_eq!(responder.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_does_no_work() {
        let (_initiator, responder) = pair();
        let channel = responder.apply_channel().unwrap();
        channel.close();

        let (socket, mut app) = tokio::io::duplex(1024);
        let forward = flow_forward(channel, socket, "app");
        assert_eq!(forward.join().await, (0, 0));

        let mut buf = [0u8; 1];
        assert_eq!(app.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connection_teardown_stops_flow() {
        let (initiator, responder) = pair();
        let channel = responder.apply_channel().unwrap();

        let (socket, mut app) = tokio::io::duplex(1024);
        let forward = flow_forward(Arc::clone(&channel), socket, "app");

        responder.close();
        forward.join().await;

        let mut buf = [0u8; 1];
        assert_eq!(app.read(&mut buf).await.unwrap(), 0);
        assert!(matches!(channel.read().await, Err(TunnelError::ChannelClosed)));
        drop(initiator);
    }

    #[test]
    fn test_remote_conn_close_idempotent() {
        let remote = RemoteConn::new("dest");
        assert!(remote.available());
        remote.close();
        remote.close();
        assert!(!remote.available());
    }
}
