//! Virtual channel: one logical byte stream multiplexed over a connection

use super::{wait_closed, Connection, TunnelError};
use crate::protocol::Envelope;
use bytes::Bytes;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, trace, warn};

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Channel is open and accepts data
    Open,
    /// Channel is closed; no further data is admitted
    Closed,
}

/// A multiplexed channel within a connection.
///
/// Writes are wrapped into `Flow` envelopes and queued on the owning
/// connection. Reads drain the bounded inbound queue filled by the
/// connection's read task.
pub struct Channel {
    id: u32,
    peer: String,
    conn: Weak<Connection>,
    state: Mutex<ChannelState>,
    closed: watch::Sender<bool>,
    inbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: AsyncMutex<mpsc::Receiver<Bytes>>,
}

impl Channel {
    pub(crate) fn new(id: u32, peer: String, conn: Weak<Connection>, capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        Self {
            id,
            peer,
            conn,
            state: Mutex::new(ChannelState::Open),
            closed,
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
        }
    }

    /// Get channel ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Get current state
    pub fn state(&self) -> ChannelState {
        *self.lock_state()
    }

    /// Whether the channel still accepts and yields data
    pub fn available(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Send data to the peer's end of this channel
    pub async fn write(&self, data: Bytes) -> Result<(), TunnelError> {
        if !self.available() {
            return Err(TunnelError::ChannelClosed);
        }

        let conn = self.conn.upgrade().ok_or(TunnelError::ConnectionClosed)?;
        conn.send_envelope(Envelope::flow(self.id, data)).await
    }

    /// Wait for the next inbound chunk.
    ///
    /// Fails with `ChannelClosed` once the channel is closed, even if chunks
    /// are still queued.
    pub async fn read(&self) -> Result<Bytes, TunnelError> {
        let mut closed = self.closed.subscribe();

        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => Err(TunnelError::ChannelClosed),
            chunk = async {
                let mut inbound = self.inbound_rx.lock().await;
                inbound.recv().await
            } => chunk.ok_or(TunnelError::ChannelClosed),
        }
    }

    /// Close the channel and deregister it from its connection
    pub fn close(&self) {
        {
            let mut state = self.lock_state();
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
            self.closed.send_replace(true);
        }

        debug!("Channel {} closed", self);

        if let Some(conn) = self.conn.upgrade() {
            conn.detach_channel(self.id, self);
        }
    }

    /// Resolves once the channel is closed
    pub async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        wait_closed(&mut closed).await;
    }

    /// Append data received from the peer without waiting.
    ///
    /// Returns false if the channel is closed. A full inbound queue closes
    /// the channel and drops the chunk, so one stalled reader never holds
    /// up the connection's read task.
    pub(crate) fn push(&self, data: Bytes) -> bool {
        if !self.available() {
            return false;
        }

        let len = data.len();
        match self.inbound_tx.try_send(data) {
            Ok(()) => {
                trace!("Channel {} queued {} bytes", self, len);
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!("Channel {} inbound queue full, closing", self);
                self.close();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.peer, self.id)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}
