//! Deliver-or-timeout handle for one outstanding request

use crate::protocol::ControlMessage;
use crate::tunnel::{Connection, TunnelError};
use std::sync::Weak;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// Runs once with the response, inside the connection's read task
pub type Callback = Box<dyn FnOnce(&ControlMessage) + Send>;

/// Request-table entry of an outstanding request
pub struct PendingRequest {
    tx: oneshot::Sender<ControlMessage>,
    callback: Option<Callback>,
}

impl PendingRequest {
    pub fn new(tx: oneshot::Sender<ControlMessage>, callback: Option<Callback>) -> Self {
        Self { tx, callback }
    }

    /// Hand the response to the waiter. Returns false if nobody is waiting
    /// any more, in which case the callback is not run.
    pub fn deliver(self, response: ControlMessage) -> bool {
        if self.tx.is_closed() {
            return false;
        }
        if let Some(callback) = self.callback {
            callback(&response);
        }
        self.tx.send(response).is_ok()
    }
}

/// Outstanding request awaiting its response
pub struct Promise {
    id: u32,
    rx: oneshot::Receiver<ControlMessage>,
    deadline: Instant,
    conn: Weak<Connection>,
}

impl Promise {
    pub(crate) fn new(
        id: u32,
        rx: oneshot::Receiver<ControlMessage>,
        deadline: Instant,
        conn: Weak<Connection>,
    ) -> Self {
        Self {
            id,
            rx,
            deadline,
            conn,
        }
    }

    /// Request id this promise waits on
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Wait for the response until the deadline.
    ///
    /// Fails with `Timeout` when the deadline passes first, and with
    /// `ConnectionClosed` when the connection is torn down while waiting.
    pub async fn get(mut self) -> Result<ControlMessage, TunnelError> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TunnelError::ConnectionClosed),
            Err(_) => {
                let forgotten = match self.conn.upgrade() {
                    Some(conn) => conn.forget_request(self.id),
                    None => true,
                };
                if forgotten {
                    debug!("Request {} timed out", self.id);
                    return Err(TunnelError::Timeout);
                }

                // Lost the race against delivery; the response is in flight
                (&mut self.rx).await.map_err(|_| TunnelError::Timeout)
            }
        }
    }
}

impl Drop for Promise {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            conn.forget_request(self.id);
        }
    }
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .finish()
    }
}
