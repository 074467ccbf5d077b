//! Connection management for the tunnel
//!
//! Handles the full lifecycle of one physical connection:
//! - Read task: decodes frames and dispatches envelopes
//! - Write task: drains the outbound queue onto the stream
//! - Heartbeat task: sends pings (initiator) and detects a dead peer
//! - Channel and pending-request tables

use super::{wait_closed, Channel, IdGenerator, TunnelError};
use super::{DEFAULT_CHANNEL_QUEUE, DEFAULT_OUTBOUND_QUEUE};
use crate::protocol::{
    self, ControlCommand, ControlKind, ControlMessage, Envelope, EnvelopeCmd, ProtocolError,
};
use crate::rpc::{PendingRequest, ProcessorRegistry, RequestContext};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Which end of the physical connection this is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dialed the connection; sends heartbeats and issues requests
    Initiator,
    /// Accepted the connection; answers heartbeats and requests
    Responder,
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

/// Connection tunables
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Interval between heartbeat checks (and pings, on the initiator)
    pub heartbeat_interval: Duration,
    /// Connection is dead when no ping/pong arrived for this long
    pub heartbeat_timeout: Duration,
    /// Capacity of the outbound frame queue
    pub outbound_queue: usize,
    /// Capacity of each channel's inbound queue
    pub channel_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            channel_queue: DEFAULT_CHANNEL_QUEUE,
        }
    }
}

/// Everything mutated from more than one task, behind a single lock
struct Shared {
    state: ConnectionState,
    outbound: Option<mpsc::Sender<Bytes>>,
    channels: HashMap<u32, Arc<Channel>>,
    requests: HashMap<u32, PendingRequest>,
    last_heartbeat: Instant,
}

/// A physical duplex stream carrying many virtual channels
pub struct Connection {
    peer: String,
    role: Role,
    config: ConnectionConfig,
    channel_ids: IdGenerator,
    request_ids: IdGenerator,
    shared: Mutex<Shared>,
    shutdown: watch::Sender<bool>,
    processors: Arc<ProcessorRegistry>,
}

impl Connection {
    /// Take ownership of an established stream and start the read, write
    /// and heartbeat tasks
    pub fn spawn<S>(
        stream: S,
        peer: impl Into<String>,
        role: Role,
        config: ConnectionConfig,
        processors: Arc<ProcessorRegistry>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
        let (shutdown, _) = watch::channel(false);

        let conn = Arc::new(Self {
            peer: peer.into(),
            role,
            config,
            channel_ids: IdGenerator::new(0),
            request_ids: IdGenerator::new(0),
            shared: Mutex::new(Shared {
                state: ConnectionState::Open,
                outbound: Some(outbound_tx),
                channels: HashMap::new(),
                requests: HashMap::new(),
                last_heartbeat: Instant::now(),
            }),
            shutdown,
            processors,
        });

        info!("Connection to {} established ({:?})", conn.peer, role);

        tokio::spawn(Self::write_loop(
            Arc::downgrade(&conn),
            write_half,
            outbound_rx,
            conn.shutdown.subscribe(),
        ));
        tokio::spawn(Self::heartbeat_loop(
            Arc::downgrade(&conn),
            conn.shutdown.subscribe(),
        ));
        tokio::spawn(Arc::clone(&conn).read_loop(BufReader::new(read_half)));

        conn
    }

    /// Remote address (for logging)
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Resolves once the connection has been torn down
    pub async fn closed(&self) {
        let mut shutdown = self.shutdown.subscribe();
        wait_closed(&mut shutdown).await;
    }

    /// Allocate the next channel id and register a new open channel under it
    pub fn apply_channel(self: &Arc<Self>) -> Result<Arc<Channel>, TunnelError> {
        let mut shared = self.lock();
        if shared.state == ConnectionState::Closed {
            return Err(TunnelError::ConnectionClosed);
        }

        let id = self.channel_ids.next();
        let channel = Arc::new(self.new_channel(id));
        shared.channels.insert(id, Arc::clone(&channel));

        debug!("Applied channel {}", channel);
        Ok(channel)
    }

    /// Register a channel under an id assigned by the peer
    pub fn register_channel(self: &Arc<Self>, id: u32) -> Result<Arc<Channel>, TunnelError> {
        let mut shared = self.lock();
        if shared.state == ConnectionState::Closed {
            return Err(TunnelError::ConnectionClosed);
        }
        if shared.channels.contains_key(&id) {
            return Err(TunnelError::ChannelExists(id));
        }

        let channel = Arc::new(self.new_channel(id));
        shared.channels.insert(id, Arc::clone(&channel));

        debug!("Registered channel {}", channel);
        Ok(channel)
    }

    /// Deregister a channel. Removing an unknown id is a no-op.
    pub fn remove_channel(&self, id: u32) -> Option<Arc<Channel>> {
        self.lock().channels.remove(&id)
    }

    /// Look up an open channel by id
    pub fn channel(&self, id: u32) -> Option<Arc<Channel>> {
        self.lock().channels.get(&id).cloned()
    }

    /// Get number of registered channels
    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    /// Remove `channel` from the table, unless its id has since been taken
    /// by another instance
    pub(crate) fn detach_channel(&self, id: u32, channel: &Channel) {
        let mut shared = self.lock();
        if let Some(existing) = shared.channels.get(&id) {
            if std::ptr::eq(Arc::as_ptr(existing), channel) {
                shared.channels.remove(&id);
            }
        }
    }

    fn new_channel(self: &Arc<Self>, id: u32) -> Channel {
        Channel::new(
            id,
            self.peer.clone(),
            Arc::downgrade(self),
            self.config.channel_queue,
        )
    }

    /// Queue an already framed buffer for the write task
    pub async fn write_bytes(&self, frame: Bytes) -> Result<(), TunnelError> {
        let outbound = {
            let shared = self.lock();
            if shared.state == ConnectionState::Closed {
                trace!("Dropping write to closed connection {}", self.peer);
                return Err(TunnelError::ConnectionClosed);
            }
            shared
                .outbound
                .clone()
                .ok_or(TunnelError::ConnectionClosed)?
        };

        outbound
            .send(frame)
            .await
            .map_err(|_| TunnelError::ConnectionClosed)
    }

    /// Frame an envelope and queue it
    pub async fn send_envelope(&self, envelope: Envelope) -> Result<(), TunnelError> {
        let frame = envelope.to_frame()?;
        self.write_bytes(frame).await
    }

    /// Build a request carrying a fresh request id
    pub fn new_request(&self, cmd: ControlCommand, payload: Bytes) -> ControlMessage {
        ControlMessage::request(cmd, self.request_ids.next(), payload)
    }

    /// Track an outstanding request until its response or its deadline
    pub fn register_request(&self, id: u32, pending: PendingRequest) -> Result<(), TunnelError> {
        let mut shared = self.lock();
        if shared.state == ConnectionState::Closed {
            return Err(TunnelError::ConnectionClosed);
        }
        if shared.requests.contains_key(&id) {
            return Err(TunnelError::RequestExists(id));
        }
        shared.requests.insert(id, pending);
        Ok(())
    }

    /// Stop tracking a request (timed out or abandoned)
    pub fn forget_request(&self, id: u32) -> bool {
        self.lock().requests.remove(&id).is_some()
    }

    /// Get number of outstanding requests
    pub fn pending_requests(&self) -> usize {
        self.lock().requests.len()
    }

    /// Deliver a response to the request it answers. Returns false when no
    /// request is waiting for it.
    pub fn complete_request(&self, response: ControlMessage) -> bool {
        let pending = self.lock().requests.remove(&response.id);

        match pending {
            Some(pending) => pending.deliver(response),
            None => {
                debug!(
                    "Dropping response {} from {}: no pending request",
                    response.id, self.peer
                );
                false
            }
        }
    }

    /// Tear the connection down. Calling this again has no effect.
    pub fn close(&self) {
        let (channels, requests) = {
            let mut shared = self.lock();
            if shared.state == ConnectionState::Closed {
                return;
            }
            shared.state = ConnectionState::Closed;
            shared.outbound = None;
            (
                std::mem::take(&mut shared.channels),
                std::mem::take(&mut shared.requests),
            )
        };

        info!(
            "Closing connection to {} ({} channels, {} pending requests)",
            self.peer,
            channels.len(),
            requests.len()
        );

        self.shutdown.send_replace(true);

        for channel in channels.into_values() {
            channel.close();
        }
        // Dropping the pending requests fails every waiter
        drop(requests);
    }

    fn touch(&self) {
        self.lock().last_heartbeat = Instant::now();
    }

    fn heartbeat_expired(&self) -> bool {
        let last = self.lock().last_heartbeat;
        last + self.config.heartbeat_timeout < Instant::now()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn read_loop<R>(self: Arc<Self>, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let frame = tokio::select! {
                frame = protocol::read_frame(&mut reader) => frame,
                _ = wait_closed(&mut shutdown) => break,
            };

            let envelope = match frame.and_then(Envelope::decode) {
                Ok(envelope) => envelope,
                Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("Connection to {} closed by peer", self.peer);
                    self.close();
                    break;
                }
                Err(e) => {
                    warn!("Read error on connection to {}: {}", self.peer, e);
                    self.close();
                    break;
                }
            };

            if let Err(e) = self.dispatch(envelope).await {
                debug!("Dispatch on {} stopped: {}", self.peer, e);
                if self.is_closed() {
                    break;
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, envelope: Envelope) -> Result<(), TunnelError> {
        match envelope.cmd {
            EnvelopeCmd::Rpc => {
                self.dispatch_control(envelope.data);
                Ok(())
            }
            EnvelopeCmd::Flow => {
                self.dispatch_flow(envelope.id, envelope.data);
                Ok(())
            }
            EnvelopeCmd::Ping => {
                trace!("Ping from {}", self.peer);
                self.touch();
                self.send_envelope(Envelope::pong()).await
            }
            EnvelopeCmd::Pong => {
                trace!("Pong from {}", self.peer);
                self.touch();
                Ok(())
            }
        }
    }

    fn dispatch_control(self: &Arc<Self>, data: Bytes) {
        let message = match ControlMessage::decode(data) {
            Ok(message) => message,
            Err(ProtocolError::UnknownCommand(cmd)) => {
                debug!("Ignoring control command {} from {}", cmd, self.peer);
                return;
            }
            Err(e) => {
                warn!("Invalid control message from {}: {}", self.peer, e);
                return;
            }
        };

        match message.kind {
            ControlKind::Request => match self.processors.get(message.cmd) {
                Some(processor) => {
                    let ctx = RequestContext::new(Arc::clone(self), message);
                    tokio::spawn(async move {
                        if let Err(e) = processor.process(ctx).await {
                            debug!("Request processing failed: {}", e);
                        }
                    });
                }
                None => {
                    debug!(
                        "No processor for {:?} request from {}",
                        message.cmd, self.peer
                    );
                }
            },
            ControlKind::Response => {
                self.complete_request(message);
            }
        }
    }

    fn dispatch_flow(&self, id: u32, data: Bytes) {
        let channel = self.channel(id);

        match channel {
            Some(channel) => {
                if !channel.push(data) {
                    trace!("Dropping data for closed channel {}", channel);
                }
            }
            None => {
                trace!("Dropping data for unknown channel {} on {}", id, self.peer);
            }
        }
    }

    async fn write_loop<W>(
        conn: Weak<Self>,
        mut writer: W,
        mut outbound: mpsc::Receiver<Bytes>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        W: AsyncWrite + Unpin,
    {
        loop {
            let frame = tokio::select! {
                biased;
                _ = wait_closed(&mut shutdown) => break,
                frame = outbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let result = tokio::select! {
                result = writer.write_all(&frame) => result,
                _ = wait_closed(&mut shutdown) => break,
            };

            if let Err(e) = result {
                debug!("Write error: {}", e);
                if let Some(conn) = conn.upgrade() {
                    conn.close();
                }
                break;
            }
        }

        let _ = writer.shutdown().await;
    }

    async fn heartbeat_loop(conn: Weak<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = match conn.upgrade() {
            Some(conn) => conn.config.heartbeat_interval,
            None => return,
        };

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = wait_closed(&mut shutdown) => break,
            }

            let Some(conn) = conn.upgrade() else { break };

            if conn.role == Role::Initiator {
                let _ = conn.send_envelope(Envelope::ping()).await;
            }

            if conn.heartbeat_expired() {
                warn!("Connection to {} timed out", conn.peer);
                conn.close();
                break;
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}
