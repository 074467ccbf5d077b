//! Tunnel client
//!
//! Dials the server, logs in and opens channels on behalf of the SOCKS5
//! ingress. `run_reconnect` re-establishes the tunnel after it drops.

use crate::config::Config;
use crate::protocol::{
    BuildChannelRequest, BuildChannelResponse, CommonResponse, ControlCommand, ControlMessage,
    LoginRequest,
};
use crate::proxy::ChannelOpener;
use crate::rpc::{self, Callback, ProcessorRegistry, DEFAULT_RPC_TIMEOUT};
use crate::transport::{self, TransportConfig};
use crate::tunnel::{Channel, Connection, ConnectionConfig, Role, TunnelError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Client lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Never connected
    Init,
    /// Tunnel established, login pending
    Connected,
    /// Dial failed
    UnConnected,
    /// Logged in; channels can be opened
    Ready,
    /// Login failed or was not answered
    UnReady,
}

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server address (`host:port`)
    pub server: String,
    pub username: String,
    pub password: String,
    pub rpc_timeout: Duration,
    pub connection: ConnectionConfig,
    pub transport: TransportConfig,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:9090".to_string(),
            username: "Allen".to_string(),
            password: "Allen".to_string(),
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            connection: ConnectionConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            server: config.client.server.clone(),
            username: config.client.username.clone(),
            password: config.client.password.clone(),
            rpc_timeout: config.tunnel.rpc_timeout(),
            connection: config.tunnel.connection_config(),
            transport: config.tunnel.transport_config(),
        }
    }
}

struct Inner {
    state: ClientState,
    conn: Option<Arc<Connection>>,
}

/// Dialing end of the tunnel
pub struct Client {
    options: ClientOptions,
    processors: Arc<ProcessorRegistry>,
    inner: Mutex<Inner>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            processors: Arc::new(ProcessorRegistry::new()),
            inner: Mutex::new(Inner {
                state: ClientState::Init,
                conn: None,
            }),
        }
    }

    pub fn state(&self) -> ClientState {
        self.lock().state
    }

    /// Current tunnel connection, if any
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.lock().conn.clone()
    }

    /// Logged in and the tunnel is still up
    pub fn is_ready(&self) -> bool {
        self.ready_connection().is_some()
    }

    /// Dial the server and log in. Replaces (and closes) any previous tunnel.
    pub async fn connect(&self) -> crate::Result<()> {
        let stream = match transport::dial(&self.options.server, &self.options.transport).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Connect to server {} failed: {}", self.options.server, e);
                self.set_state(ClientState::UnConnected);
                return Err(e.into());
            }
        };
        info!("Connected to server {}", self.options.server);

        let conn = Connection::spawn(
            stream,
            self.options.server.clone(),
            Role::Initiator,
            self.options.connection.clone(),
            Arc::clone(&self.processors),
        );

        let previous = {
            let mut inner = self.lock();
            inner.state = ClientState::Connected;
            inner.conn.replace(Arc::clone(&conn))
        };
        if let Some(previous) = previous {
            previous.close();
        }

        match self.login(&conn).await {
            Ok(()) => {
                info!("Logged in to {}", self.options.server);
                self.set_state(ClientState::Ready);
                Ok(())
            }
            Err(e) => {
                warn!("Login to {} failed: {}", self.options.server, e);
                self.set_state(ClientState::UnReady);
                Err(e.into())
            }
        }
    }

    async fn login(&self, conn: &Arc<Connection>) -> Result<(), TunnelError> {
        let body = LoginRequest {
            name: self.options.username.clone(),
            pwd: self.options.password.clone(),
        };
        let request = conn.new_request(ControlCommand::Login, body.encode()?);

        let response = rpc::invoke(conn, request, self.options.rpc_timeout, None)
            .await?
            .get()
            .await?;

        let body = CommonResponse::decode(response.payload)?;
        if !body.is_success() {
            return Err(TunnelError::RequestFailed {
                code: body.code,
                message: body.msg,
            });
        }
        Ok(())
    }

    /// Ask the server to dial `addr` and return the channel connected to it
    pub async fn build_channel(
        &self,
        addr: &str,
        trace_id: &str,
    ) -> Result<Arc<Channel>, TunnelError> {
        let conn = self.ready_connection().ok_or(TunnelError::NotReady)?;

        let body = BuildChannelRequest {
            addr: addr.to_string(),
            trace_id: trace_id.to_string(),
        };
        let request = conn.new_request(ControlCommand::BuildChannel, body.encode()?);
        debug!("{}: build channel to {} (request {})", trace_id, addr, request.id);

        // Registered from the read task, before any flow for the channel
        // can be dispatched
        let slot: Arc<Mutex<Option<Result<Arc<Channel>, TunnelError>>>> =
            Arc::new(Mutex::new(None));
        let callback: Callback = {
            let conn = Arc::clone(&conn);
            let slot = Arc::clone(&slot);
            Box::new(move |response: &ControlMessage| {
                let registered = match BuildChannelResponse::decode(response.payload.clone()) {
                    Ok(body) if body.is_success() => conn.register_channel(body.channel_id),
                    _ => return,
                };
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(registered);
            })
        };

        let response = rpc::invoke(&conn, request, self.options.rpc_timeout, Some(callback))
            .await?
            .get()
            .await?;

        let body = BuildChannelResponse::decode(response.payload)?;
        if !body.is_success() {
            warn!("{}: build channel to {} failed: {}", trace_id, addr, body.msg);
            return Err(TunnelError::RequestFailed {
                code: body.code,
                message: body.msg,
            });
        }

        let registered = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        let channel = match registered {
            Some(result) => result?,
            None => conn.register_channel(body.channel_id)?,
        };

        info!("{}: channel {} open to {}", trace_id, channel, addr);
        Ok(channel)
    }

    /// Reconnect every `interval` while the tunnel is down. Never returns.
    pub async fn run_reconnect(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.is_ready() {
                continue;
            }

            info!("Tunnel to {} is down, reconnecting...", self.options.server);
            if let Err(e) = self.connect().await {
                debug!("Reconnect failed: {}", e);
            }
        }
    }

    fn ready_connection(&self) -> Option<Arc<Connection>> {
        let inner = self.lock();
        match (&inner.conn, inner.state) {
            (Some(conn), ClientState::Ready) if !conn.is_closed() => Some(Arc::clone(conn)),
            _ => None,
        }
    }

    fn set_state(&self, state: ClientState) {
        self.lock().state = state;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ChannelOpener for Client {
    async fn open_channel(
        &self,
        destination: &str,
        trace_id: &str,
    ) -> Result<Arc<Channel>, TunnelError> {
        self.build_channel(destination, trace_id).await
    }
}
