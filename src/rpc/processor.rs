//! Handlers for requests arriving from the peer

use crate::protocol::{
    BuildChannelRequest, BuildChannelResponse, CommonResponse, ControlCommand, ControlMessage,
    Envelope, LoginRequest, STATUS_FAILURE, STATUS_SUCCESS,
};
use crate::transport::{self, TransportConfig};
use crate::tunnel::{flow_forward, Connection, TunnelError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Handles one kind of control request
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, ctx: RequestContext) -> Result<(), TunnelError>;
}

/// A received request together with the connection it arrived on
pub struct RequestContext {
    conn: Arc<Connection>,
    message: ControlMessage,
}

impl RequestContext {
    pub fn new(conn: Arc<Connection>, message: ControlMessage) -> Self {
        Self { conn, message }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn message(&self) -> &ControlMessage {
        &self.message
    }

    /// Send a response carrying the request's id and command
    pub async fn respond(&self, payload: Bytes) -> Result<(), TunnelError> {
        let response = self.message.response(payload);
        self.conn
            .send_envelope(Envelope::rpc(response.encode()))
            .await
    }
}

/// Maps control commands to their processors
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<ControlCommand, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    /// Registry that answers no requests
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of the tunnel server: login and channel setup
    pub fn server(transport: TransportConfig) -> Self {
        Self::new()
            .with(ControlCommand::Login, LoginProcessor)
            .with(ControlCommand::BuildChannel, BuildChannelProcessor::new(transport))
    }

    pub fn with<P: Processor + 'static>(mut self, cmd: ControlCommand, processor: P) -> Self {
        self.processors.insert(cmd, Arc::new(processor));
        self
    }

    pub fn get(&self, cmd: ControlCommand) -> Option<Arc<dyn Processor>> {
        self.processors.get(&cmd).cloned()
    }
}

/// Accepts every login
pub struct LoginProcessor;

#[async_trait]
impl Processor for LoginProcessor {
    async fn process(&self, ctx: RequestContext) -> Result<(), TunnelError> {
        let response = match LoginRequest::decode(ctx.message().payload.clone()) {
            Ok(request) => {
                info!("Login from {} as {}", ctx.connection().peer(), request.name);
                CommonResponse {
                    code: STATUS_SUCCESS,
                    msg: "success".to_string(),
                }
            }
            Err(e) => {
                warn!("Invalid login request from {}: {}", ctx.connection().peer(), e);
                CommonResponse {
                    code: STATUS_FAILURE,
                    msg: e.to_string(),
                }
            }
        };

        ctx.respond(response.encode()?).await
    }
}

/// Opens a channel and connects it to the requested destination
pub struct BuildChannelProcessor {
    transport: TransportConfig,
}

impl BuildChannelProcessor {
    pub fn new(transport: TransportConfig) -> Self {
        Self { transport }
    }

    async fn build(&self, ctx: &RequestContext, request: BuildChannelRequest) -> Result<(), TunnelError> {
        let channel = ctx.connection().apply_channel()?;
        info!("Build channel {} to {}", channel, request.addr);

        let stream = match transport::dial(&request.addr, &self.transport).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Connect to {} failed: {}", request.addr, e);
                channel.close();
                let response = BuildChannelResponse {
                    channel_id: channel.id(),
                    code: STATUS_FAILURE,
                    msg: e.to_string(),
                };
                return ctx.respond(response.encode()?).await;
            }
        };

        let response = BuildChannelResponse {
            channel_id: channel.id(),
            code: STATUS_SUCCESS,
            msg: "success".to_string(),
        };
        let sent = match response.encode() {
            Ok(payload) => ctx.respond(payload).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            channel.close();
            return Err(e);
        }

        debug!("Channel {} connected to {}", channel, request.addr);
        flow_forward(channel, stream, request.addr);
        Ok(())
    }
}

#[async_trait]
impl Processor for BuildChannelProcessor {
    async fn process(&self, ctx: RequestContext) -> Result<(), TunnelError> {
        let request = match BuildChannelRequest::decode(ctx.message().payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!("Invalid build channel request from {}: {}", ctx.connection().peer(), e);
                let response = BuildChannelResponse {
                    channel_id: 0,
                    code: STATUS_FAILURE,
                    msg: e.to_string(),
                };
                return ctx.respond(response.encode()?).await;
            }
        };

        let span = info_span!("build_channel", trace_id = %request.trace_id);
        self.build(&ctx, request).instrument(span).await
    }
}
