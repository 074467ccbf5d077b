//! Tunnel server: accepts tunnel connections and answers their requests

use crate::config::Config;
use crate::rpc::ProcessorRegistry;
use crate::transport::TransportConfig;
use crate::tunnel::{Connection, ConnectionConfig, Role};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Server settings
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Maximum concurrent tunnel connections
    pub max_connections: usize,
    pub connection: ConnectionConfig,
    /// Used when dialing channel destinations
    pub transport: TransportConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            connection: ConnectionConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl ServerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_connections: config.server.max_connections,
            connection: config.tunnel.connection_config(),
            transport: config.tunnel.transport_config(),
        }
    }
}

/// Accepting end of the tunnel
pub struct Server {
    listener: TcpListener,
    processors: Arc<ProcessorRegistry>,
    connection: ConnectionConfig,
    conn_semaphore: Arc<Semaphore>,
}

impl Server {
    pub async fn bind(addr: &str, options: ServerOptions) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Tunnel server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            processors: Arc::new(ProcessorRegistry::server(options.transport)),
            connection: options.connection,
            conn_semaphore: Arc::new(Semaphore::new(options.max_connections.max(1))),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails
    pub async fn run(&self) -> std::io::Result<()> {
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept error: {}", e);
                    return Err(e);
                }
            };
            debug!("New connection from {}", peer_addr);

            self.serve(stream, peer_addr);
        }
    }

    fn serve(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let permit = match Arc::clone(&self.conn_semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Connection limit reached, rejecting {}", peer_addr);
                return;
            }
        };

        // Disable Nagle's algorithm to avoid delays on small frames
        stream.set_nodelay(true).ok();

        let conn = Connection::spawn(
            stream,
            peer_addr.to_string(),
            Role::Responder,
            self.connection.clone(),
            Arc::clone(&self.processors),
        );

        tokio::spawn(async move {
            conn.closed().await;
            info!("Connection from {} closed", conn.peer());
            drop(permit);
        });
    }
}
