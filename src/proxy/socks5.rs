//! SOCKS5 proxy implementation (RFC 1928, CONNECT only)

use super::{Address, ChannelOpener, ProxyError};
use crate::tunnel::{flow_forward, IdGenerator};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, info_span, warn, Instrument};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// No authentication required
const NO_AUTH: u8 = 0x00;

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(ProxyError::UnsupportedAddressType(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
}

/// SOCKS5 proxy server
pub struct Socks5Server {
    listener: TcpListener,
    trace_ids: IdGenerator,
}

impl Socks5Server {
    /// Create a new SOCKS5 server
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            trace_ids: IdGenerator::new(0),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections and hand each to the tunnel through `opener`
    pub async fn run<O>(&self, opener: Arc<O>) -> Result<(), ProxyError>
    where
        O: ChannelOpener + 'static,
    {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            stream.set_nodelay(true).ok();

            let trace_id = format!("id:{}", self.trace_ids.next());
            debug!("New SOCKS5 connection from {} ({})", peer_addr, trace_id);

            let span = info_span!("socks5", trace_id = %trace_id);
            let opener = Arc::clone(&opener);

            tokio::spawn(
                async move {
                    if let Err(e) =
                        handle_connection(stream, peer_addr.to_string(), trace_id, opener).await
                    {
                        warn!("SOCKS5 connection error: {}", e);
                    }
                }
                .instrument(span),
            );
        }
    }
}

/// Negotiate one SOCKS5 session on `stream` and splice it into a channel
pub async fn handle_connection<S, O>(
    mut stream: S,
    peer: String,
    trace_id: String,
    opener: Arc<O>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    O: ChannelOpener + ?Sized,
{
    // Read greeting
    let mut buf = [0u8; 258];
    stream.read_exact(&mut buf[..2]).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;

    stream.write_all(&[SOCKS_VERSION, NO_AUTH]).await?;

    let address = match read_request(&mut stream, &mut buf).await {
        Ok(address) => address,
        Err(e) => {
            stream.write_all(&make_reply(Reply::GeneralFailure)).await.ok();
            return Err(e);
        }
    };

    debug!("SOCKS5 CONNECT from {} to {}", peer, address);

    let destination = address.to_string();
    let channel = match opener.open_channel(&destination, &trace_id).await {
        Ok(channel) => channel,
        Err(e) => {
            stream.write_all(&make_reply(Reply::GeneralFailure)).await.ok();
            return Err(e.into());
        }
    };

    if let Err(e) = stream.write_all(&make_reply(Reply::Succeeded)).await {
        channel.close();
        return Err(e.into());
    }

    info!("{} -> {} via channel {}", peer, destination, channel);
    flow_forward(channel, stream, peer);
    Ok(())
}

async fn read_request<S>(stream: &mut S, buf: &mut [u8; 258]) -> Result<Address, ProxyError>
where
    S: AsyncRead + Unpin,
{
    stream.read_exact(&mut buf[..4]).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    Command::try_from(buf[1])?;
    // buf[2] is reserved
    let addr_type = AddressType::try_from(buf[3])?;

    let address = match addr_type {
        AddressType::Ipv4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Address::Ipv4(ip, stream.read_u16().await?)
        }
        AddressType::Domain => {
            stream.read_exact(&mut buf[..1]).await?;
            let len = buf[0] as usize;
            stream.read_exact(&mut buf[..len]).await?;
            let domain = String::from_utf8_lossy(&buf[..len]).to_string();
            Address::Domain(domain, stream.read_u16().await?)
        }
        AddressType::Ipv6 => {
            // Not routable through the tunnel; consume the request before rejecting it
            stream.read_exact(&mut buf[..18]).await?;
            return Err(ProxyError::UnsupportedAddressType(addr_type as u8));
        }
    };

    Ok(address)
}

/// Reply with the bound address left as `0.0.0.0:0`
fn make_reply(reply: Reply) -> [u8; 10] {
    [SOCKS_VERSION, reply as u8, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
}
