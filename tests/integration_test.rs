//! Integration tests for muxtunnel
//!
//! Runs a server, a client and a SOCKS5 ingress over loopback TCP:
//! - Login and channel setup
//! - Data relayed through the tunnel in both directions
//! - Many concurrent channels over one connection
//! - SOCKS5 failure replies

use muxtunnel::proxy::Socks5Server;
use muxtunnel::{Client, ClientOptions, ClientState, Server, ServerOptions};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const SOCKS_SUCCESS: [u8; 10] = [5, 0, 0, 1, 0, 0, 0, 0, 0, 0];
const SOCKS_FAILURE: [u8; 10] = [5, 1, 0, 1, 0, 0, 0, 0, 0, 0];

/// Echo server standing in for a real destination
async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    let n = match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    addr
}

/// Server, logged-in client and SOCKS5 ingress; returns the ingress address
async fn start_tunnel() -> (SocketAddr, Arc<Client>) {
    let server = Server::bind("127.0.0.1:0", ServerOptions::default())
        .await
        .unwrap();
    let server_addr = server.local_addr().unwrap();
    tokio::spawn(async move { server.run().await });

    let client = Arc::new(Client::new(ClientOptions {
        server: server_addr.to_string(),
        ..ClientOptions::default()
    }));
    client.connect().await.unwrap();
    assert_eq!(client.state(), ClientState::Ready);

    let proxy = Socks5Server::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    let opener = Arc::clone(&client);
    tokio::spawn(async move { proxy.run(opener).await });

    (proxy_addr, client)
}

async fn socks_connect(proxy: SocketAddr, request: &[u8]) -> (TcpStream, [u8; 10]) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();

    stream.write_all(&[5, 1, 0]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [5, 0]);

    stream.write_all(request).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();

    (stream, reply)
}

fn ipv4_request(addr: SocketAddr) -> Vec<u8> {
    let ip = match addr {
        SocketAddr::V4(v4) => v4.ip().octets(),
        SocketAddr::V6(_) => panic!("expected an IPv4 address"),
    };
    let mut request = vec![5, 1, 0, 1];
    request.extend_from_slice(&ip);
    request.extend_from_slice(&addr.port().to_be_bytes());
    request
}

fn domain_request(host: &str, port: u16) -> Vec<u8> {
    let mut request = vec![5, 1, 0, 3, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    request
}

#[tokio::test]
async fn test_socks_echo_through_tunnel() {
    let echo = start_echo().await;
    let (proxy, client) = start_tunnel().await;

    let (mut stream, reply) = socks_connect(proxy, &ipv4_request(echo)).await;
    assert_eq!(reply, SOCKS_SUCCESS);

    stream.write_all(b"hello through the tunnel").await.unwrap();
    let mut buf = [0u8; 24];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello through the tunnel");

    assert_eq!(client.connection().unwrap().channel_count(), 1);
}

#[tokio::test]
async fn test_socks_domain_destination() {
    let echo = start_echo().await;
    let (proxy, _client) = start_tunnel().await;

    let (mut stream, reply) = socks_connect(proxy, &domain_request("localhost", echo.port())).await;
    assert_eq!(reply, SOCKS_SUCCESS);

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn test_large_transfer() {
    let echo = start_echo().await;
    let (proxy, _client) = start_tunnel().await;

    let (stream, reply) = socks_connect(proxy, &ipv4_request(echo)).await;
    assert_eq!(reply, SOCKS_SUCCESS);

    let data: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = data.clone();
    let (mut reader, mut writer) = stream.into_split();

    let send = tokio::spawn(async move {
        writer.write_all(&data).await.unwrap();
        writer
    });

    let mut received = vec![0u8; expected.len()];
    reader.read_exact(&mut received).await.unwrap();
    assert_eq!(received, expected);
    send.await.unwrap();
}

#[tokio::test]
async fn test_concurrent_channels_share_one_connection() {
    let echo = start_echo().await;
    let (proxy, client) = start_tunnel().await;

    let mut tasks = Vec::new();
    for i in 0..20u8 {
        tasks.push(tokio::spawn(async move {
            let (mut stream, reply) = socks_connect(proxy, &ipv4_request(echo)).await;
            assert_eq!(reply, SOCKS_SUCCESS);

            let message = vec![i; 1000 + i as usize];
            stream.write_all(&message).await.unwrap();
            let mut buf = vec![0u8; message.len()];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, message);
            stream
        }));
    }

    let mut streams = Vec::new();
    for task in tasks {
        streams.push(task.await.unwrap());
    }
    assert_eq!(client.connection().unwrap().channel_count(), 20);
}

#[tokio::test]
async fn test_closing_socket_releases_channel() {
    let echo = start_echo().await;
    let (proxy, client) = start_tunnel().await;

    let (mut stream, reply) = socks_connect(proxy, &ipv4_request(echo)).await;
    assert_eq!(reply, SOCKS_SUCCESS);
    stream.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await.unwrap();
    drop(stream);

    let conn = client.connection().unwrap();
    for _ in 0..100 {
        if conn.channel_count() == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(conn.channel_count(), 0);
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_unreachable_destination_general_failure() {
    let (proxy, client) = start_tunnel().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let (mut stream, reply) = socks_connect(proxy, &ipv4_request(dead)).await;
    assert_eq!(reply, SOCKS_FAILURE);

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    // The tunnel itself is unaffected
    assert!(client.is_ready());
}

#[tokio::test]
async fn test_ipv6_request_general_failure() {
    let (proxy, client) = start_tunnel().await;

    let mut request = vec![5, 1, 0, 4];
    request.extend_from_slice(&std::net::Ipv6Addr::LOCALHOST.octets());
    request.extend_from_slice(&80u16.to_be_bytes());

    let (mut stream, reply) = socks_connect(proxy, &request).await;
    assert_eq!(reply, SOCKS_FAILURE);

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    assert_eq!(client.connection().unwrap().channel_count(), 0);
}
