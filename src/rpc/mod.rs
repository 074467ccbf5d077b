//! Request/response correlation for control operations
//!
//! Provides:
//! - `invoke`: send a request and get a `Promise` for its response
//! - `Promise`: deliver-or-timeout handle for one outstanding request
//! - Processors answering requests sent by the peer

mod processor;
mod promise;

pub use processor::{
    BuildChannelProcessor, LoginProcessor, Processor, ProcessorRegistry, RequestContext,
};
pub use promise::{Callback, PendingRequest, Promise};

use crate::protocol::{ControlKind, ControlMessage, Envelope};
use crate::tunnel::{Connection, TunnelError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// Default deadline for control requests
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Send `request` and return immediately with a promise for its response.
///
/// `callback` runs exactly once, when the response is delivered; it never
/// runs if the deadline passes first.
pub async fn invoke(
    conn: &Arc<Connection>,
    request: ControlMessage,
    timeout: Duration,
    callback: Option<Callback>,
) -> Result<Promise, TunnelError> {
    debug_assert_eq!(request.kind, ControlKind::Request);

    let id = request.id;
    let deadline = Instant::now() + timeout;
    let (tx, rx) = oneshot::channel();

    conn.register_request(id, PendingRequest::new(tx, callback))?;

    debug!("Sending {:?} request {} to {}", request.cmd, id, conn.peer());

    if let Err(e) = conn.send_envelope(Envelope::rpc(request.encode())).await {
        conn.forget_request(id);
        return Err(e);
    }

    Ok(Promise::new(id, rx, deadline, Arc::downgrade(conn)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommonResponse, ControlCommand, LoginRequest};
    use crate::tunnel::{ConnectionConfig, Role};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pair(responder_registry: ProcessorRegistry) -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Connection::spawn(
                a,
                "server",
                Role::Initiator,
                ConnectionConfig::default(),
                Arc::new(ProcessorRegistry::new()),
            ),
            Connection::spawn(
                b,
                "client",
                Role::Responder,
                ConnectionConfig::default(),
                Arc::new(responder_registry),
            ),
        )
    }

    fn login_request(conn: &Connection) -> ControlMessage {
        let body = LoginRequest {
            name: "Allen".to_string(),
            pwd: "Allen".to_string(),
        };
        conn.new_request(ControlCommand::Login, body.encode().unwrap())
    }

    #[tokio::test]
    async fn test_login_round_trip() {
        let registry = ProcessorRegistry::new().with(ControlCommand::Login, LoginProcessor);
        let (client, _server) = pair(registry);

        let request = login_request(&client);
        let id = request.id;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let callback: Callback = Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let promise = invoke(&client, request, DEFAULT_RPC_TIMEOUT, Some(callback))
            .await
            .unwrap();
        let response = promise.get().await.unwrap();

        assert_eq!(response.kind, ControlKind::Response);
        assert_eq!(response.id, id);
        let body = CommonResponse::decode(response.payload).unwrap();
        assert!(body.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let (client, _server) = pair(ProcessorRegistry::new());

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let callback: Callback = Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let request = login_request(&client);
        let promise = invoke(&client, request.clone(), Duration::from_secs(5), Some(callback))
            .await
            .unwrap();
        assert_eq!(client.pending_requests(), 1);

        assert!(matches!(promise.get().await, Err(TunnelError::Timeout)));
        assert_eq!(client.pending_requests(), 0);

        // A response arriving after the deadline is ignored
        assert!(!client.complete_request(request.response(Bytes::new())));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_second_delivery_ignored() {
        let (client, _server) = pair(ProcessorRegistry::new());

        let request = login_request(&client);
        let promise = invoke(&client, request.clone(), DEFAULT_RPC_TIMEOUT, None)
            .await
            .unwrap();

        assert!(client.complete_request(request.response(Bytes::from_static(b"first"))));
        assert!(!client.complete_request(request.response(Bytes::from_static(b"second"))));

        let response = promise.get().await.unwrap();
        assert_eq!(&response.payload[..], b"first");
    }

    #[tokio::test]
    async fn test_teardown_fails_waiters() {
        let (client, _server) = pair(ProcessorRegistry::new());

        let promise = invoke(&client, login_request(&client), DEFAULT_RPC_TIMEOUT, None)
            .await
            .unwrap();
        client.close();

        assert!(matches!(
            promise.get().await,
            Err(TunnelError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_invoke_on_closed_connection() {
        let (client, _server) = pair(ProcessorRegistry::new());
        client.close();

        let result = invoke(&client, login_request(&client), DEFAULT_RPC_TIMEOUT, None).await;
        assert!(matches!(result, Err(TunnelError::ConnectionClosed)));
        assert_eq!(client.pending_requests(), 0);
    }
}
