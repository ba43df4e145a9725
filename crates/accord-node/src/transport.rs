//! TCP client side of the wire protocol.
//!
//! One connection per request: connect, write a request frame, read one
//! response line. The whole exchange is bounded by the request timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use accord_catchup::{
    response_channel, Envelope, PeerEdge, Request, RequestFailure, RequestOutcome,
    ResponseHandle, Transport,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::wire::{read_frame_line, Frame};

#[derive(Clone)]
pub struct TcpTransport {
    timeout: Duration,
    next_id: Arc<AtomicU64>,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send one raw request and wait for its response body.
    pub async fn call<A: ToSocketAddrs>(
        &self,
        addr: A,
        id: u64,
        kind: &str,
        body: serde_json::Value,
    ) -> RequestOutcome<serde_json::Value> {
        match tokio::time::timeout(self.timeout, exchange(addr, id, kind, body)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RequestFailure::Timeout),
        }
    }

    /// Typed request, awaited in place.
    pub async fn request<A, B, R>(&self, addr: A, kind: &str, body: &B) -> RequestOutcome<R>
    where
        A: ToSocketAddrs,
        B: Serialize,
        R: DeserializeOwned,
    {
        let body = serde_json::to_value(body)
            .map_err(|e| RequestFailure::ErrorResponse(format!("encode: {e}")))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let value = self.call(addr, id, kind, body).await?;
        serde_json::from_value(value)
            .map_err(|e| RequestFailure::ErrorResponse(format!("decode: {e}")))
    }
}

async fn exchange<A: ToSocketAddrs>(
    addr: A,
    id: u64,
    kind: &str,
    body: serde_json::Value,
) -> RequestOutcome<serde_json::Value> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| RequestFailure::Unreachable(e.to_string()))?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let frame = Frame::Request {
        id,
        kind: kind.to_string(),
        body,
    };
    let line = frame
        .to_line()
        .map_err(|e| RequestFailure::ErrorResponse(e.to_string()))?;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| RequestFailure::Unreachable(e.to_string()))?;

    let mut line = String::new();
    let open = read_frame_line(&mut reader, &mut line)
        .await
        .map_err(|e| RequestFailure::Unreachable(e.to_string()))?;
    if !open {
        return Err(RequestFailure::Unreachable("connection closed".into()));
    }

    match serde_json::from_str::<Frame>(&line) {
        Ok(Frame::Response { id: got, body }) if got == id => Ok(body),
        Ok(Frame::Error { message, .. }) => Err(RequestFailure::ErrorResponse(message)),
        Ok(other) => Err(RequestFailure::ErrorResponse(format!(
            "unexpected frame for request {}: id {}",
            id,
            other.id()
        ))),
        Err(e) => Err(RequestFailure::ErrorResponse(format!("malformed frame: {e}"))),
    }
}

impl<Q: Request> Transport<Q> for TcpTransport {
    fn request_async(&self, envelope: Envelope<Q>, peer: &PeerEdge) -> ResponseHandle<Q::Response> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return ResponseHandle::resolved(Err(RequestFailure::Unreachable(
                "no async runtime".into(),
            )));
        };
        let body = match serde_json::to_value(&envelope.payload) {
            Ok(body) => body,
            Err(e) => return ResponseHandle::resolved(Err(RequestFailure::ErrorResponse(e.to_string()))),
        };

        let (tx, handle) = response_channel();
        let transport = self.clone();
        let addr = peer.addr;
        let node = peer.node;
        runtime.spawn(async move {
            let outcome = transport
                .call(addr, envelope.correlation_id, &envelope.kind, body)
                .await
                .and_then(|value| {
                    serde_json::from_value::<Q::Response>(value)
                        .map_err(|e| RequestFailure::ErrorResponse(format!("decode: {e}")))
                });
            if let Err(failure) = &outcome {
                debug!(peer = %node, kind = %envelope.kind, error = %failure, "Request failed");
            }
            if !tx.send(outcome) {
                debug!(peer = %node, "Response arrived after the request was dropped");
            }
        });
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    async fn one_shot_server(reply: impl Fn(Frame) -> Option<String> + Send + 'static) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let frame: Frame = serde_json::from_str(&line).unwrap();
            if let Some(reply) = reply(frame) {
                writer.write_all(reply.as_bytes()).await.unwrap();
            } else {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_call_returns_body() {
        let addr = one_shot_server(|frame| {
            let Frame::Request { id, kind, .. } = frame else {
                return None;
            };
            assert_eq!(kind, "echo");
            Frame::Response {
                id,
                body: serde_json::json!({"ok": true}),
            }
            .to_line()
            .ok()
        })
        .await;

        let transport = TcpTransport::new(Duration::from_secs(2));
        let body = transport
            .call(addr, 9, "echo", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_error_frame_is_error_response() {
        let addr = one_shot_server(|frame| {
            Frame::Error {
                id: frame.id(),
                message: "unknown kind".into(),
            }
            .to_line()
            .ok()
        })
        .await;

        let transport = TcpTransport::new(Duration::from_secs(2));
        let outcome = transport.call(addr, 1, "nope", serde_json::Value::Null).await;
        assert_eq!(
            outcome,
            Err(RequestFailure::ErrorResponse("unknown kind".into()))
        );
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let addr = one_shot_server(|_| None).await;
        let transport = TcpTransport::new(Duration::from_millis(200));
        let outcome = transport.call(addr, 1, "slow", serde_json::Value::Null).await;
        assert_eq!(outcome, Err(RequestFailure::Timeout));
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = TcpTransport::new(Duration::from_secs(2));
        let outcome = transport.call(addr, 1, "x", serde_json::Value::Null).await;
        assert!(matches!(outcome, Err(RequestFailure::Unreachable(_))));
    }
}
