//! Typed request/response plumbing between a catch-up machine and the wire.
//!
//! A [`Transport`] accepts an [`Envelope`] and immediately returns a
//! [`ResponseHandle`]. The transport resolves the handle later, from whatever
//! task owns the connection, through the paired [`ResponseSender`].

use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tokio::sync::oneshot;

/// Peer identity: BLAKE3 of the peer's Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Some(Self(bytes.try_into().ok()?))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..12])
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid node id"))
        } else {
            <[u8; 32]>::deserialize(deserializer).map(Self)
        }
    }
}

/// Where to send a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerEdge {
    pub node: NodeId,
    pub addr: SocketAddr,
}

/// A request type and the response type it expects.
pub trait Request: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Response: Serialize + DeserializeOwned + Send + 'static;

    /// Wire name of the request kind.
    const KIND: &'static str;
}

/// A request as it travels to a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<Q> {
    pub correlation_id: u64,
    pub kind: String,
    pub payload: Q,
}

impl<Q: Request> Envelope<Q> {
    pub fn new(correlation_id: u64, payload: Q) -> Self {
        Self {
            correlation_id,
            kind: Q::KIND.to_string(),
            payload,
        }
    }
}

/// Why a request produced no usable response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestFailure {
    /// The peer answered with an explicit error.
    #[error("peer returned error: {0}")]
    ErrorResponse(String),

    #[error("request timed out")]
    Timeout,

    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// The transport released the request without resolving it.
    #[error("request dropped by transport")]
    Dropped,
}

/// Result of one request.
pub type RequestOutcome<R> = std::result::Result<R, RequestFailure>;

/// Receiving half of a request. Polled without blocking.
#[derive(Debug)]
pub struct ResponseHandle<R> {
    rx: oneshot::Receiver<RequestOutcome<R>>,
}

/// Sending half of a request, held by the transport.
#[derive(Debug)]
pub struct ResponseSender<R> {
    tx: oneshot::Sender<RequestOutcome<R>>,
}

/// Create a connected sender/handle pair.
pub fn response_channel<R>() -> (ResponseSender<R>, ResponseHandle<R>) {
    let (tx, rx) = oneshot::channel();
    (ResponseSender { tx }, ResponseHandle { rx })
}

impl<R> ResponseSender<R> {
    /// Resolve the request. Returns false if nobody is waiting any more.
    pub fn send(self, outcome: RequestOutcome<R>) -> bool {
        self.tx.send(outcome).is_ok()
    }

    /// Whether the waiting side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<R> ResponseHandle<R> {
    /// A handle that is already resolved.
    pub fn resolved(outcome: RequestOutcome<R>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { rx }
    }

    /// Non-blocking poll. A sender dropped without sending resolves to
    /// [`RequestFailure::Dropped`].
    pub fn try_poll(&mut self) -> Option<RequestOutcome<R>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(RequestFailure::Dropped)),
        }
    }
}

/// Sends typed requests to peers.
pub trait Transport<Q: Request>: Send + Sync {
    /// Start a request. Must not block; the handle resolves later.
    fn request_async(&self, envelope: Envelope<Q>, peer: &PeerEdge) -> ResponseHandle<Q::Response>;
}
