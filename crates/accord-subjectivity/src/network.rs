//! Outbound peer interactions the periodic tasks rely on.

use std::net::SocketAddr;

use accord_catchup::{NodeId, PeerEdge};
use accord_identity::Id;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How this node presents itself to others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node: NodeId,
    #[serde(with = "hex::serde")]
    pub public_key: [u8; 32],
    pub node_number: u64,
    pub administrator: Id,
    /// Address peers should dial.
    pub addr: SocketAddr,
}

/// A peer as advertised by someone else; unverified until acquainted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAdvert {
    pub node: NodeId,
    pub addr: SocketAddr,
    #[serde(with = "hex::serde")]
    pub public_key: [u8; 32],
    pub administrator: Id,
}

impl From<&NodeIdentity> for PeerAdvert {
    fn from(identity: &NodeIdentity) -> Self {
        Self {
            node: identity.node,
            addr: identity.addr,
            public_key: identity.public_key,
            administrator: identity.administrator,
        }
    }
}

/// Result of a successful key exchange with a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquaintance {
    pub public_key: [u8; 32],
    pub administrator: Id,
    pub latency_ms: u32,
    /// Our address as the peer saw it.
    pub observed_addr: Option<SocketAddr>,
}

#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Tell a neighbor who we are.
    async fn notify(&self, me: &NodeIdentity, peer: PeerEdge) -> Result<()>;

    /// Ask a neighbor for the peers it knows.
    async fn discover(&self, peer: PeerEdge) -> Result<Vec<PeerAdvert>>;

    /// Signed handshake; fails if the peer cannot prove its key.
    async fn acquaint(&self, me: &NodeIdentity, peer: PeerEdge) -> Result<Acquaintance>;

    /// Publish our externally visible address.
    async fn announce_address(&self, me: &NodeIdentity) -> Result<()>;
}
