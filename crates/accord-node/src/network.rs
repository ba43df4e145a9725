//! `PeerNetwork` over the TCP wire protocol.

use std::sync::Arc;
use std::time::Instant;

use accord_catchup::PeerEdge;
use accord_subjectivity::{
    now_millis, Acquaintance, NodeIdentity, PeerAdvert, PeerNetwork, Result as ViewResult,
};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use tokio::net::ToSocketAddrs;
use tracing::debug;

use crate::error::{Error, Result};
use crate::transport::TcpTransport;
use crate::wire::{Hello, HelloAck, GET_NEIGHBORS, HELLO, NOTIFY};

pub struct TcpPeerNetwork {
    transport: TcpTransport,
    signing_key: Arc<SigningKey>,
    /// Where address announcements go.
    announce_to: Vec<String>,
}

impl TcpPeerNetwork {
    pub fn new(transport: TcpTransport, signing_key: Arc<SigningKey>, announce_to: Vec<String>) -> Self {
        Self {
            transport,
            signing_key,
            announce_to,
        }
    }

    /// Exchange signed hellos with whoever listens at `addr`.
    pub async fn introduce<A: ToSocketAddrs>(
        &self,
        me: &NodeIdentity,
        addr: A,
    ) -> Result<(PeerAdvert, Acquaintance)> {
        let hello = Hello::sign(me.clone(), &self.signing_key)?;
        let started = Instant::now();
        let ack: HelloAck = self
            .transport
            .request(addr, HELLO, &hello)
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        let latency_ms = started.elapsed().as_millis().min(u128::from(u32::MAX)) as u32;

        ack.hello.verify(now_millis())?;
        let peer = &ack.hello.identity;
        let acquaintance = Acquaintance {
            public_key: peer.public_key,
            administrator: peer.administrator,
            latency_ms,
            observed_addr: Some(ack.observed_addr),
        };
        Ok((PeerAdvert::from(peer), acquaintance))
    }
}

#[async_trait]
impl PeerNetwork for TcpPeerNetwork {
    async fn notify(&self, me: &NodeIdentity, peer: PeerEdge) -> ViewResult<()> {
        let _: serde_json::Value = self
            .transport
            .request(peer.addr, NOTIFY, me)
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(())
    }

    async fn discover(&self, peer: PeerEdge) -> ViewResult<Vec<PeerAdvert>> {
        let adverts = self
            .transport
            .request(peer.addr, GET_NEIGHBORS, &serde_json::json!({}))
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(adverts)
    }

    async fn acquaint(&self, me: &NodeIdentity, peer: PeerEdge) -> ViewResult<Acquaintance> {
        let (advert, acquaintance) = self.introduce(me, peer.addr).await?;
        if advert.node != peer.node {
            return Err(Error::Protocol(format!(
                "expected node {} at {}, found {}",
                peer.node, peer.addr, advert.node
            ))
            .into());
        }
        Ok(acquaintance)
    }

    async fn announce_address(&self, me: &NodeIdentity) -> ViewResult<()> {
        if self.announce_to.is_empty() {
            debug!("No address resolution peers configured");
            return Ok(());
        }
        let mut last_error = None;
        for target in &self.announce_to {
            let sent: std::result::Result<serde_json::Value, _> =
                self.transport.request(target.as_str(), NOTIFY, me).await;
            match sent {
                Ok(_) => return Ok(()),
                Err(e) => last_error = Some(e),
            }
        }
        Err(Error::Network(format!(
            "address announcement failed: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ))
        .into())
    }
}
