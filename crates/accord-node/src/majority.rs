//! Majority oracle: samples neighbors' state hashes and tallies them.

use std::collections::BTreeMap;
use std::sync::Arc;

use accord_catchup::{tally, MajorityAtStart, NodeId, Request};
use accord_identity::{ContentHash, Id};
use accord_objectivity::{GetStateHashes, StateHashes};
use accord_subjectivity::Subjectivity;
use futures::future::join_all;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::transport::TcpTransport;

/// What a sample agreed on, per family.
#[derive(Debug, Clone, Default)]
pub struct Majorities {
    pub core: Option<MajorityAtStart<ContentHash>>,
    pub users: Option<MajorityAtStart<BTreeMap<Id, ContentHash>>>,
    /// Peers that answered.
    pub respondents: usize,
}

/// Tally per-family majorities from peer reports.
///
/// A peer without a core has not caught up yet and does not vote at all.
pub fn majorities_from(reports: &[(NodeId, StateHashes)]) -> Majorities {
    let mut cores: Vec<(NodeId, ContentHash)> = Vec::new();
    let mut users: Vec<(NodeId, BTreeMap<Id, ContentHash>)> = Vec::new();
    for (node, hashes) in reports {
        if let Some(core) = hashes.core {
            cores.push((*node, core));
            users.push((*node, hashes.users.clone()));
        }
    }
    Majorities {
        core: tally(&cores),
        users: tally(&users),
        respondents: reports.len(),
    }
}

pub struct MajorityOracle {
    transport: TcpTransport,
    view: Arc<Subjectivity>,
    sample_size: usize,
}

impl MajorityOracle {
    pub fn new(transport: TcpTransport, view: Arc<Subjectivity>, sample_size: usize) -> Self {
        Self {
            transport,
            view,
            sample_size,
        }
    }

    /// Ask a random sample of confirmed neighbors for their state hashes.
    pub async fn sample(&self) -> Majorities {
        let peers = {
            let neighbors = self.view.confirmed();
            let mut rng = rand::thread_rng();
            neighbors
                .choose_multiple(&mut rng, self.sample_size)
                .map(|e| e.peer_edge())
                .collect::<Vec<_>>()
        };
        if peers.is_empty() {
            return Majorities::default();
        }

        let requests = peers.iter().map(|peer| async move {
            let outcome: std::result::Result<StateHashes, _> = self
                .transport
                .request(peer.addr, GetStateHashes::KIND, &GetStateHashes {})
                .await;
            (peer.node, outcome)
        });

        let mut reports = Vec::new();
        for (node, outcome) in join_all(requests).await {
            match outcome {
                Ok(hashes) => {
                    self.view.touch(&node);
                    reports.push((node, hashes));
                }
                Err(e) => debug!(peer = %node, error = %e, "State hash request failed"),
            }
        }

        let majorities = majorities_from(&reports);
        debug!(
            sampled = peers.len(),
            answered = reports.len(),
            core = majorities.core.is_some(),
            users = majorities.users.is_some(),
            "Majority sampled"
        );
        majorities
    }
}
