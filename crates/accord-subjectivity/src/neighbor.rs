//! Neighbor edges and the capacity-bounded lists holding them.
//!
//! A [`NeighborList`] is a concurrent map keyed by [`NodeId`]. Reads never
//! block; inserts take a coarse write lock so the capacity decision and the
//! eviction it implies happen atomically.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use accord_catchup::{NodeId, PeerEdge};
use accord_identity::Id;
use dashmap::DashMap;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Floor applied to a power before weighting, so no neighbor is unreachable.
pub const MIN_POWER: f64 = 0.01;

/// Current time in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A known peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub node: NodeId,
    pub addr: SocketAddr,
    #[serde(with = "hex::serde")]
    pub public_key: [u8; 32],
    /// User administering the peer's node; looked up in the power map.
    pub administrator: Id,
    /// Unix millis.
    pub created_at: u64,
    pub last_seen: u64,
    pub last_key_exchange: Option<u64>,
    pub latency_ms: u32,
    /// Our address as this peer sees it.
    pub observed_addr: Option<SocketAddr>,
}

impl Edge {
    pub fn new(public_key: [u8; 32], addr: SocketAddr, administrator: Id) -> Self {
        let now = now_millis();
        Self {
            node: NodeId::from_public_key(&public_key),
            addr,
            public_key,
            administrator,
            created_at: now,
            last_seen: now,
            last_key_exchange: None,
            latency_ms: 0,
            observed_addr: None,
        }
    }

    pub fn peer_edge(&self) -> PeerEdge {
        PeerEdge {
            node: self.node,
            addr: self.addr,
        }
    }

    /// Selection weight given the administrator's power.
    pub fn weight(&self, power: f64) -> f64 {
        power.max(MIN_POWER) / (1.0 + f64::from(self.latency_ms) / 100.0)
    }

    /// True when the last key exchange is missing or older than `max_age`.
    pub fn needs_key_exchange(&self, now: u64, max_age: Duration) -> bool {
        match self.last_key_exchange {
            Some(at) => now.saturating_sub(at) > max_age.as_millis() as u64,
            None => true,
        }
    }
}

/// What an insert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The node was already present and has been refreshed in place.
    Updated,
    /// Inserted after evicting the given node.
    Evicted(NodeId),
    /// List full and the newcomer was not strictly stronger than the weakest.
    Rejected,
}

impl InsertOutcome {
    pub fn accepted(&self) -> bool {
        !matches!(self, InsertOutcome::Rejected)
    }
}

pub struct NeighborList {
    capacity: usize,
    edges: DashMap<NodeId, Edge>,
    write_lock: Mutex<()>,
}

impl NeighborList {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            edges: DashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.edges.contains_key(node)
    }

    pub fn get(&self, node: &NodeId) -> Option<Edge> {
        self.edges.get(node).map(|e| e.value().clone())
    }

    pub fn remove(&self, node: &NodeId) -> Option<Edge> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.edges.remove(node).map(|(_, e)| e)
    }

    /// All edges, ordered by node id.
    pub fn snapshot(&self) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self.edges.iter().map(|e| e.value().clone()).collect();
        edges.sort_by(|a, b| a.node.cmp(&b.node));
        edges
    }

    /// Insert or refresh `edge`, applying the eviction rule when full.
    ///
    /// A refresh keeps the stored `created_at`. When the list is full the
    /// weakest edge (ties: oldest `created_at`, then smallest node id) is
    /// evicted only if the newcomer's weight is strictly greater.
    pub fn insert(&self, mut edge: Edge, power_of: impl Fn(Id) -> f64) -> InsertOutcome {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(mut existing) = self.edges.get_mut(&edge.node) {
            edge.created_at = existing.created_at;
            *existing = edge;
            return InsertOutcome::Updated;
        }

        if self.edges.len() < self.capacity {
            self.edges.insert(edge.node, edge);
            return InsertOutcome::Inserted;
        }

        let weakest = self
            .edges
            .iter()
            .map(|e| {
                let e = e.value();
                (e.weight(power_of(e.administrator)), e.created_at, e.node)
            })
            .min_by(|a, b| {
                a.0.total_cmp(&b.0)
                    .then(a.1.cmp(&b.1))
                    .then(a.2.cmp(&b.2))
            });

        match weakest {
            Some((weakest_weight, _, weakest_node))
                if edge.weight(power_of(edge.administrator)) > weakest_weight =>
            {
                self.edges.remove(&weakest_node);
                self.edges.insert(edge.node, edge);
                InsertOutcome::Evicted(weakest_node)
            }
            Some(_) => InsertOutcome::Rejected,
            // capacity zero
            None => InsertOutcome::Rejected,
        }
    }

    /// Apply `f` to a present edge. Returns false if absent.
    pub fn update(&self, node: &NodeId, f: impl FnOnce(&mut Edge)) -> bool {
        match self.edges.get_mut(node) {
            Some(mut edge) => {
                f(&mut edge);
                true
            }
            None => false,
        }
    }

    /// Remove edges created before `cutoff` (unix millis). Returns removed ids.
    pub fn sweep_created_before(&self, cutoff: u64) -> Vec<NodeId> {
        self.remove_where(|e| e.created_at < cutoff)
    }

    /// Remove edges last seen before `cutoff` (unix millis). Returns removed ids.
    pub fn prune_seen_before(&self, cutoff: u64) -> Vec<NodeId> {
        self.remove_where(|e| e.last_seen < cutoff)
    }

    fn remove_where(&self, pred: impl Fn(&Edge) -> bool) -> Vec<NodeId> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = Vec::new();
        self.edges.retain(|node, edge| {
            if pred(edge) {
                removed.push(*node);
                false
            } else {
                true
            }
        });
        removed.sort();
        removed
    }

    /// Pick an edge with probability proportional to its weight.
    pub fn select_weighted<R: Rng + ?Sized>(
        &self,
        power_of: impl Fn(Id) -> f64,
        rng: &mut R,
    ) -> Option<Edge> {
        let edges = self.snapshot();
        let weights: Vec<f64> = edges
            .iter()
            .map(|e| e.weight(power_of(e.administrator)))
            .collect();
        let index = WeightedIndex::new(&weights).ok()?;
        edges.into_iter().nth(index.sample(rng))
    }

    /// Most reported observed address; ties go to the smallest address.
    pub fn majority_observed_addr(&self) -> Option<SocketAddr> {
        let mut counts: BTreeMap<SocketAddr, usize> = BTreeMap::new();
        for edge in self.edges.iter() {
            if let Some(addr) = edge.observed_addr {
                *counts.entry(addr).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(addr, _)| addr)
    }
}

impl std::fmt::Debug for NeighborList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeighborList")
            .field("capacity", &self.capacity)
            .field("len", &self.edges.len())
            .finish()
    }
}
