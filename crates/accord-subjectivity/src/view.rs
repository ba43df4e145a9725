//! The per-node local view and the periodic upkeep that keeps it fresh.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use accord_catchup::{NodeId, PeerEdge, PeerSelector};
use accord_identity::Id;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::config::SubjectivityConfig;
use crate::error::Result;
use crate::neighbor::{now_millis, Edge, InsertOutcome, NeighborList};
use crate::network::{Acquaintance, NodeIdentity, PeerAdvert, PeerNetwork};
use crate::persist::{SubjectivitySnapshot, SubjectivityStore};
use crate::powers::Powers;
use crate::scheduler::PeriodicTask;

/// Fixed facts about this node supplied at startup.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub public_key: [u8; 32],
    pub node_number: u64,
    pub administrator: Id,
    /// Fallback address when no neighbor has reported one.
    pub listen_addr: SocketAddr,
}

#[derive(Debug, Clone, Copy)]
enum Job {
    Notify,
    Discover,
    SweepTentative,
    RefreshKeys,
}

#[derive(Default)]
struct Tasks {
    running: Vec<PeriodicTask>,
    started: bool,
}

pub struct Subjectivity {
    config: SubjectivityConfig,
    local: LocalIdentity,
    node: NodeId,
    confirmed: NeighborList,
    tentative: NeighborList,
    powers: Powers,
    message_seq: AtomicU64,
    last_announced: Arc<Mutex<Option<SocketAddr>>>,
    announcing: Arc<AtomicBool>,
    store: Arc<dyn SubjectivityStore>,
    network: Arc<dyn PeerNetwork>,
    tasks: Mutex<Tasks>,
    live: Arc<AtomicUsize>,
}

impl Subjectivity {
    /// Restore the persisted view, or start fresh. Never fails: a storage
    /// error is logged and treated as absence.
    pub fn load_or_create(
        config: SubjectivityConfig,
        local: LocalIdentity,
        store: Arc<dyn SubjectivityStore>,
        network: Arc<dyn PeerNetwork>,
    ) -> Arc<Self> {
        let snapshot = match store.load() {
            Ok(Some(snapshot)) => {
                info!(
                    "Loaded local view: {} confirmed neighbors, message seq {}",
                    snapshot.confirmed.len(),
                    snapshot.message_seq
                );
                snapshot
            }
            Ok(None) => {
                info!("No saved local view, starting fresh");
                SubjectivitySnapshot::default()
            }
            Err(e) => {
                warn!(error = %e, "Failed to load local view, starting fresh");
                SubjectivitySnapshot::default()
            }
        };

        let node = NodeId::from_public_key(&local.public_key);
        let view = Self {
            confirmed: NeighborList::new(config.neighbor_capacity),
            tentative: NeighborList::new(config.tentative_capacity),
            powers: Powers::from_map(snapshot.powers),
            message_seq: AtomicU64::new(snapshot.message_seq),
            last_announced: Arc::new(Mutex::new(snapshot.last_announced_addr)),
            announcing: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Tasks::default()),
            live: Arc::new(AtomicUsize::new(0)),
            config,
            local,
            node,
            store,
            network,
        };
        for edge in snapshot.confirmed {
            if edge.node != view.node {
                view.confirmed.insert(edge, |a| view.powers.get(a));
            }
        }
        Arc::new(view)
    }

    /// Schedule the four upkeep tasks, replacing any already running.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.running.drain(..) {
            task.cancel();
        }
        let restart = tasks.started;
        tasks.started = true;

        let schedule = [
            ("notify", self.config.notification_interval, Job::Notify),
            ("discover", self.config.address_discovery_interval, Job::Discover),
            ("sweep_tentative", self.config.tentative_sweep_interval, Job::SweepTentative),
            ("refresh_keys", self.config.key_exchange_interval, Job::RefreshKeys),
        ];
        for (name, interval, job) in schedule {
            let delay = if restart {
                self.config.initial_wait + interval
            } else {
                self.config.initial_wait
            };
            let weak = Arc::downgrade(self);
            tasks.running.push(PeriodicTask::spawn(
                name,
                delay,
                interval,
                self.live.clone(),
                move || {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(view) => view.run(job).await,
                            None => Ok(()),
                        }
                    }
                },
            ));
        }
        info!(restart, "Local view tasks scheduled");
    }

    /// Cancel every task, wait out the grace period, then persist.
    pub async fn stop(&self) -> Result<()> {
        let cancelled = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            let mut any = false;
            for task in tasks.running.drain(..) {
                any |= task.cancel();
            }
            any
        };

        let grace = if cancelled {
            self.config.stop_grace + self.config.cancel_grace
        } else {
            self.config.stop_grace
        };
        tokio::time::sleep(grace).await;

        self.save()?;
        info!("Local view saved");
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.store.save(&self.snapshot())
    }

    pub fn snapshot(&self) -> SubjectivitySnapshot {
        SubjectivitySnapshot {
            confirmed: self.confirmed.snapshot(),
            powers: self.powers.snapshot(),
            message_seq: self.message_seq.load(Ordering::SeqCst),
            last_announced_addr: *self
                .last_announced
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// Number of periodic tasks whose futures are still alive.
    pub fn active_task_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Our identity as peers should see it.
    ///
    /// The address is the one most neighbors report observing, falling back
    /// to the listen address. When it differs from the last announced one an
    /// announcement is spawned; at most one is in flight at a time.
    pub fn me(&self) -> NodeIdentity {
        let addr = self
            .confirmed
            .majority_observed_addr()
            .unwrap_or(self.local.listen_addr);
        let identity = NodeIdentity {
            node: self.node,
            public_key: self.local.public_key,
            node_number: self.local.node_number,
            administrator: self.local.administrator,
            addr,
        };

        let changed = *self
            .last_announced
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            != Some(addr);
        if changed {
            self.spawn_announcement(identity.clone());
        }
        identity
    }

    fn spawn_announcement(&self, identity: NodeIdentity) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self
            .announcing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let network = self.network.clone();
        let announcing = self.announcing.clone();
        let last_announced = self.last_announced.clone();
        runtime.spawn(async move {
            match network.announce_address(&identity).await {
                Ok(()) => {
                    info!("Announced address {}", identity.addr);
                    *last_announced.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(identity.addr);
                }
                Err(e) => warn!(error = %e, "Address announcement failed"),
            }
            announcing.store(false, Ordering::SeqCst);
        });
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }

    pub fn config(&self) -> &SubjectivityConfig {
        &self.config
    }

    pub fn confirmed(&self) -> Vec<Edge> {
        self.confirmed.snapshot()
    }

    pub fn tentative(&self) -> Vec<Edge> {
        self.tentative.snapshot()
    }

    pub fn confirmed_count(&self) -> usize {
        self.confirmed.len()
    }

    pub fn tentative_count(&self) -> usize {
        self.tentative.len()
    }

    pub fn neighbor(&self, node: &NodeId) -> Option<Edge> {
        self.confirmed.get(node)
    }

    pub fn power(&self, administrator: Id) -> f64 {
        self.powers.get(administrator)
    }

    pub fn set_power(&self, administrator: Id, value: f64) -> Result<()> {
        self.powers.set(administrator, value)
    }

    /// Record an advertised peer as tentative. Returns false if it is
    /// ourselves, already confirmed, inconsistent or refused for capacity.
    pub fn observe(&self, advert: PeerAdvert) -> bool {
        if advert.node == self.node
            || advert.node != NodeId::from_public_key(&advert.public_key)
            || self.confirmed.contains(&advert.node)
        {
            return false;
        }
        let edge = Edge::new(advert.public_key, advert.addr, advert.administrator);
        self.tentative
            .insert(edge, |a| self.powers.get(a))
            .accepted()
    }

    /// Promote a tentative peer after a successful key exchange.
    ///
    /// Returns `None` if the peer is no longer tentative or proved a
    /// different key than the one advertised.
    pub fn confirm(&self, node: &NodeId, acquaintance: Acquaintance) -> Option<InsertOutcome> {
        let mut edge = self.tentative.remove(node)?;
        if edge.public_key != acquaintance.public_key {
            warn!("Peer {} proved a different key than advertised", node);
            return None;
        }

        let now = now_millis();
        edge.administrator = acquaintance.administrator;
        edge.latency_ms = acquaintance.latency_ms;
        edge.observed_addr = acquaintance.observed_addr;
        edge.last_seen = now;
        edge.last_key_exchange = Some(now);
        edge.created_at = now;

        let outcome = self.confirmed.insert(edge, |a| self.powers.get(a));
        match outcome {
            InsertOutcome::Evicted(evicted) => {
                debug!("Confirmed {} by evicting {}", node, evicted)
            }
            InsertOutcome::Rejected => debug!("Neighbor list full, {} not confirmed", node),
            _ => debug!("Confirmed neighbor {}", node),
        }
        Some(outcome)
    }

    /// A peer proved its key to us directly.
    pub fn record_hello(
        &self,
        advert: PeerAdvert,
        observed_addr: Option<SocketAddr>,
    ) -> Option<InsertOutcome> {
        let acquaintance = Acquaintance {
            public_key: advert.public_key,
            administrator: advert.administrator,
            latency_ms: 0,
            observed_addr,
        };
        let node = advert.node;
        let now = now_millis();
        let refreshed = self.confirmed.update(&node, |edge| {
            edge.addr = advert.addr;
            edge.administrator = advert.administrator;
            edge.last_seen = now;
            edge.last_key_exchange = Some(now);
            if observed_addr.is_some() {
                edge.observed_addr = observed_addr;
            }
        });
        if refreshed {
            return Some(InsertOutcome::Updated);
        }
        if !self.observe(advert) {
            return None;
        }
        self.confirm(&node, acquaintance)
    }

    /// A confirmed neighbor was heard from.
    pub fn touch(&self, node: &NodeId) -> bool {
        let now = now_millis();
        self.confirmed.update(node, |edge| edge.last_seen = now)
    }

    async fn run(&self, job: Job) -> Result<()> {
        match job {
            Job::Notify => self.notify_neighbors().await,
            Job::Discover => self.discover_addresses().await,
            Job::SweepTentative => {
                self.sweep_tentative();
                Ok(())
            }
            Job::RefreshKeys => self.refresh_key_exchanges().await,
        }
    }

    pub(crate) async fn notify_neighbors(&self) -> Result<()> {
        let me = self.me();
        let neighbors = self.confirmed.snapshot();
        let mut delivered = 0usize;
        for edge in &neighbors {
            match self.network.notify(&me, edge.peer_edge()).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(peer = %edge.node, error = %e, "Notify failed"),
            }
        }
        debug!("Notified {}/{} neighbors", delivered, neighbors.len());
        Ok(())
    }

    pub(crate) async fn discover_addresses(&self) -> Result<()> {
        let cutoff = now_millis().saturating_sub(self.config.prune_after.as_millis() as u64);
        let pruned = self.confirmed.prune_seen_before(cutoff);
        if !pruned.is_empty() {
            info!("Pruned {} silent neighbors", pruned.len());
        }

        let sources: Vec<PeerEdge> = {
            let neighbors = self.confirmed.snapshot();
            let mut rng = rand::thread_rng();
            neighbors
                .choose_multiple(&mut rng, self.config.discovery_fanout)
                .map(Edge::peer_edge)
                .collect()
        };
        let mut observed = 0usize;
        for source in sources {
            match self.network.discover(source).await {
                Ok(adverts) => {
                    for advert in adverts {
                        if self.observe(advert) {
                            observed += 1;
                        }
                    }
                }
                Err(e) => debug!(peer = %source.node, error = %e, "Discovery failed"),
            }
        }

        let me = self.me();
        let candidates: Vec<PeerEdge> = self
            .tentative
            .snapshot()
            .iter()
            .take(self.config.acquaint_batch)
            .map(Edge::peer_edge)
            .collect();
        let mut confirmed = 0usize;
        for peer in candidates {
            match self.network.acquaint(&me, peer).await {
                Ok(acquaintance) => {
                    if self
                        .confirm(&peer.node, acquaintance)
                        .is_some_and(|o| o.accepted())
                    {
                        confirmed += 1;
                    }
                }
                Err(e) => debug!(peer = %peer.node, error = %e, "Acquaint failed"),
            }
        }

        if observed > 0 || confirmed > 0 {
            info!(
                "Discovery: {} new tentative, {} confirmed, {} neighbors",
                observed,
                confirmed,
                self.confirmed.len()
            );
        }
        Ok(())
    }

    pub(crate) fn sweep_tentative(&self) -> usize {
        let cutoff = now_millis().saturating_sub(self.config.tentative_ttl.as_millis() as u64);
        let swept = self.tentative.sweep_created_before(cutoff);
        if !swept.is_empty() {
            debug!("Swept {} expired tentative peers", swept.len());
        }
        swept.len()
    }

    pub(crate) async fn refresh_key_exchanges(&self) -> Result<()> {
        let now = now_millis();
        let stale: Vec<PeerEdge> = self
            .confirmed
            .snapshot()
            .iter()
            .filter(|e| e.needs_key_exchange(now, self.config.key_exchange_max_age))
            .map(Edge::peer_edge)
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        let me = self.me();
        for peer in stale {
            match self.network.acquaint(&me, peer).await {
                Ok(acquaintance) => {
                    let at = now_millis();
                    self.confirmed.update(&peer.node, |edge| {
                        edge.administrator = acquaintance.administrator;
                        edge.latency_ms = acquaintance.latency_ms;
                        edge.observed_addr = acquaintance.observed_addr;
                        edge.last_seen = at;
                        edge.last_key_exchange = Some(at);
                    });
                }
                Err(e) => warn!(peer = %peer.node, error = %e, "Key exchange refresh failed"),
            }
        }
        Ok(())
    }
}

impl PeerSelector for Subjectivity {
    fn select_weighted(&self) -> Option<PeerEdge> {
        let mut rng = rand::thread_rng();
        self.confirmed
            .select_weighted(|a| self.powers.get(a), &mut rng)
            .map(|e| e.peer_edge())
    }

    fn next_message_id(&self) -> u64 {
        self.message_seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl std::fmt::Debug for Subjectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subjectivity")
            .field("node", &self.node)
            .field("confirmed", &self.confirmed.len())
            .field("tentative", &self.tentative.len())
            .field("active_tasks", &self.active_task_count())
            .finish()
    }
}
