//! Accord node: wires storage, the local view, the peer server and the
//! catch-up driver together.
//!
//! Architecture:
//! - One RocksDB instance for objectivity state, the saved view and the node key
//! - Newline-delimited JSON over TCP for peer traffic
//! - Two periodic tasks for catch-up: majority sampling and machine ticks
//! - Read-only HTTP API for status

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use accord_identity::Id;
use accord_objectivity::{ObjectStore, ObjectivityCore, ObjectivityCoreConfig};
use accord_subjectivity::{LocalIdentity, PeriodicTask, Subjectivity};
use ed25519_dalek::SigningKey;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{self, ApiState};
use crate::config::NodeConfig;
use crate::driver::CatchUpDriver;
use crate::error::Result;
use crate::network::TcpPeerNetwork;
use crate::server::PeerServer;
use crate::storage::Storage;
use crate::transport::TcpTransport;

pub type NodeStore = ObjectStore<Storage>;

/// An Accord node instance.
pub struct AccordNode {
    config: NodeConfig,
    store: Arc<NodeStore>,
    signing_key: Arc<SigningKey>,
    view: Arc<Subjectivity>,
    network: Arc<TcpPeerNetwork>,
    driver: Arc<CatchUpDriver<Storage>>,
    listener: Option<TcpListener>,
    p2p_addr: SocketAddr,
    server: Option<JoinHandle<()>>,
    catch_up_tasks: Vec<PeriodicTask>,
}

impl AccordNode {
    /// Open storage and bind the p2p listener. Nothing runs until [`start`].
    ///
    /// [`start`]: AccordNode::start
    pub async fn new(config: NodeConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let storage = Storage::open(&config.data_dir)?;
        let signing_key = Arc::new(storage.get_or_create_node_key()?);

        let listener = TcpListener::bind(config.p2p_addr).await?;
        let p2p_addr = listener.local_addr()?;
        let advertise_addr = config.advertise_addr.unwrap_or(p2p_addr);

        let store = Arc::new(ObjectStore::new(storage.clone()));
        if config.genesis {
            write_genesis(&store)?;
        }

        let transport = TcpTransport::new(config.request_timeout);
        let network = Arc::new(TcpPeerNetwork::new(
            transport.clone(),
            signing_key.clone(),
            config.bootstrap_peers.clone(),
        ));
        let view = Subjectivity::load_or_create(
            config.subjectivity.clone(),
            LocalIdentity {
                public_key: signing_key.verifying_key().to_bytes(),
                node_number: config.node_number,
                administrator: config.administrator,
                listen_addr: advertise_addr,
            },
            Arc::new(storage),
            network.clone(),
        );
        let driver = Arc::new(CatchUpDriver::new(
            store.clone(),
            view.clone(),
            transport,
            config.majority_sample,
        ));

        Ok(Self {
            config,
            store,
            signing_key,
            view,
            network,
            driver,
            listener: Some(listener),
            p2p_addr,
            server: None,
            catch_up_tasks: Vec::new(),
        })
    }

    pub fn store(&self) -> Arc<NodeStore> {
        Arc::clone(&self.store)
    }

    pub fn view(&self) -> Arc<Subjectivity> {
        Arc::clone(&self.view)
    }

    pub fn driver(&self) -> Arc<CatchUpDriver<Storage>> {
        Arc::clone(&self.driver)
    }

    /// Address the p2p listener is bound to.
    pub fn p2p_addr(&self) -> SocketAddr {
        self.p2p_addr
    }

    pub fn api_state(&self) -> ApiState<Storage> {
        ApiState {
            view: self.view(),
            driver: self.driver(),
        }
    }

    /// Start serving peers, introduce ourselves to bootstrap peers and
    /// schedule upkeep and catch-up.
    pub async fn start(&mut self) -> Result<()> {
        self.serve_peers();
        self.introduce_to_bootstrap_peers().await;
        self.view.start();
        self.start_catch_up();
        Ok(())
    }

    /// Answer peer requests without catching up or upkeep of our own.
    pub fn serve_peers(&mut self) {
        if let Some(listener) = self.listener.take() {
            let server = Arc::new(PeerServer::new(
                self.store.clone(),
                self.view.clone(),
                self.signing_key.clone(),
            ));
            self.server = Some(tokio::spawn(async move {
                if let Err(e) = server.run(listener).await {
                    tracing::error!("Peer server error: {}", e);
                }
            }));
        }
    }

    fn start_catch_up(&mut self) {
        for task in self.catch_up_tasks.drain(..) {
            task.cancel();
        }
        let live = Arc::new(AtomicUsize::new(0));
        let driver = self.driver.clone();
        self.catch_up_tasks.push(PeriodicTask::spawn(
            "majority",
            Duration::ZERO,
            self.config.majority_interval,
            live.clone(),
            move || {
                let driver = driver.clone();
                async move {
                    driver.refresh_majority().await;
                    Ok(())
                }
            },
        ));
        let driver = self.driver.clone();
        self.catch_up_tasks.push(PeriodicTask::spawn(
            "catch_up",
            self.config.catch_up_interval,
            self.config.catch_up_interval,
            live,
            move || {
                let driver = driver.clone();
                async move {
                    driver.tick();
                    Ok(())
                }
            },
        ));
    }

    async fn introduce_to_bootstrap_peers(&self) {
        for peer in &self.config.bootstrap_peers {
            info!("Connecting to bootstrap peer: {}", peer);
            match self.network.introduce(&self.view.me(), peer.as_str()).await {
                Ok((advert, acquaintance)) => {
                    let node = advert.node;
                    self.view.observe(advert);
                    match self.view.confirm(&node, acquaintance) {
                        Some(outcome) if outcome.accepted() => {
                            info!("Bootstrap peer {} confirmed as {}", peer, node)
                        }
                        _ => warn!("Bootstrap peer {} not added to neighbors", peer),
                    }
                }
                Err(e) => warn!("Failed to introduce to bootstrap peer {}: {}", peer, e),
            }
        }
    }

    /// Stop catch-up and the peer server, then stop and persist the view.
    pub async fn shutdown(&mut self) -> Result<()> {
        for task in self.catch_up_tasks.drain(..) {
            task.cancel();
        }
        if let Some(server) = self.server.take() {
            server.abort();
        }
        self.view.stop().await?;
        Ok(())
    }

    /// Run until ctrl-c (starts the peer server, catch-up and the HTTP API).
    pub async fn run(mut self) -> Result<()> {
        info!("Accord node starting");
        info!("  API: http://{}", self.config.api_addr);
        info!("  P2P: {}", self.p2p_addr);
        info!("  Node: {}", self.view.node_id());
        info!("  Data: {:?}", self.config.data_dir);

        self.start().await?;

        let app = api::build_router(self.api_state());
        let listener = TcpListener::bind(self.config.api_addr).await?;
        info!("HTTP server listening on {}", self.config.api_addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for ctrl-c: {}", e);
                }
            })
            .await?;

        info!("Shutting down");
        self.shutdown().await
    }
}

fn write_genesis(store: &NodeStore) -> Result<()> {
    store.write_in_transaction(|txn| {
        if txn.core()?.is_none() {
            let core = ObjectivityCore::genesis(Id::VOTE, ObjectivityCoreConfig::default());
            info!("Writing genesis core {}", core.content_hash()?);
            txn.save_core(&core)?;
        }
        Ok(())
    })?;
    Ok(())
}
