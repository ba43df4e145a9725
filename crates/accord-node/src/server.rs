//! Serves the wire protocol to other nodes.

use std::net::SocketAddr;
use std::sync::Arc;

use accord_catchup::Request;
use accord_objectivity::{
    local_state_hashes, GetCore, GetStateHashes, GetUsers, KvBackend, ObjectStore,
    MAX_USERS_PER_REQUEST,
};
use accord_subjectivity::{now_millis, NodeIdentity, PeerAdvert, Subjectivity};
use ed25519_dalek::SigningKey;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::wire::{read_frame_line, Frame, Hello, HelloAck, GET_NEIGHBORS, HELLO, NOTIFY};

pub struct PeerServer<B> {
    store: Arc<ObjectStore<B>>,
    view: Arc<Subjectivity>,
    signing_key: Arc<SigningKey>,
}

impl<B: KvBackend + 'static> PeerServer<B> {
    pub fn new(
        store: Arc<ObjectStore<B>>,
        view: Arc<Subjectivity>,
        signing_key: Arc<SigningKey>,
    ) -> Self {
        Self {
            store,
            view,
            signing_key,
        }
    }

    /// Accept connections until the listener fails for good.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Peer server listening on {}", listener.local_addr()?);
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Incoming peer connection from {}", addr);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr).await {
                            warn!("Connection error from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            match read_frame_line(&mut reader, &mut line).await {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(Error::Protocol(message)) => {
                    let reply = Frame::Error {
                        id: 0,
                        message: message.clone(),
                    };
                    writer.write_all(reply.to_line()?.as_bytes()).await?;
                    return Err(Error::Protocol(message));
                }
                Err(e) => return Err(e),
            }

            let reply = match serde_json::from_str::<Frame>(&line) {
                Ok(Frame::Request { id, kind, body }) => match self.dispatch(&kind, body, addr) {
                    Ok(body) => Frame::Response { id, body },
                    Err(e) => {
                        debug!("Request {} from {} failed: {}", kind, addr, e);
                        Frame::Error {
                            id,
                            message: e.to_string(),
                        }
                    }
                },
                Ok(other) => Frame::Error {
                    id: other.id(),
                    message: "expected a request frame".into(),
                },
                Err(e) => Frame::Error {
                    id: 0,
                    message: format!("malformed frame: {e}"),
                },
            };
            writer.write_all(reply.to_line()?.as_bytes()).await?;
        }
    }

    fn dispatch(&self, kind: &str, body: Value, remote: SocketAddr) -> Result<Value> {
        match kind {
            GetCore::KIND => {
                let core = self.store.read_in_transaction(|txn| txn.core())?;
                Ok(serde_json::to_value(core)?)
            }
            GetUsers::KIND => {
                let request: GetUsers = serde_json::from_value(body)?;
                if request.ids.len() > MAX_USERS_PER_REQUEST {
                    return Err(Error::Protocol(format!(
                        "at most {} users per request",
                        MAX_USERS_PER_REQUEST
                    )));
                }
                let users = self.store.read_in_transaction(|txn| {
                    let mut users = Vec::with_capacity(request.ids.len());
                    for id in &request.ids {
                        if let Some(user) = txn.user(*id)? {
                            users.push(user);
                        }
                    }
                    Ok(users)
                })?;
                Ok(serde_json::to_value(users)?)
            }
            GetStateHashes::KIND => {
                let hashes = self.store.read_in_transaction(local_state_hashes)?;
                Ok(serde_json::to_value(hashes)?)
            }
            HELLO => {
                let hello: Hello = serde_json::from_value(body)?;
                let ack = self.accept_hello(hello, remote)?;
                Ok(serde_json::to_value(ack)?)
            }
            NOTIFY => {
                let identity: NodeIdentity = serde_json::from_value(body)?;
                if !self.view.touch(&identity.node) {
                    self.view.observe(PeerAdvert::from(&identity));
                }
                Ok(Value::Null)
            }
            GET_NEIGHBORS => {
                let adverts: Vec<PeerAdvert> = self
                    .view
                    .confirmed()
                    .into_iter()
                    .map(|edge| PeerAdvert {
                        node: edge.node,
                        addr: edge.addr,
                        public_key: edge.public_key,
                        administrator: edge.administrator,
                    })
                    .collect();
                Ok(serde_json::to_value(adverts)?)
            }
            other => Err(Error::Protocol(format!("unknown request kind {other:?}"))),
        }
    }

    fn accept_hello(&self, hello: Hello, remote: SocketAddr) -> Result<HelloAck> {
        hello.verify(now_millis())?;
        if hello.identity.node == self.view.node_id() {
            return Err(Error::Protocol("hello from ourselves".into()));
        }

        let advertised = hello.identity.addr;
        let observed_addr = SocketAddr::new(remote.ip(), advertised.port());
        let mut advert = PeerAdvert::from(&hello.identity);
        if advertised.ip().is_unspecified() {
            advert.addr = observed_addr;
        }
        match self.view.record_hello(advert, None) {
            Some(outcome) => debug!("Hello from {}: {:?}", hello.identity.node, outcome),
            None => debug!("Hello from {} verified but not recorded", hello.identity.node),
        }

        Ok(HelloAck {
            hello: Hello::sign(self.view.me(), &self.signing_key)?,
            observed_addr,
        })
    }
}
