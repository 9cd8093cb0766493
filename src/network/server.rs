use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::{self, TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use super::message::{Message, MAX_FRAME_LENGTH};
use super::registry::{same_listener, Attachment, ConnectionId, PeerRegistry, RegistryHandle};
use super::{NetworkError, Result};
use crate::blockchain::{Address, Block, SharedBlockchain, Transaction};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const OUTBOUND_QUEUE: usize = 64;

/// Settings for the peer-to-peer listener
#[derive(Debug, Clone)]
pub struct P2PConfig {
    pub host: String,
    /// 0 picks a free port
    pub port: u16,
    pub seed_peers: Vec<String>,
    pub max_peers: usize,
    pub heartbeat_interval: Duration,
    pub status_interval: Duration,
}

impl Default for P2PConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 12315,
            seed_peers: Vec::new(),
            max_peers: 32,
            heartbeat_interval: Duration::from_secs(1),
            status_interval: Duration::from_secs(10),
        }
    }
}

struct Inner {
    blockchain: SharedBlockchain,
    registry: RegistryHandle,
    local_addr: String,
    /// Address the listener is actually bound to
    bound: SocketAddr,
    max_peers: usize,
    next_id: AtomicU64,
    token: CancellationToken,
}

/// A running node: the listener, its peer connections and the shared ledger.
///
/// Cloning yields another handle to the same node.
#[derive(Clone)]
pub struct P2PServer {
    inner: Arc<Inner>,
}

struct Connection {
    id: ConnectionId,
    remote: String,
    framed: Framed<TcpStream, LinesCodec>,
    sender: mpsc::Sender<Message>,
    /// Listen address this connection is registered under
    peer_addr: Option<String>,
}

impl Connection {
    async fn send(&mut self, message: Message) -> Result<()> {
        let frame = message.to_frame()?;
        self.framed.send(frame).await?;
        Ok(())
    }
}

impl P2PServer {
    /// Binds the listener and starts accepting peers, the heartbeat and the
    /// status log. Seed peers are dialed in the background.
    pub async fn start(config: P2PConfig, blockchain: SharedBlockchain) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let bound = listener.local_addr()?;
        let local_addr = format!("{}:{}", config.host, bound.port());
        info!("P2P server listening on {}", local_addr);

        let server = Self {
            inner: Arc::new(Inner {
                blockchain,
                registry: PeerRegistry::spawn(local_addr.clone(), config.max_peers),
                local_addr,
                bound,
                max_peers: config.max_peers,
                next_id: AtomicU64::new(0),
                token: CancellationToken::new(),
            }),
        };

        tokio::spawn(server.clone().accept_loop(listener));
        tokio::spawn(server.clone().heartbeat_loop(config.heartbeat_interval));
        tokio::spawn(server.clone().status_loop(config.status_interval));

        for seed in config.seed_peers {
            server.spawn_connect(seed);
        }

        Ok(server)
    }

    /// Address peers should use to reach this node
    pub fn local_addr(&self) -> &str {
        &self.inner.local_addr
    }

    pub fn blockchain(&self) -> &SharedBlockchain {
        &self.inner.blockchain
    }

    /// Listen addresses of connected peers
    pub async fn peers(&self) -> Result<Vec<String>> {
        self.inner.registry.list().await
    }

    /// Dials `addr` unless it is this node, already known, or the peer table
    /// is full. Returns whether a new connection was opened.
    pub async fn connect(&self, addr: String) -> Result<bool> {
        if self.resolves_to_self(&addr).await {
            debug!("Not dialing {}: it resolves to this node", addr);
            return Ok(false);
        }
        if !self.inner.registry.reserve(addr.clone()).await? {
            debug!("Not dialing {}", addr);
            return Ok(false);
        }

        match time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                info!("Connected to peer {}", addr);
                tokio::spawn(self.clone().serve_connection(stream, Some(addr)));
                Ok(true)
            }
            Ok(Err(e)) => {
                self.inner.registry.release(addr).await?;
                Err(e.into())
            }
            Err(_) => {
                self.inner.registry.release(addr.clone()).await?;
                Err(NetworkError::ConnectTimeout(addr))
            }
        }
    }

    /// Whether any address `addr` resolves to reaches our own listener.
    /// Unresolvable names are left for the dial to report.
    async fn resolves_to_self(&self, addr: &str) -> bool {
        match net::lookup_host(addr).await {
            Ok(mut resolved) => resolved.any(|candidate| same_listener(candidate, self.inner.bound)),
            Err(e) => {
                debug!("Could not resolve {}: {}", addr, e);
                false
            }
        }
    }

    fn spawn_connect(&self, addr: String) {
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(e) = server.connect(addr.clone()).await {
                warn!("Failed to connect to peer {}: {}", addr, e);
            }
        });
    }

    /// Sends the local chain to every connected peer
    pub async fn broadcast_chain(&self) -> Result<()> {
        let chain = self.inner.blockchain.chain().await;
        self.inner
            .registry
            .broadcast(Message::ChainResponse(chain))
            .await
    }

    /// Mines the pending pool and gossips the extended chain
    pub async fn mine_and_broadcast(&self, reward_address: &Address) -> Result<Block> {
        let block = self.inner.blockchain.mine_next(reward_address).await?;
        self.broadcast_chain().await?;
        Ok(block)
    }

    pub async fn submit_transaction(&self, transaction: Transaction) -> Result<()> {
        self.inner
            .blockchain
            .submit_transaction(transaction)
            .await
            .map_err(NetworkError::from)
    }

    /// Stops all network tasks and saves the ledger
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down P2P server on {}", self.inner.local_addr);
        self.inner.token.cancel();
        self.inner.blockchain.close().await?;
        Ok(())
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.inner.token.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!("Accepted connection from {}", remote);
                        tokio::spawn(self.clone().serve_connection(stream, None));
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
            }
        }
        debug!("Listener on {} closed", self.inner.local_addr);
    }

    async fn heartbeat_loop(self, period: Duration) {
        let mut ticker = time::interval(period);
        loop {
            tokio::select! {
                _ = self.inner.token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.inner.registry.broadcast(Message::Heartbeat).await {
                        warn!("Heartbeat stopped: {}", e);
                        break;
                    }
                }
            }
        }
    }

    async fn status_loop(self, period: Duration) {
        let mut ticker = time::interval(period);
        loop {
            tokio::select! {
                _ = self.inner.token.cancelled() => break,
                _ = ticker.tick() => {
                    let peers = match self.inner.registry.list().await {
                        Ok(peers) => peers,
                        Err(e) => {
                            warn!("Status log stopped: {}", e);
                            break;
                        }
                    };
                    let length = self.inner.blockchain.len().await;
                    info!(
                        "Node {}: chain length {}, {} peers {:?}",
                        self.inner.local_addr,
                        length,
                        peers.len(),
                        peers
                    );
                }
            }
        }
    }

    async fn serve_connection(self, stream: TcpStream, dialed: Option<String>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let remote = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE);
        let mut connection = Connection {
            id,
            remote,
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH)),
            sender,
            peer_addr: None,
        };

        match self.drive(&mut connection, receiver, dialed).await {
            Ok(()) => debug!("Connection {} with {} closed", id, connection.remote),
            Err(e @ NetworkError::SelfConnection(_)) => debug!("Dropped connection {}: {}", id, e),
            Err(e) => warn!("Connection {} with {} closed: {}", id, connection.remote, e),
        }

        if let Some(addr) = connection.peer_addr.take() {
            if let Err(e) = self.inner.registry.remove(addr, id).await {
                warn!("Failed to unregister connection {}: {}", id, e);
            }
        }
    }

    async fn drive(
        &self,
        connection: &mut Connection,
        mut outbound: mpsc::Receiver<Message>,
        dialed: Option<String>,
    ) -> Result<()> {
        if let Some(addr) = dialed {
            let attachment = Attachment {
                addr: addr.clone(),
                id: connection.id,
                sender: connection.sender.clone(),
                outbound: true,
            };
            if !self.inner.registry.attach(attachment).await? {
                self.inner.registry.release(addr).await?;
                return Ok(());
            }
            connection.peer_addr = Some(addr);
        }

        connection.send(Message::ChainRequest).await?;
        connection
            .send(Message::PeerListRequest(self.inner.local_addr.clone()))
            .await?;

        loop {
            tokio::select! {
                _ = self.inner.token.cancelled() => return Ok(()),
                frame = connection.framed.next() => match frame {
                    Some(Ok(line)) => match Message::from_frame(&line) {
                        Ok(message) => self.handle_message(connection, message).await?,
                        Err(e) => warn!("Ignoring malformed message from {}: {}", connection.remote, e),
                    },
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },
                Some(message) = outbound.recv() => connection.send(message).await?,
            }
        }
    }

    async fn handle_message(&self, connection: &mut Connection, message: Message) -> Result<()> {
        debug!("Received {} from {}", message.kind(), connection.remote);
        match message {
            Message::ChainRequest => {
                let chain = self.inner.blockchain.chain().await;
                connection.send(Message::ChainResponse(chain)).await?;
            }
            Message::ChainResponse(chain) => {
                let length = chain.len();
                if self.inner.blockchain.replace_chain(chain).await {
                    info!("Adopted chain of length {} from {}", length, connection.remote);
                    self.broadcast_chain().await?;
                }
            }
            Message::PeerListRequest(addr) => {
                if addr == self.inner.local_addr {
                    return Err(NetworkError::SelfConnection(connection.remote.clone()));
                }
                if connection.peer_addr.is_none() {
                    let attachment = Attachment {
                        addr: addr.clone(),
                        id: connection.id,
                        sender: connection.sender.clone(),
                        outbound: false,
                    };
                    if self.inner.registry.attach(attachment).await? {
                        info!("Registered inbound peer {}", addr);
                        connection.peer_addr = Some(addr);
                    }
                }
                let peers = self.inner.registry.list().await?;
                connection.send(Message::PeerListResponse(peers)).await?;
            }
            Message::PeerListResponse(addrs) => {
                for addr in addrs.into_iter().take(self.inner.max_peers) {
                    if !self.inner.registry.contains(addr.clone()).await? {
                        self.spawn_connect(addr);
                    }
                }
            }
            Message::Heartbeat => {}
        }
        Ok(())
    }
}
