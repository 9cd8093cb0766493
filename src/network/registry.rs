use std::collections::HashMap;
use std::net::SocketAddr;

use log::{debug, warn};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use super::message::Message;
use super::{NetworkError, Result};

/// Identifies one TCP connection for the lifetime of the process
pub type ConnectionId = u64;

const COMMAND_QUEUE: usize = 256;

async fn receive<Type>(sender: &str, receiver: oneshot::Receiver<Type>) -> Result<Type> {
    receiver
        .await
        .map_err(|error| NetworkError::ChannelFailure(sender.to_string(), error.to_string()))
}

/// Whether a connection to `candidate` would reach the listener bound at
/// `local`. A wildcard listener is reachable on loopback.
pub fn same_listener(candidate: SocketAddr, local: SocketAddr) -> bool {
    candidate.port() == local.port()
        && (candidate.ip() == local.ip()
            || (local.ip().is_unspecified() && candidate.ip().is_loopback()))
}

/// A live connection offered to the registry under a peer's listen address
#[derive(Debug)]
pub struct Attachment {
    pub addr: String,
    pub id: ConnectionId,
    pub sender: mpsc::Sender<Message>,
    /// Set when this node dialed the peer and holds its reservation
    pub outbound: bool,
}

#[derive(Debug)]
pub enum RegistryCommand {
    Reserve(String, oneshot::Sender<bool>),
    Attach(Attachment, oneshot::Sender<bool>),
    /// Drops the entry for an address. `None` releases a reservation, `Some(id)`
    /// removes the connection with that id.
    Remove(String, Option<ConnectionId>),
    Broadcast(Message),
    List(oneshot::Sender<Vec<String>>),
    Contains(String, oneshot::Sender<bool>),
    Len(oneshot::Sender<usize>),
}

impl RegistryCommand {
    pub async fn send(self, from: &str, sender: &mpsc::Sender<RegistryCommand>) -> Result<()> {
        sender
            .send(self)
            .await
            .map_err(|error| NetworkError::ChannelFailure(from.to_string(), error.to_string()))
    }
}

#[derive(Debug)]
enum PeerSlot {
    Dialing,
    Connected {
        id: ConnectionId,
        sender: mpsc::Sender<Message>,
    },
}

/// Owner of the peer table. Runs as a single task; everything else talks to
/// it through a [`RegistryHandle`].
#[derive(Debug)]
pub struct PeerRegistry {
    local_addr: String,
    max_peers: usize,
    peers: HashMap<String, PeerSlot>,
}

impl PeerRegistry {
    pub fn new(local_addr: String, max_peers: usize) -> Self {
        Self {
            local_addr,
            max_peers,
            peers: HashMap::new(),
        }
    }

    /// Starts the registry task and returns a handle to it
    pub fn spawn(local_addr: String, max_peers: usize) -> RegistryHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let registry = Self::new(local_addr, max_peers);
        tokio::spawn(registry.run(command_rx));
        RegistryHandle::new(command_tx)
    }

    pub async fn run(mut self, mut receiver: mpsc::Receiver<RegistryCommand>) {
        while let Some(command) = receiver.recv().await {
            match command {
                RegistryCommand::Reserve(addr, reply) => {
                    let _ = reply.send(self.reserve(addr));
                }
                RegistryCommand::Attach(attachment, reply) => {
                    let _ = reply.send(self.attach(attachment));
                }
                RegistryCommand::Remove(addr, id) => self.remove(&addr, id),
                RegistryCommand::Broadcast(message) => self.broadcast(message),
                RegistryCommand::List(reply) => {
                    let _ = reply.send(self.list());
                }
                RegistryCommand::Contains(addr, reply) => {
                    let _ = reply.send(self.peers.contains_key(&addr));
                }
                RegistryCommand::Len(reply) => {
                    let _ = reply.send(self.connected().count());
                }
            }
        }
        debug!("Peer registry stopped");
    }

    /// Whether `addr` names this node's own listener
    pub fn is_self(&self, addr: &str) -> bool {
        if addr == self.local_addr {
            return true;
        }
        match (addr.parse::<SocketAddr>(), self.local_addr.parse::<SocketAddr>()) {
            (Ok(candidate), Ok(local)) => same_listener(candidate, local),
            _ => false,
        }
    }

    fn is_full(&self) -> bool {
        self.peers.len() >= self.max_peers
    }

    fn reserve(&mut self, addr: String) -> bool {
        if self.is_self(&addr) || self.peers.contains_key(&addr) || self.is_full() {
            return false;
        }
        self.peers.insert(addr, PeerSlot::Dialing);
        true
    }

    fn attach(&mut self, attachment: Attachment) -> bool {
        let Attachment {
            addr,
            id,
            sender,
            outbound,
        } = attachment;

        if self.is_self(&addr) {
            return false;
        }
        match self.peers.get(&addr) {
            Some(PeerSlot::Dialing) if outbound => {}
            Some(_) => return false,
            None if self.is_full() => return false,
            None => {}
        }
        debug!("Peer {} attached to connection {}", addr, id);
        self.peers.insert(addr, PeerSlot::Connected { id, sender });
        true
    }

    fn remove(&mut self, addr: &str, id: Option<ConnectionId>) {
        let owned = match (self.peers.get(addr), id) {
            (Some(PeerSlot::Dialing), None) => true,
            (Some(PeerSlot::Connected { id: current, .. }), Some(id)) => *current == id,
            _ => false,
        };
        if owned {
            self.peers.remove(addr);
            debug!("Peer {} removed", addr);
        }
    }

    fn broadcast(&mut self, message: Message) {
        let mut closed = Vec::new();
        for (addr, slot) in &self.peers {
            if let PeerSlot::Connected { sender, .. } = slot {
                match sender.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("Outbound queue for {} is full, dropping {}", addr, message.kind())
                    }
                    Err(TrySendError::Closed(_)) => closed.push(addr.clone()),
                }
            }
        }
        for addr in closed {
            self.peers.remove(&addr);
            debug!("Peer {} removed after its connection closed", addr);
        }
    }

    fn connected(&self) -> impl Iterator<Item = &String> {
        self.peers
            .iter()
            .filter(|(_, slot)| matches!(slot, PeerSlot::Connected { .. }))
            .map(|(addr, _)| addr)
    }

    fn list(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.connected().cloned().collect();
        addrs.sort();
        addrs
    }
}

#[derive(Clone, Debug)]
pub struct RegistryHandle {
    command_tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    pub fn new(command_tx: mpsc::Sender<RegistryCommand>) -> Self {
        Self { command_tx }
    }

    /// Claims a slot for an outbound dial. False for self, known or over capacity.
    pub async fn reserve(&self, addr: String) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        RegistryCommand::Reserve(addr, tx)
            .send("reserve", &self.command_tx)
            .await?;
        receive("reserve", rx).await
    }

    pub async fn attach(&self, attachment: Attachment) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        RegistryCommand::Attach(attachment, tx)
            .send("attach", &self.command_tx)
            .await?;
        receive("attach", rx).await
    }

    pub async fn release(&self, addr: String) -> Result<()> {
        RegistryCommand::Remove(addr, None)
            .send("release", &self.command_tx)
            .await
    }

    pub async fn remove(&self, addr: String, id: ConnectionId) -> Result<()> {
        RegistryCommand::Remove(addr, Some(id))
            .send("remove", &self.command_tx)
            .await
    }

    pub async fn broadcast(&self, message: Message) -> Result<()> {
        RegistryCommand::Broadcast(message)
            .send("broadcast", &self.command_tx)
            .await
    }

    /// Listen addresses of connected peers, sorted
    pub async fn list(&self) -> Result<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        RegistryCommand::List(tx).send("list", &self.command_tx).await?;
        receive("list", rx).await
    }

    pub async fn contains(&self, addr: String) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        RegistryCommand::Contains(addr, tx)
            .send("contains", &self.command_tx)
            .await?;
        receive("contains", rx).await
    }

    pub async fn len(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        RegistryCommand::Len(tx).send("len", &self.command_tx).await?;
        receive("len", rx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: &str = "127.0.0.1:7000";

    fn attachment(addr: &str, id: ConnectionId, outbound: bool) -> (Attachment, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(4);
        let attachment = Attachment {
            addr: addr.to_string(),
            id,
            sender,
            outbound,
        };
        (attachment, receiver)
    }

    #[test]
    fn test_self_address_is_recognised() {
        let registry = PeerRegistry::new(LOCAL.to_string(), 8);
        assert!(registry.is_self("127.0.0.1:7000"));
        assert!(!registry.is_self("127.0.0.1:7001"));
        assert!(!registry.is_self("10.0.0.1:7000"));

        let wildcard = PeerRegistry::new("0.0.0.0:7000".to_string(), 8);
        assert!(wildcard.is_self("127.0.0.1:7000"));
    }

    #[test]
    fn test_same_listener() {
        let local: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let wildcard: SocketAddr = "0.0.0.0:7000".parse().unwrap();

        assert!(same_listener("127.0.0.1:7000".parse().unwrap(), local));
        assert!(!same_listener("[::1]:7000".parse().unwrap(), local));
        assert!(same_listener("[::1]:7000".parse().unwrap(), wildcard));
        assert!(!same_listener("127.0.0.1:7001".parse().unwrap(), wildcard));
        assert!(!same_listener("10.0.0.1:7000".parse().unwrap(), wildcard));
    }

    #[tokio::test]
    async fn test_reserve_guards() {
        let registry = PeerRegistry::spawn(LOCAL.to_string(), 2);

        assert!(!registry.reserve(LOCAL.to_string()).await.unwrap());
        assert!(registry.reserve("127.0.0.1:7001".to_string()).await.unwrap());
        assert!(!registry.reserve("127.0.0.1:7001".to_string()).await.unwrap());
        assert!(registry.reserve("127.0.0.1:7002".to_string()).await.unwrap());
        // Full
        assert!(!registry.reserve("127.0.0.1:7003".to_string()).await.unwrap());

        registry.release("127.0.0.1:7002".to_string()).await.unwrap();
        assert!(!registry.contains("127.0.0.1:7002".to_string()).await.unwrap());
        assert!(registry.reserve("127.0.0.1:7003".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_attach_rules() {
        let registry = PeerRegistry::spawn(LOCAL.to_string(), 8);

        // Inbound connection cannot take a slot another dial holds
        assert!(registry.reserve("127.0.0.1:7001".to_string()).await.unwrap());
        let (inbound, _rx1) = attachment("127.0.0.1:7001", 1, false);
        assert!(!registry.attach(inbound).await.unwrap());
        let (outbound, _rx2) = attachment("127.0.0.1:7001", 2, true);
        assert!(registry.attach(outbound).await.unwrap());

        // Duplicate connections are refused
        let (duplicate, _rx3) = attachment("127.0.0.1:7001", 3, false);
        assert!(!registry.attach(duplicate).await.unwrap());

        // A peer claiming our own address is refused
        let (spoofed, _rx4) = attachment(LOCAL, 4, false);
        assert!(!registry.attach(spoofed).await.unwrap());

        assert_eq!(registry.list().await.unwrap(), vec!["127.0.0.1:7001".to_string()]);
        assert_eq!(registry.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_only_by_owner() {
        let registry = PeerRegistry::spawn(LOCAL.to_string(), 8);
        let (first, _rx) = attachment("127.0.0.1:7001", 1, false);
        assert!(registry.attach(first).await.unwrap());

        registry.remove("127.0.0.1:7001".to_string(), 2).await.unwrap();
        registry.release("127.0.0.1:7001".to_string()).await.unwrap();
        assert!(registry.contains("127.0.0.1:7001".to_string()).await.unwrap());

        registry.remove("127.0.0.1:7001".to_string(), 1).await.unwrap();
        assert!(!registry.contains("127.0.0.1:7001".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_connected_and_prunes_closed() {
        let registry = PeerRegistry::spawn(LOCAL.to_string(), 8);
        let (alive, mut alive_rx) = attachment("127.0.0.1:7001", 1, false);
        let (dead, dead_rx) = attachment("127.0.0.1:7002", 2, false);
        assert!(registry.attach(alive).await.unwrap());
        assert!(registry.attach(dead).await.unwrap());
        drop(dead_rx);

        registry.broadcast(Message::Heartbeat).await.unwrap();

        assert_eq!(alive_rx.recv().await, Some(Message::Heartbeat));
        assert_eq!(registry.list().await.unwrap(), vec!["127.0.0.1:7001".to_string()]);
    }
}
