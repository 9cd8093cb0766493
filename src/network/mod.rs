// Network module
//
// Peer-to-peer replication of the ledger:
// - Wire messages and framing
// - Registry of connected peers
// - TCP server, connection handling and gossip

pub mod message;
pub mod registry;
pub mod server;

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

use crate::blockchain::BlockchainError;

pub use message::Message;
pub use registry::{same_listener, PeerRegistry, RegistryCommand, RegistryHandle};
pub use server::{P2PConfig, P2PServer};

/// Errors that can occur in the peer-to-peer layer
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    FramingError(#[from] LinesCodecError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Channel failure for: {0} - Failure: {1}")]
    ChannelFailure(String, String),

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("Connection from {0} loops back to this node")]
    SelfConnection(String),

    #[error("Blockchain error: {0}")]
    BlockchainError(#[from] BlockchainError),
}

pub type Result<T> = std::result::Result<T, NetworkError>;
