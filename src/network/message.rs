use serde::{Deserialize, Serialize};

use crate::blockchain::Block;

/// Longest frame accepted from a peer, in bytes
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Everything two nodes can say to each other.
///
/// On the wire each message is one line of JSON, e.g.
/// `{"type":"PeerListRequest","data":"127.0.0.1:12315"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    /// Ask for the peer's full chain
    ChainRequest,
    /// A full chain, sent on request or gossiped after a change
    ChainResponse(Vec<Block>),
    /// Ask for known peers; carries the sender's listen address
    PeerListRequest(String),
    /// Listen addresses of the sender's peers
    PeerListResponse(Vec<String>),
    /// Periodic liveness signal
    Heartbeat,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::ChainRequest => "ChainRequest",
            Message::ChainResponse(_) => "ChainResponse",
            Message::PeerListRequest(_) => "PeerListRequest",
            Message::PeerListResponse(_) => "PeerListResponse",
            Message::Heartbeat => "Heartbeat",
        }
    }

    /// Encodes the message as a single frame, without the trailing newline
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_frame(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}
