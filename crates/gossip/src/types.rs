//! Wire types for the peer protocol
//!
//! Every frame is one borsh-encoded `PeerMessage` in a binary WebSocket frame.
//! A connection carries strictly alternating request/reply pairs.

use crate::error::{GossipError, Result};
use borsh::{BorshDeserialize, BorshSerialize};

/// Bumped whenever the message layout changes; there is no cross-version support
pub const PROTOCOL_VERSION: u32 = 4;

pub const DEFAULT_GOSSIP_PORT: u16 = 9887;

/// Reason sent back when a node receives its own request
pub const SELF_REJECTION: &str = "self connection";

/// Sent with every request
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Header {
    pub version: u32,
    /// Random per-process id, used to spot connections to ourselves
    pub node_id: u64,
    /// Port the sender accepts peers on
    pub listen_port: u16,
}

impl Header {
    pub fn new(node_id: u64, listen_port: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            node_id,
            listen_port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, BorshSerialize, BorshDeserialize)]
pub enum Action {
    /// Ask for the peer's address list
    GetPeers,
    /// Report the sender's last epoch throughput
    RelayTps { tps: f64 },
}

#[derive(Debug, Clone, PartialEq, BorshSerialize, BorshDeserialize)]
pub enum PeerMessage {
    Request { header: Header, action: Action },
    /// Known peers as `ip:port` strings
    Peers(Vec<String>),
    /// Reply to `RelayTps`
    Deadline {
        next_deadline_millis: i64,
        /// Replier's wall clock when the reply was built
        sent_at_millis: i64,
    },
    Rejected(String),
}

impl PeerMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(borsh::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        borsh::from_slice(data).map_err(GossipError::Decode)
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Request { .. } => "request",
            PeerMessage::Peers(_) => "peers",
            PeerMessage::Deadline { .. } => "deadline",
            PeerMessage::Rejected(_) => "rejected",
        }
    }
}
