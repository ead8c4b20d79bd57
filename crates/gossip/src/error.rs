//! Gossip error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GossipError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Malformed message: {0}")]
    Decode(std::io::Error),

    #[error("Protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
}

pub type Result<T> = std::result::Result<T, GossipError>;
