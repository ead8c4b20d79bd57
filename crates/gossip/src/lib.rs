//! Storm Gossip - peer discovery for a swarm of publishers
//!
//! Nodes find each other by flooding `GetPeers` requests over persistent
//! WebSocket connections, and tell each other how fast they published with
//! `RelayTps`, which doubles as a clock-drift probe.

pub mod error;
pub mod node;
pub mod peer_set;
pub mod types;

pub use error::GossipError;
pub use node::{GossipConfig, GossipHandle, GossipNode};
pub use peer_set::PeerSet;
pub use types::{Action, Header, PeerMessage, DEFAULT_GOSSIP_PORT, PROTOCOL_VERSION};
