//! swarmlink-core: an embeddable peer-to-peer networking library.
//!
//! A host process builds a [`NodeConfig`], constructs a [`Node`], registers
//! handlers and connect/disconnect hooks, and runs it. Connected nodes
//! discover each other passively (each handshake carries one round of
//! `getaddr`/`addr` gossip) and exchange application messages by
//! broadcast fan-out to every connected peer.

pub mod codec;
pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod framed;
mod node;
mod peer;

pub use codec::Value;
pub use config::NodeConfig;
pub use endpoint::Endpoint;
pub use error::NodeError;
pub use node::Node;
pub use peer::{Direction, Peer, PeerHandle, PeerState};
