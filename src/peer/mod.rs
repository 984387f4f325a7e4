//! Peer module - Chat mesh state on top of a reactor
//!
//! Provides:
//! - The engine that runs the peer protocol on the reactor thread
//! - A registry of known peers
//! - The [`Node`] façade used by front-ends
//! - The [`ChatListener`] callback surface

mod engine;
mod listener;
mod node;
mod registry;

pub use listener::{ChatEvent, ChatListener};
pub use node::{Node, NodeConfig, NodeError, NodeResult};
pub use registry::{Direction, PeerState};

use std::net::SocketAddr;
use std::time::Duration;

/// Snapshot of a peer for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub name: String,
    /// Address of the connection to the peer
    pub addr: SocketAddr,
    /// Port the peer listens on, 0 until announced
    pub port: u16,
}

/// Liveness probing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Quiet period after a connection is established
    pub delay: Duration,
    /// Time between probes; an unanswered probe is fatal after one interval
    pub interval: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            interval: Duration::from_secs(10),
        }
    }
}
