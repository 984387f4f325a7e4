//! Known peers, keyed by channel

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use super::PeerInfo;
use crate::reactor::ChannelId;

/// Handshake progress of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Dialed, connect not finished
    Pending,
    /// Socket up, no name yet
    Connected,
    /// Handshake done
    NameKnown,
}

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// One remote participant
#[derive(Debug)]
pub struct Peer {
    pub channel: ChannelId,
    pub name: String,
    /// Port the peer accepts connections on
    pub listen_port: u16,
    /// Set once PORT_ACK arrived; dialed peers start with the dialed port
    pub port_known: bool,
    pub remote: SocketAddr,
    pub local: Option<SocketAddr>,
    pub direction: Direction,
    pub state: PeerState,
    pub connected_at: Option<Instant>,
    pub awaiting_pong: bool,
    pub last_ping_at: Option<Instant>,
    /// First NAME, held back until PORT_ACK completes the handshake
    pub pending_name: Option<String>,
}

impl Peer {
    /// A peer this node is dialing
    pub fn dialed(channel: ChannelId, addr: SocketAddr) -> Self {
        Self {
            channel,
            name: String::new(),
            listen_port: addr.port(),
            port_known: false,
            remote: addr,
            local: None,
            direction: Direction::Outbound,
            state: PeerState::Pending,
            connected_at: None,
            awaiting_pong: false,
            last_ping_at: None,
            pending_name: None,
        }
    }

    /// A peer that connected to this node
    pub fn accepted(channel: ChannelId, remote: SocketAddr, local: Option<SocketAddr>, now: Instant) -> Self {
        Self {
            channel,
            name: String::new(),
            listen_port: 0,
            port_known: false,
            remote,
            local,
            direction: Direction::Inbound,
            state: PeerState::Connected,
            connected_at: Some(now),
            awaiting_pong: false,
            last_ping_at: None,
            pending_name: None,
        }
    }

    /// Name for log lines and message attribution
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.remote.to_string()
        } else {
            self.name.clone()
        }
    }

    pub fn is_established(&self) -> bool {
        self.state != PeerState::Pending
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            name: self.display_name(),
            addr: self.remote,
            port: self.listen_port,
        }
    }
}

/// ChannelId to Peer, iterated in insertion order
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<ChannelId, Peer>,
    order: Vec<ChannelId>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer; an existing entry for the channel is replaced
    pub fn insert(&mut self, peer: Peer) {
        let channel = peer.channel;
        if self.peers.insert(channel, peer).is_none() {
            self.order.push(channel);
        }
    }

    pub fn get(&self, channel: ChannelId) -> Option<&Peer> {
        self.peers.get(&channel)
    }

    pub fn get_mut(&mut self, channel: ChannelId) -> Option<&mut Peer> {
        self.peers.get_mut(&channel)
    }

    pub fn remove(&mut self, channel: ChannelId) -> Option<Peer> {
        let peer = self.peers.remove(&channel)?;
        self.order.retain(|c| *c != channel);
        Some(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers in the order they were added
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.order.iter().filter_map(|c| self.peers.get(c))
    }

    /// Channel of the named peer that finished its handshake
    pub fn find_by_name(&self, name: &str) -> Option<ChannelId> {
        self.iter()
            .find(|p| p.state == PeerState::NameKnown && p.name == name)
            .map(|p| p.channel)
    }

    /// Whether a peer other than `except` goes by `name`
    pub fn name_taken(&self, name: &str, except: ChannelId) -> bool {
        self.iter()
            .any(|p| p.channel != except && p.state == PeerState::NameKnown && p.name == name)
    }

    /// A peer other than `except` reachable at (ip, listen port)
    pub fn find_endpoint(&self, ip: IpAddr, port: u16, except: Option<ChannelId>) -> Option<ChannelId> {
        self.iter()
            .find(|p| {
                Some(p.channel) != except
                    && p.remote.ip() == ip
                    && p.listen_port == port
                    && (p.port_known || p.direction == Direction::Outbound)
            })
            .map(|p| p.channel)
    }

    /// Named peers, for display
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.iter()
            .filter(|p| p.state == PeerState::NameKnown)
            .map(Peer::info)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(channel: u64, name: &str, remote: &str) -> Peer {
        let mut peer = Peer::accepted(ChannelId(channel), remote.parse().unwrap(), None, Instant::now());
        peer.name = name.to_string();
        peer.state = PeerState::NameKnown;
        peer
    }

    #[test]
    fn test_insertion_order() {
        let mut registry = PeerRegistry::new();
        registry.insert(named(3, "c", "10.0.0.3:1"));
        registry.insert(named(1, "a", "10.0.0.1:1"));
        registry.insert(named(2, "b", "10.0.0.2:1"));
        registry.remove(ChannelId(1));

        let names: Vec<&str> = registry.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["c", "b"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_name_lookup_skips_unnamed() {
        let mut registry = PeerRegistry::new();
        let mut pending = Peer::dialed(ChannelId(1), "10.0.0.1:9119".parse().unwrap());
        pending.name = "ghost".to_string();
        registry.insert(pending);
        registry.insert(named(2, "alice", "10.0.0.2:5000"));

        assert_eq!(registry.find_by_name("ghost"), None);
        assert_eq!(registry.find_by_name("alice"), Some(ChannelId(2)));
        assert!(registry.name_taken("alice", ChannelId(1)));
        assert!(!registry.name_taken("alice", ChannelId(2)));
    }

    #[test]
    fn test_find_endpoint() {
        let mut registry = PeerRegistry::new();
        registry.insert(Peer::dialed(ChannelId(1), "10.0.0.1:9119".parse().unwrap()));

        // Inbound peers count only once their port is known
        let mut inbound = named(2, "bob", "10.0.0.2:41000");
        inbound.listen_port = 9119;
        registry.insert(inbound);

        let ip1: IpAddr = "10.0.0.1".parse().unwrap();
        let ip2: IpAddr = "10.0.0.2".parse().unwrap();
        assert_eq!(registry.find_endpoint(ip1, 9119, None), Some(ChannelId(1)));
        assert_eq!(registry.find_endpoint(ip1, 9119, Some(ChannelId(1))), None);
        assert_eq!(registry.find_endpoint(ip2, 9119, None), None);

        registry.get_mut(ChannelId(2)).unwrap().port_known = true;
        assert_eq!(registry.find_endpoint(ip2, 9119, None), Some(ChannelId(2)));
    }

    #[test]
    fn test_snapshot_only_named() {
        let mut registry = PeerRegistry::new();
        registry.insert(Peer::dialed(ChannelId(1), "10.0.0.1:9119".parse().unwrap()));
        registry.insert(named(2, "alice", "10.0.0.2:5000"));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name, "alice");
    }
}
