//! Callback surface for the presentation layer
//!
//! The engine calls these from its reactor thread, so implementations must
//! return quickly and must not call back into the node synchronously.

use bytes::Bytes;
use std::net::SocketAddr;
use tokio::sync::mpsc;

use super::PeerInfo;

/// Receives everything the node has to report
pub trait ChatListener: Send + Sync {
    /// A TEXT frame from a connected peer
    fn on_message(&self, sender: &str, text: &str);

    /// A peer finished its handshake and has a name
    fn on_peer_joined(&self, peer: &PeerInfo);

    /// A named peer went away; `timed_out` is set when keepalive purged it
    fn on_peer_left(&self, peer: &PeerInfo, timed_out: bool);

    /// A peer's name changed, either announced by it or forced locally
    fn on_peer_renamed(&self, peer: &PeerInfo, old: &str, new: &str);

    /// A peer forced this node to take another name
    fn on_local_renamed(&self, _old: &str, _new: &str) {}

    /// A peer advertised an endpoint this node is not connected to
    fn on_peer_discovered(&self, host: &str, port: u16, from: &str);

    fn on_connect_failed(&self, _addr: SocketAddr, _reason: &str) {}

    fn on_rendezvous_unreachable(&self);

    /// An opaque VOICE payload
    fn on_voice_frame(&self, _sender: &str, _data: Bytes) {}
}

/// Listener callbacks as values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Message {
        from: String,
        text: String,
    },
    PeerJoined(PeerInfo),
    PeerLeft {
        peer: PeerInfo,
        timed_out: bool,
    },
    PeerRenamed {
        peer: PeerInfo,
        old: String,
        new: String,
    },
    LocalRenamed {
        old: String,
        new: String,
    },
    PeerDiscovered {
        host: String,
        port: u16,
        from: String,
    },
    ConnectFailed {
        addr: SocketAddr,
        reason: String,
    },
    RendezvousUnreachable,
    Voice {
        from: String,
        data: Bytes,
    },
}

/// Forward every callback into a channel; a closed receiver drops events
impl ChatListener for mpsc::UnboundedSender<ChatEvent> {
    fn on_message(&self, sender: &str, text: &str) {
        let _ = self.send(ChatEvent::Message {
            from: sender.to_string(),
            text: text.to_string(),
        });
    }

    fn on_peer_joined(&self, peer: &PeerInfo) {
        let _ = self.send(ChatEvent::PeerJoined(peer.clone()));
    }

    fn on_peer_left(&self, peer: &PeerInfo, timed_out: bool) {
        let _ = self.send(ChatEvent::PeerLeft {
            peer: peer.clone(),
            timed_out,
        });
    }

    fn on_peer_renamed(&self, peer: &PeerInfo, old: &str, new: &str) {
        let _ = self.send(ChatEvent::PeerRenamed {
            peer: peer.clone(),
            old: old.to_string(),
            new: new.to_string(),
        });
    }

    fn on_local_renamed(&self, old: &str, new: &str) {
        let _ = self.send(ChatEvent::LocalRenamed {
            old: old.to_string(),
            new: new.to_string(),
        });
    }

    fn on_peer_discovered(&self, host: &str, port: u16, from: &str) {
        let _ = self.send(ChatEvent::PeerDiscovered {
            host: host.to_string(),
            port,
            from: from.to_string(),
        });
    }

    fn on_connect_failed(&self, addr: SocketAddr, reason: &str) {
        let _ = self.send(ChatEvent::ConnectFailed {
            addr,
            reason: reason.to_string(),
        });
    }

    fn on_rendezvous_unreachable(&self) {
        let _ = self.send(ChatEvent::RendezvousUnreachable);
    }

    fn on_voice_frame(&self, sender: &str, data: Bytes) {
        let _ = self.send(ChatEvent::Voice {
            from: sender.to_string(),
            data,
        });
    }
}
