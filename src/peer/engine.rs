//! Peer protocol engine
//!
//! Runs as the reactor [`Handler`] of a node. It owns the peer registry and
//! one frame decoder per channel, and is only ever touched from the reactor
//! thread. The node reaches it through posted [`Command`]s.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::io;
use std::mem;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use super::registry::{Direction, Peer, PeerRegistry, PeerState};
use super::{ChatListener, KeepaliveConfig, PeerInfo};
use crate::protocol::{Frame, FrameDecoder};
use crate::reactor::{
    ChannelId, ChannelInfo, CloseDecision, Flow, Handler, ReactorError, ReactorHandle,
};

/// Name used for peers that announce an empty one
pub const UNNAMED: &str = "unnamed";

/// Requests from the node façade
#[derive(Debug)]
pub(crate) enum Command {
    Connect(SocketAddr),
    /// Close every connection to a host
    Disconnect(IpAddr),
    SendText { text: String, target: Option<String> },
    SendVoice(Bytes),
    SetName(String),
    Kick(String),
}

/// Engine state readable from other threads
#[derive(Debug, Clone, Default)]
pub(crate) struct EngineView {
    pub(crate) local_name: Arc<RwLock<String>>,
    pub(crate) peers: Arc<RwLock<Vec<PeerInfo>>>,
    pub(crate) local_ips: Arc<RwLock<HashSet<IpAddr>>>,
}

pub(crate) struct PeerEngine {
    local_name: String,
    listen_port: u16,
    keepalive: KeepaliveConfig,
    peers: PeerRegistry,
    decoders: HashMap<ChannelId, FrameDecoder>,
    /// Addresses this host was reached on
    local_ips: HashSet<IpAddr>,
    listener: Arc<dyn ChatListener>,
    view: EngineView,
}

fn normalize_name(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        UNNAMED.to_string()
    } else {
        name.to_string()
    }
}

fn send_frame(ctx: &ReactorHandle<Command>, channel: ChannelId, frame: &Frame) {
    match ctx.send(channel, frame.to_bytes()) {
        Ok(()) => tracing::trace!("Queued {} for {}", frame.kind(), channel),
        Err(e) => tracing::warn!("Dropping {} frame: {}", frame.kind(), e),
    }
}

impl PeerEngine {
    pub(crate) fn new(
        local_name: &str,
        listen_port: u16,
        keepalive: KeepaliveConfig,
        listener: Arc<dyn ChatListener>,
    ) -> Self {
        let local_name = normalize_name(local_name);
        let view = EngineView::default();
        *view.local_name.write() = local_name.clone();

        Self {
            local_name,
            listen_port,
            keepalive,
            peers: PeerRegistry::new(),
            decoders: HashMap::new(),
            local_ips: HashSet::new(),
            listener,
            view,
        }
    }

    pub(crate) fn view(&self) -> EngineView {
        self.view.clone()
    }

    fn publish(&self) {
        *self.view.peers.write() = self.peers.snapshot();
    }

    fn is_local_ip(&self, ip: IpAddr) -> bool {
        ip.is_loopback() || ip.is_unspecified() || self.local_ips.contains(&ip)
    }

    /// Whether (ip, port) is this node's own listener
    fn is_self_addr(&self, ip: IpAddr, port: u16) -> bool {
        port == self.listen_port && self.is_local_ip(ip)
    }

    fn is_self(&self, host: &str, port: u16) -> bool {
        if host.eq_ignore_ascii_case("localhost") {
            return port == self.listen_port;
        }
        host.parse::<IpAddr>()
            .map(|ip| self.is_self_addr(ip, port))
            .unwrap_or(false)
    }

    fn note_local(&mut self, local: Option<SocketAddr>) {
        if let Some(addr) = local {
            if self.local_ips.insert(addr.ip()) {
                self.view.local_ips.write().insert(addr.ip());
            }
        }
    }

    /// NAME and PORT_ACK, plus known peers when `gossip` is set
    fn start_handshake(&self, ctx: &ReactorHandle<Command>, channel: ChannelId, gossip: bool) {
        send_frame(ctx, channel, &Frame::Name(self.local_name.clone()));
        send_frame(ctx, channel, &Frame::PortAck(self.listen_port));

        if !gossip {
            return;
        }
        for peer in self.peers.iter() {
            if peer.channel == channel
                || peer.state != PeerState::NameKnown
                || !peer.port_known
                || peer.listen_port == 0
            {
                continue;
            }
            let advert = Frame::PeerAdvert {
                host: peer.remote.ip().to_string(),
                port: peer.listen_port,
            };
            send_frame(ctx, channel, &advert);
        }
    }

    /// Send to every established peer, or to the named one
    ///
    /// Returns how many peers the frame was queued for.
    fn deliver(&self, ctx: &ReactorHandle<Command>, frame: &Frame, target: Option<&str>) -> usize {
        let channels: Vec<ChannelId> = match target {
            None => self
                .peers
                .iter()
                .filter(|p| p.is_established())
                .map(|p| p.channel)
                .collect(),
            Some(name) => match self.peers.find_by_name(name) {
                Some(channel) => vec![channel],
                None => {
                    tracing::warn!("No peer named '{}', dropping {}", name, frame.kind());
                    return 0;
                }
            },
        };

        let bytes = frame.to_bytes();
        let mut sent = 0;
        for channel in channels {
            match ctx.send(channel, bytes.clone()) {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!("Dropping {} frame: {}", frame.kind(), e),
            }
        }
        sent
    }

    fn connect(&mut self, ctx: &ReactorHandle<Command>, addr: SocketAddr) {
        if self.is_self_addr(addr.ip(), addr.port()) {
            tracing::info!("Not connecting to {}: that is this node", addr);
            return;
        }
        if let Some(channel) = self.peers.find_endpoint(addr.ip(), addr.port(), None) {
            tracing::info!("Already connected to {} on {}", addr, channel);
            return;
        }

        match ctx.dial(addr) {
            Ok(channel) => {
                tracing::debug!("Dialing peer {} on {}", addr, channel);
                self.peers.insert(Peer::dialed(channel, addr));
            }
            Err(e) => {
                tracing::warn!("Cannot dial {}: {}", addr, e);
                self.listener.on_connect_failed(addr, &e.to_string());
            }
        }
    }

    fn disconnect(&self, ctx: &ReactorHandle<Command>, ip: IpAddr) {
        let channels: Vec<ChannelId> = self
            .peers
            .iter()
            .filter(|p| p.remote.ip() == ip)
            .map(|p| p.channel)
            .collect();
        if channels.is_empty() {
            tracing::info!("No connection to {}", ip);
        }
        for channel in channels {
            ctx.close(channel);
        }
    }

    fn kick(&mut self, ctx: &ReactorHandle<Command>, name: &str) {
        let Some(channel) = self.peers.find_by_name(name) else {
            tracing::warn!("No peer named '{}' to kick", name);
            return;
        };
        let peer = self.peers.remove(channel);
        ctx.close(channel);
        self.publish();
        if let Some(peer) = peer {
            tracing::info!("Kicked {}", peer.name);
            self.listener.on_peer_left(&peer.info(), false);
        }
    }

    fn set_local_name(&mut self, ctx: &ReactorHandle<Command>, name: &str) {
        let name = name.trim();
        if name.is_empty() || name == self.local_name {
            return;
        }
        tracing::info!("Local name changed from '{}' to '{}'", self.local_name, name);
        self.local_name = name.to_string();
        *self.view.local_name.write() = self.local_name.clone();
        self.deliver(ctx, &Frame::Name(self.local_name.clone()), None);
    }

    /// Probe peers and purge the ones that never answered
    pub(crate) fn sweep(&mut self, ctx: &ReactorHandle<Command>, now: Instant) {
        let mut probe = Vec::new();
        let mut purge = Vec::new();

        for peer in self.peers.iter() {
            let Some(since) = peer.connected_at else {
                continue;
            };
            if now.saturating_duration_since(since) < self.keepalive.delay {
                continue;
            }
            if let Some(last) = peer.last_ping_at {
                if now.saturating_duration_since(last) < self.keepalive.interval {
                    continue;
                }
            }
            if peer.awaiting_pong {
                purge.push(peer.channel);
            } else {
                probe.push(peer.channel);
            }
        }

        for channel in probe {
            if let Some(peer) = self.peers.get_mut(channel) {
                peer.awaiting_pong = true;
                peer.last_ping_at = Some(now);
            }
            send_frame(ctx, channel, &Frame::Ping);
        }
        for channel in purge {
            self.purge(ctx, channel);
        }
    }

    fn purge(&mut self, ctx: &ReactorHandle<Command>, channel: ChannelId) {
        let peer = self.peers.remove(channel);
        ctx.close(channel);
        self.publish();
        if let Some(peer) = peer {
            tracing::warn!("{} timed out", peer.display_name());
            if peer.state == PeerState::NameKnown {
                self.listener.on_peer_left(&peer.info(), true);
            }
        }
    }

    fn handle_frame(&mut self, ctx: &ReactorHandle<Command>, channel: ChannelId, frame: Frame) {
        let Some(peer) = self.peers.get_mut(channel) else {
            tracing::warn!("Dropping {} from unknown sender on {}", frame.kind(), channel);
            return;
        };
        tracing::debug!("Received {} from {}", frame.kind(), peer.display_name());

        match frame {
            Frame::Text(text) => {
                let sender = peer.display_name();
                self.listener.on_message(&sender, &text);
            }
            Frame::Voice(data) => {
                let sender = peer.display_name();
                self.listener.on_voice_frame(&sender, data);
            }
            Frame::Name(name) => {
                let name = normalize_name(&name);
                if peer.state != PeerState::NameKnown && !peer.port_known {
                    peer.pending_name = Some(name);
                } else {
                    self.apply_name(ctx, channel, name);
                }
            }
            Frame::PortAck(port) => {
                peer.listen_port = port;
                peer.port_known = true;
                self.finish_handshake(ctx, channel);
            }
            Frame::PeerAdvert { host, port } => {
                let from = peer.display_name();
                self.handle_advert(&host, port, &from);
            }
            Frame::Ping => send_frame(ctx, channel, &Frame::Pong),
            Frame::Pong => peer.awaiting_pong = false,
            Frame::NameConflict(forced) => self.adopt_forced_name(ctx, channel, &forced),
        }
    }

    /// Record a peer's name, disambiguating it against everyone else
    fn apply_name(&mut self, ctx: &ReactorHandle<Command>, channel: ChannelId, announced: String) {
        let Some(peer) = self.peers.get(channel) else {
            return;
        };
        // A clash with the local name in a fresh handshake is settled by the accepting side
        let check_local = peer.direction == Direction::Inbound || peer.state == PeerState::NameKnown;
        let resolved = self.unique_name(&announced, channel, check_local);

        if resolved != announced {
            tracing::info!(
                "Name '{}' from {} is taken, renaming to '{}'",
                announced,
                peer.remote,
                resolved
            );
            send_frame(ctx, channel, &Frame::NameConflict(resolved.clone()));
        }

        let Some(peer) = self.peers.get_mut(channel) else {
            return;
        };
        let joined = peer.state != PeerState::NameKnown;
        let old = mem::replace(&mut peer.name, resolved.clone());
        peer.state = PeerState::NameKnown;
        let info = peer.info();
        self.publish();

        if joined {
            tracing::info!("{} joined from {}", resolved, info.addr);
            self.listener.on_peer_joined(&info);
            if resolved != announced {
                self.listener.on_peer_renamed(&info, &announced, &resolved);
            }
        } else if old != resolved {
            tracing::info!("{} is now known as {}", old, resolved);
            self.listener.on_peer_renamed(&info, &old, &resolved);
        }
    }

    fn unique_name(&self, name: &str, except: ChannelId, check_local: bool) -> String {
        let mut candidate = name.to_string();
        while (check_local && candidate == self.local_name) || self.peers.name_taken(&candidate, except) {
            candidate.push('_');
        }
        candidate
    }

    /// PORT_ACK arrived: settle duplicates, then apply the held-back name
    fn finish_handshake(&mut self, ctx: &ReactorHandle<Command>, channel: ChannelId) {
        let Some(peer) = self.peers.get(channel) else {
            return;
        };
        tracing::debug!("{} listens on port {}", peer.display_name(), peer.listen_port);

        if self.is_self_addr(peer.remote.ip(), peer.listen_port) {
            tracing::info!("Connection {} leads back to this node, closing", channel);
            self.peers.remove(channel);
            ctx.close(channel);
            return;
        }

        if let Some(other) = self.duplicate_of(channel) {
            if !self.reconcile(ctx, channel, other) {
                return;
            }
        }

        let pending = self.peers.get_mut(channel).and_then(|p| p.pending_name.take());
        if let Some(name) = pending {
            self.apply_name(ctx, channel, name);
        } else {
            self.publish();
        }
    }

    /// Another live entry for the same remote endpoint
    fn duplicate_of(&self, channel: ChannelId) -> Option<ChannelId> {
        let peer = self.peers.get(channel)?;
        if peer.listen_port == 0 {
            return None;
        }
        self.peers
            .iter()
            .find(|p| {
                p.channel != channel
                    && p.is_established()
                    && p.port_known
                    && p.remote.ip() == peer.remote.ip()
                    && p.listen_port == peer.listen_port
            })
            .map(|p| p.channel)
    }

    /// Keep one of two connections to the same peer; returns whether `channel` survives
    ///
    /// Crossed connections: both ends run the same comparison, so both close
    /// the same connection, the one dialed by the node whose (address, listen
    /// port) sorts lower is kept. Two connections in the same direction keep
    /// the newer one.
    fn reconcile(&mut self, ctx: &ReactorHandle<Command>, channel: ChannelId, other: ChannelId) -> bool {
        let (Some(this), Some(that)) = (self.peers.get(channel), self.peers.get(other)) else {
            return true;
        };

        let keep_this = if this.direction == that.direction {
            // A peer that dialed again replaced its old connection
            channel > other
        } else {
            let local_ip = this.local.or(that.local).map(|a| a.ip());
            let ours = (local_ip, self.listen_port);
            let theirs = (Some(this.remote.ip()), this.listen_port);
            let keep_outbound = ours < theirs;
            (this.direction == Direction::Outbound) == keep_outbound
        };
        let (keep, drop) = if keep_this { (channel, other) } else { (other, channel) };

        tracing::info!(
            "Duplicate connection to {}:{}, keeping {} and closing {}",
            this.remote.ip(),
            this.listen_port,
            keep,
            drop
        );

        if let Some(dropped) = self.peers.remove(drop) {
            self.inherit(keep, dropped);
        }
        ctx.close(drop);
        self.publish();
        keep_this
    }

    /// Move the identity of a dropped duplicate onto the surviving entry
    fn inherit(&mut self, keep: ChannelId, dropped: Peer) -> bool {
        if dropped.state != PeerState::NameKnown {
            return false;
        }
        let Some(kept) = self.peers.get_mut(keep) else {
            return false;
        };
        if kept.state != PeerState::NameKnown {
            kept.name = dropped.name;
            kept.state = PeerState::NameKnown;
        }
        true
    }

    /// An established entry for the same endpoint as `peer`
    fn twin_of(&self, peer: &Peer) -> Option<ChannelId> {
        if peer.listen_port == 0 {
            return None;
        }
        self.peers
            .iter()
            .find(|p| {
                p.channel != peer.channel
                    && p.is_established()
                    && p.remote.ip() == peer.remote.ip()
                    && p.listen_port == peer.listen_port
            })
            .map(|p| p.channel)
    }

    fn handle_advert(&self, host: &str, port: u16, from: &str) {
        if self.is_self(host, port) {
            tracing::debug!("{} advertised this node", from);
            return;
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            if self.peers.find_endpoint(ip, port, None).is_some() {
                tracing::debug!("{} advertised {}:{}, already connected", from, host, port);
                return;
            }
        }
        tracing::info!("{} advertised peer {}:{}", from, host, port);
        self.listener.on_peer_discovered(host, port, from);
    }

    /// A peer told this node to use another name
    fn adopt_forced_name(&mut self, ctx: &ReactorHandle<Command>, channel: ChannelId, forced: &str) {
        let forced = normalize_name(forced);
        if forced == self.local_name {
            return;
        }

        // The forced name may belong to a peer the sender does not know about
        let mut resolved = forced.clone();
        while self.peers.find_by_name(&resolved).is_some() {
            resolved.push('_');
        }
        if resolved != forced {
            tracing::warn!("Forced name '{}' is taken here, using '{}'", forced, resolved);
        }

        let old = mem::replace(&mut self.local_name, resolved.clone());
        *self.view.local_name.write() = resolved.clone();
        tracing::info!("Peer on {} renamed this node from '{}' to '{}'", channel, old, resolved);
        self.listener.on_local_renamed(&old, &resolved);

        let tell_sender = resolved != forced;
        let frame = Frame::Name(resolved);
        for peer in self.peers.iter() {
            if (tell_sender || peer.channel != channel) && peer.is_established() {
                send_frame(ctx, peer.channel, &frame);
            }
        }
    }
}

impl Handler for PeerEngine {
    type Command = Command;

    fn on_accepted(&mut self, ctx: &ReactorHandle<Command>, channel: &ChannelInfo) -> Flow {
        tracing::info!(
            "Peer connected from {} ({} already known)",
            channel.remote,
            self.peers.len()
        );
        self.note_local(channel.local);
        self.peers.insert(Peer::accepted(
            channel.id,
            channel.remote,
            channel.local,
            Instant::now(),
        ));
        self.decoders.insert(channel.id, FrameDecoder::new());
        self.start_handshake(ctx, channel.id, true);
        Flow::Continue
    }

    fn on_connected(&mut self, ctx: &ReactorHandle<Command>, channel: &ChannelInfo) -> Flow {
        self.note_local(channel.local);
        let Some(peer) = self.peers.get_mut(channel.id) else {
            tracing::debug!("Dial {} was abandoned before it connected", channel.id);
            return Flow::CloseChannel;
        };
        peer.state = PeerState::Connected;
        peer.local = channel.local;
        peer.connected_at = Some(Instant::now());

        tracing::info!("Connected to peer {}", channel.remote);
        self.decoders.insert(channel.id, FrameDecoder::new());
        self.start_handshake(ctx, channel.id, false);
        Flow::Continue
    }

    fn on_connect_failed(
        &mut self,
        _ctx: &ReactorHandle<Command>,
        channel: ChannelId,
        addr: SocketAddr,
        error: &io::Error,
    ) {
        self.peers.remove(channel);
        tracing::warn!("Could not connect to {}: {}", addr, error);
        self.listener.on_connect_failed(addr, &error.to_string());
    }

    fn on_readable(&mut self, ctx: &ReactorHandle<Command>, channel: ChannelId, data: &[u8]) -> Flow {
        let Some(decoder) = self.decoders.get_mut(&channel) else {
            tracing::warn!("Data on untracked channel {}", channel);
            return Flow::CloseChannel;
        };
        decoder.extend(data);

        let mut frames = Vec::new();
        let mut failure = None;
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        for frame in frames {
            self.handle_frame(ctx, channel, frame);
        }

        match failure {
            Some(e) => {
                let from = self
                    .peers
                    .get(channel)
                    .map(Peer::display_name)
                    .unwrap_or_else(|| channel.to_string());
                tracing::warn!("Malformed data from {}: {}, disconnecting", from, e);
                Flow::CloseChannel
            }
            None => Flow::Continue,
        }
    }

    fn on_closed(&mut self, _ctx: &ReactorHandle<Command>, channel: ChannelId) -> CloseDecision {
        if let Some(decoder) = self.decoders.remove(&channel) {
            if let Err(e) = decoder.finish() {
                tracing::debug!("{} closed mid-frame: {}", channel, e);
            }
        }

        let Some(peer) = self.peers.remove(channel) else {
            return CloseDecision::Proceed;
        };

        if peer.state != PeerState::NameKnown {
            tracing::debug!("{} closed before the handshake finished", peer.display_name());
            self.publish();
            return CloseDecision::Proceed;
        }

        let info = peer.info();
        match self.twin_of(&peer) {
            Some(twin) => {
                tracing::debug!("{} closed, {} still connected on {}", channel, info.name, twin);
                self.inherit(twin, peer);
                self.publish();
            }
            None => {
                self.publish();
                tracing::info!("{} left", info.name);
                self.listener.on_peer_left(&info, false);
            }
        }
        CloseDecision::Proceed
    }

    fn on_command(&mut self, ctx: &ReactorHandle<Command>, command: Command) {
        match command {
            Command::Connect(addr) => self.connect(ctx, addr),
            Command::Disconnect(ip) => self.disconnect(ctx, ip),
            Command::SendText { text, target } => {
                self.deliver(ctx, &Frame::Text(text), target.as_deref());
            }
            Command::SendVoice(data) => {
                self.deliver(ctx, &Frame::Voice(data), None);
            }
            Command::SetName(name) => self.set_local_name(ctx, &name),
            Command::Kick(name) => self.kick(ctx, &name),
        }
    }

    fn on_tick(&mut self, ctx: &ReactorHandle<Command>) {
        self.sweep(ctx, Instant::now());
    }

    fn on_fatal(&mut self, error: &ReactorError) {
        tracing::error!("Peer reactor stopped: {}", error);
    }
}
