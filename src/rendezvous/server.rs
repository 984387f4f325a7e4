//! Rendezvous server
//!
//! Runs on its own reactor. Each channel keeps a small buffer so requests
//! split across reads are still understood.

use bytes::{Buf, BytesMut};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use super::{encode_list, observed_ipv4, request, RendezvousEntry, RendezvousResult};
use crate::reactor::{
    self, ChannelId, ChannelInfo, CloseDecision, Flow, Handler, ReactorConfig, ReactorHandle,
    ReactorThread,
};

/// Per-channel request state
struct Caller {
    remote: SocketAddr,
    buf: BytesMut,
}

/// Reactor handler implementing LIST and REGISTER
pub(crate) struct RendezvousHandler {
    entries: Arc<RwLock<Vec<RendezvousEntry>>>,
    callers: HashMap<ChannelId, Caller>,
}

impl RendezvousHandler {
    pub(crate) fn new(entries: Arc<RwLock<Vec<RendezvousEntry>>>) -> Self {
        Self {
            entries,
            callers: HashMap::new(),
        }
    }

    fn register(&self, remote: SocketAddr, port: i32) -> Flow {
        let Ok(port) = u16::try_from(port) else {
            tracing::warn!("Rejecting registration from {} with port {}", remote, port);
            return Flow::CloseChannel;
        };

        match observed_ipv4(&remote) {
            Some(addr) => {
                let entry = RendezvousEntry::new(addr, port);
                tracing::info!("Registered {}", entry);
                self.entries.write().push(entry);
            }
            None => {
                tracing::warn!("Ignoring registration from IPv6 caller {}", remote);
            }
        }
        Flow::Continue
    }
}

impl Handler for RendezvousHandler {
    type Command = ();

    fn on_accepted(&mut self, _ctx: &ReactorHandle<()>, channel: &ChannelInfo) -> Flow {
        tracing::debug!("Rendezvous request from {}", channel.remote);
        self.callers.insert(
            channel.id,
            Caller {
                remote: channel.remote,
                buf: BytesMut::new(),
            },
        );
        Flow::Continue
    }

    fn on_readable(&mut self, ctx: &ReactorHandle<()>, channel: ChannelId, data: &[u8]) -> Flow {
        let Some(mut caller) = self.callers.remove(&channel) else {
            return Flow::CloseChannel;
        };
        caller.buf.extend_from_slice(data);

        let mut flow = Flow::Continue;
        while let Some(&op) = caller.buf.first() {
            match op {
                request::LIST => {
                    caller.buf.advance(1);
                    let response = encode_list(&self.entries.read());
                    if let Err(e) = ctx.send(channel, response) {
                        tracing::warn!("Dropping LIST response for {}: {}", caller.remote, e);
                    }
                }
                request::REGISTER => {
                    if caller.buf.len() < 5 {
                        break;
                    }
                    caller.buf.advance(1);
                    let port = caller.buf.get_i32();
                    flow = self.register(caller.remote, port);
                }
                other => {
                    tracing::warn!("Unknown rendezvous request {:#04x} from {}", other, caller.remote);
                    flow = Flow::CloseChannel;
                }
            }
            if flow != Flow::Continue {
                break;
            }
        }

        self.callers.insert(channel, caller);
        flow
    }

    fn on_closed(&mut self, _ctx: &ReactorHandle<()>, channel: ChannelId) -> CloseDecision {
        if let Some(caller) = self.callers.remove(&channel) {
            if !caller.buf.is_empty() {
                tracing::debug!(
                    "{} closed with {} bytes of an unfinished request",
                    caller.remote,
                    caller.buf.len()
                );
            }
        }
        CloseDecision::Proceed
    }
}

/// A running rendezvous server
pub struct RendezvousServer {
    reactor: ReactorThread<()>,
    local_addr: SocketAddr,
    entries: Arc<RwLock<Vec<RendezvousEntry>>>,
}

impl RendezvousServer {
    /// Bind and start serving on a dedicated reactor thread
    pub fn start(bind_addr: SocketAddr, config: ReactorConfig) -> RendezvousResult<Self> {
        let listener = reactor::bind(bind_addr)?;
        let local_addr = listener
            .local_addr()
            .map_err(reactor::ReactorError::Listener)?;

        let entries = Arc::new(RwLock::new(Vec::new()));
        let handler = RendezvousHandler::new(entries.clone());
        let reactor = reactor::spawn("rendezvous", config, Some(listener), handler)?;

        tracing::info!("Rendezvous server listening on {}", local_addr);

        Ok(Self {
            reactor,
            local_addr,
            entries,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Snapshot of every registration, oldest first
    pub fn entries(&self) -> Vec<RendezvousEntry> {
        self.entries.read().clone()
    }

    pub fn shutdown(&self) {
        self.reactor.handle().shutdown();
    }

    /// Wait for the server thread to exit
    pub fn join(self) -> RendezvousResult<()> {
        self.reactor.join()?;
        Ok(())
    }
}
