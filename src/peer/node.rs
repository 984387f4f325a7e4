//! Chat node
//!
//! Owns the engine's reactor thread and exposes the operations a front-end
//! needs. Every method is safe to call from any thread; engine work is posted
//! to the reactor and happens asynchronously.

use bytes::Bytes;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::engine::{Command, EngineView, PeerEngine, UNNAMED};
use super::{ChatListener, KeepaliveConfig, PeerInfo};
use crate::protocol::{self, CodecError, Frame, DEFAULT_PEER_PORT};
use crate::reactor::{self, ReactorConfig, ReactorError, ReactorHandle, ReactorThread};
use crate::rendezvous::{self, RendezvousEntry, RendezvousResult};

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Reactor error: {0}")]
    Reactor(#[from] ReactorError),

    #[error("Could not resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("Refusing to send: {0}")]
    Frame(#[from] CodecError),

    #[error("Node is not running")]
    Stopped,
}

pub type NodeResult<T> = Result<T, NodeError>;

/// Settings for [`Node::start`]
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Initial nickname
    pub name: String,
    /// Listener address; port 0 picks a free one
    pub bind_addr: SocketAddr,
    pub keepalive: KeepaliveConfig,
    pub reactor: ReactorConfig,
    /// Bound on each rendezvous round trip
    pub rendezvous_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: UNNAMED.to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PEER_PORT)),
            keepalive: KeepaliveConfig::default(),
            reactor: ReactorConfig::default(),
            rendezvous_timeout: Duration::from_secs(5),
        }
    }
}

/// Resolve a hostname to a socket address
async fn resolve_host(host: &str, port: u16) -> io::Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;

    addrs.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

/// How often the engine checks keepalive deadlines
fn tick_period(keepalive: &KeepaliveConfig) -> Duration {
    (keepalive.delay.min(keepalive.interval) / 4).max(Duration::from_millis(10))
}

/// A running chat node
pub struct Node {
    reactor: ReactorThread<Command>,
    handle: ReactorHandle<Command>,
    local_addr: SocketAddr,
    view: EngineView,
    listener: Arc<dyn ChatListener>,
    rendezvous_timeout: Duration,
}

impl Node {
    /// Bind the peer listener and start the engine thread
    pub fn start(config: NodeConfig, listener: Arc<dyn ChatListener>) -> NodeResult<Self> {
        let socket = reactor::bind(config.bind_addr)?;
        let local_addr = socket.local_addr().map_err(ReactorError::Listener)?;

        let engine = PeerEngine::new(
            &config.name,
            local_addr.port(),
            config.keepalive,
            listener.clone(),
        );
        let view = engine.view();

        let mut reactor_config = config.reactor;
        reactor_config
            .tick_interval
            .get_or_insert_with(|| tick_period(&config.keepalive));

        let reactor = reactor::spawn("peer-node", reactor_config, Some(socket), engine)?;
        let handle = reactor.handle();

        tracing::info!("Node '{}' listening on {}", view.local_name.read(), local_addr);

        Ok(Self {
            reactor,
            handle,
            local_addr,
            view,
            listener,
            rendezvous_timeout: config.rendezvous_timeout,
        })
    }

    fn post(&self, command: Command) -> NodeResult<()> {
        self.handle.post(command).map_err(|_| NodeError::Stopped)
    }

    /// Address of the peer listener
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_name(&self) -> String {
        self.view.local_name.read().clone()
    }

    /// Peers that finished their handshake, in connection order
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.view.peers.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Dial a peer; the outcome arrives through the listener
    pub async fn connect_to(&self, host: &str, port: u16) -> NodeResult<()> {
        let addr = resolve_host(host, port)
            .await
            .map_err(|source| NodeError::Resolve {
                host: host.to_string(),
                source,
            })?;
        self.post(Command::Connect(addr))
    }

    /// Close every connection to a host
    pub fn disconnect(&self, ip: IpAddr) -> NodeResult<()> {
        self.post(Command::Disconnect(ip))
    }

    /// Send a chat line to everyone, or to one peer by name
    pub fn send_text(&self, text: &str, target: Option<&str>) -> NodeResult<()> {
        if text.is_empty() {
            return Ok(());
        }
        protocol::check_string(text)?;
        self.post(Command::SendText {
            text: text.to_string(),
            target: target.map(str::to_string),
        })
    }

    pub fn set_local_name(&self, name: &str) -> NodeResult<()> {
        protocol::check_string(name)?;
        self.post(Command::SetName(name.to_string()))
    }

    pub fn kick(&self, name: &str) -> NodeResult<()> {
        self.post(Command::Kick(name.to_string()))
    }

    /// Broadcast an opaque VOICE payload
    pub fn send_voice_frame(&self, data: impl Into<Bytes>) -> NodeResult<()> {
        let data = data.into();
        if data.is_empty() {
            return Ok(());
        }
        Frame::Voice(data.clone()).validate()?;
        self.post(Command::SendVoice(data))
    }

    /// Register this node's listener port with a rendezvous server
    ///
    /// Returns false, after notifying the listener, if the server could not
    /// be reached.
    pub async fn register_self_with_rendezvous(&self, host: &str, port: u16) -> bool {
        match self.try_register(host, port).await {
            Ok(()) => {
                tracing::info!("Registered with rendezvous {}:{}", host, port);
                true
            }
            Err(e) => {
                tracing::warn!("Rendezvous {}:{} failed: {}", host, port, e);
                self.listener.on_rendezvous_unreachable();
                false
            }
        }
    }

    /// Ask a rendezvous server for peers, leaving out this node
    ///
    /// Returns an empty list, after notifying the listener, if the server
    /// could not be reached.
    pub async fn list_peers_from_rendezvous(&self, host: &str, port: u16) -> Vec<RendezvousEntry> {
        match self.try_list(host, port).await {
            Ok(entries) => entries.into_iter().filter(|e| !self.is_self(e)).collect(),
            Err(e) => {
                tracing::warn!("Rendezvous {}:{} failed: {}", host, port, e);
                self.listener.on_rendezvous_unreachable();
                Vec::new()
            }
        }
    }

    async fn try_register(&self, host: &str, port: u16) -> RendezvousResult<()> {
        let server = resolve_host(host, port).await?;
        rendezvous::register(server, self.local_addr.port(), self.rendezvous_timeout).await
    }

    async fn try_list(&self, host: &str, port: u16) -> RendezvousResult<Vec<RendezvousEntry>> {
        let server = resolve_host(host, port).await?;
        rendezvous::list(server, self.rendezvous_timeout).await
    }

    fn is_self(&self, entry: &RendezvousEntry) -> bool {
        if entry.port != self.local_addr.port() {
            return false;
        }
        let ip = IpAddr::V4(entry.addr);
        ip.is_loopback()
            || ip.is_unspecified()
            || ip == self.local_addr.ip()
            || self.view.local_ips.read().contains(&ip)
    }

    /// Ask the engine thread to close every connection and stop
    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    /// Wait for the engine thread to exit
    pub fn join(self) -> NodeResult<()> {
        self.reactor.join()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ChatEvent;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    fn loopback_config(name: &str) -> NodeConfig {
        NodeConfig {
            name: name.to_string(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            rendezvous_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_tick_period() {
        let keepalive = KeepaliveConfig {
            delay: Duration::from_secs(8),
            interval: Duration::from_secs(4),
        };
        assert_eq!(tick_period(&keepalive), Duration::from_secs(1));

        let tiny = KeepaliveConfig {
            delay: Duration::from_millis(1),
            interval: Duration::from_millis(1),
        };
        assert_eq!(tick_period(&tiny), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let (tx, _rx) = mpsc::unbounded_channel::<ChatEvent>();
        let node = Node::start(loopback_config("solo"), Arc::new(tx)).unwrap();

        assert_ne!(node.local_addr().port(), 0);
        assert_eq!(node.local_name(), "solo");
        assert!(node.peers().is_empty());

        node.shutdown();
        node.join().unwrap();
    }

    #[tokio::test]
    async fn test_commands_after_shutdown_fail() {
        let (tx, _rx) = mpsc::unbounded_channel::<ChatEvent>();
        let node = Node::start(loopback_config("solo"), Arc::new(tx)).unwrap();
        node.shutdown();
        while node.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(matches!(node.send_text("hi", None), Err(NodeError::Stopped)));
        // Empty text never reaches the engine
        assert!(node.send_text("", None).is_ok());
    }

    #[tokio::test]
    async fn test_oversized_payloads_refused() {
        let (tx, mut rx) = mpsc::unbounded_channel::<ChatEvent>();
        let node = Node::start(loopback_config("solo"), Arc::new(tx)).unwrap();

        let line = "a".repeat(protocol::MAX_STRING_UNITS + 1);
        assert!(matches!(
            node.send_text(&line, None),
            Err(NodeError::Frame(CodecError::TooLarge { .. }))
        ));
        assert!(matches!(node.set_local_name(&line), Err(NodeError::Frame(_))));
        assert!(matches!(
            node.send_voice_frame(vec![0u8; protocol::MAX_VOICE_BYTES + 1]),
            Err(NodeError::Frame(_))
        ));

        // Payloads at the limit still go out
        assert!(node.send_text(&"a".repeat(protocol::MAX_STRING_UNITS), None).is_ok());
        assert!(node.send_voice_frame(vec![0u8; protocol::MAX_VOICE_BYTES]).is_ok());
        assert_eq!(node.local_name(), "solo");

        node.shutdown();
        node.join().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rendezvous_unreachable() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let node = Node::start(loopback_config("solo"), Arc::new(tx)).unwrap();
        let port = unused_port();

        assert!(!node.register_self_with_rendezvous("127.0.0.1", port).await);
        assert_eq!(rx.recv().await, Some(ChatEvent::RendezvousUnreachable));

        assert!(node.list_peers_from_rendezvous("127.0.0.1", port).await.is_empty());
        assert_eq!(rx.recv().await, Some(ChatEvent::RendezvousUnreachable));
        assert!(rx.try_recv().is_err());

        node.shutdown();
        node.join().unwrap();
    }

    #[tokio::test]
    async fn test_listing_leaves_out_self() {
        let server = rendezvous::RendezvousServer::start(
            "127.0.0.1:0".parse().unwrap(),
            ReactorConfig::default(),
        )
        .unwrap();
        let rv = server.local_addr();

        let (tx, _rx) = mpsc::unbounded_channel::<ChatEvent>();
        let node = Node::start(loopback_config("solo"), Arc::new(tx)).unwrap();

        assert!(node.register_self_with_rendezvous("127.0.0.1", rv.port()).await);
        rendezvous::register(rv, 4242, Duration::from_secs(2)).await.unwrap();
        for _ in 0..200 {
            if server.entries().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let listed = node.list_peers_from_rendezvous("127.0.0.1", rv.port()).await;
        assert_eq!(listed, vec![RendezvousEntry::new(Ipv4Addr::LOCALHOST, 4242)]);

        node.shutdown();
        node.join().unwrap();
        server.shutdown();
        server.join().unwrap();
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let (tx, _rx) = mpsc::unbounded_channel::<ChatEvent>();
        let node = Node::start(loopback_config("solo"), Arc::new(tx)).unwrap();

        let result = node.connect_to("no-such-host.invalid", 9119).await;
        assert!(matches!(result, Err(NodeError::Resolve { .. })));

        node.shutdown();
        node.join().unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let node = Node::start(loopback_config("solo"), Arc::new(tx)).unwrap();
        let port = unused_port();

        node.connect_to("127.0.0.1", port).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert!(matches!(
            event,
            Some(ChatEvent::ConnectFailed { addr, .. }) if addr.port() == port
        ));

        node.shutdown();
        node.join().unwrap();
    }
}
