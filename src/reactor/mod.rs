//! Reactor module - Single-threaded multiplexed TCP I/O
//!
//! Provides:
//! - An event loop that owns one optional listener plus any number of
//!   accepted and dialed channels, all on one dedicated thread
//! - Per-channel outbound queues with partial-write resumption
//! - A thread-safe handle for sending, closing, dialing and posting commands
//!
//! The owner plugs in through the [`Handler`] trait. All callbacks run on the
//! reactor thread, so handler state needs no locking.

mod event_loop;
mod handle;

pub use handle::ReactorHandle;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

use event_loop::EventLoop;
use handle::Shared;

/// Reactor errors
#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("Bind to {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Listener failed: {0}")]
    Listener(#[source] io::Error),

    #[error("Runtime error: {0}")]
    Runtime(#[source] io::Error),

    #[error("Handler aborted the reactor on channel {0}")]
    Aborted(ChannelId),

    #[error("Reactor stopped")]
    Stopped,

    #[error("Reactor thread panicked")]
    Panicked,
}

pub type ReactorResult<T> = Result<T, ReactorError>;

/// Errors returned by [`ReactorHandle::send`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Outbound queue for {channel} is full ({queued} of {limit} bytes)")]
    Backpressure {
        channel: ChannelId,
        queued: usize,
        limit: usize,
    },
}

/// Opaque identity of a channel, valid only within its reactor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Readiness a channel is polled for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    ReadWrite,
}

/// What a handler wants done after a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep the channel open
    Continue,
    /// Close and deregister this channel only
    CloseChannel,
    /// Shut the whole reactor down
    Fatal,
}

/// Answer to `on_closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    /// Close the socket and drop everything queued for it
    Proceed,
    /// Keep the channel registered
    Veto,
}

/// Addresses of an established channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub remote: SocketAddr,
    pub local: Option<SocketAddr>,
}

/// Callbacks invoked on the reactor thread
pub trait Handler: Send + 'static {
    /// Commands other threads deliver through [`ReactorHandle::post`]
    type Command: Send + 'static;

    fn on_accepted(&mut self, _ctx: &ReactorHandle<Self::Command>, _channel: &ChannelInfo) -> Flow {
        Flow::Continue
    }

    fn on_connected(&mut self, _ctx: &ReactorHandle<Self::Command>, _channel: &ChannelInfo) -> Flow {
        Flow::Continue
    }

    /// An outbound connect failed; the channel is already gone
    fn on_connect_failed(
        &mut self,
        _ctx: &ReactorHandle<Self::Command>,
        _channel: ChannelId,
        _addr: SocketAddr,
        _error: &io::Error,
    ) {
    }

    /// Bytes exactly as read from the socket, with no framing
    fn on_readable(&mut self, ctx: &ReactorHandle<Self::Command>, channel: ChannelId, data: &[u8]) -> Flow;

    fn on_written(&mut self, _ctx: &ReactorHandle<Self::Command>, _channel: ChannelId, _count: usize) -> Flow {
        Flow::Continue
    }

    fn on_closed(&mut self, _ctx: &ReactorHandle<Self::Command>, _channel: ChannelId) -> CloseDecision {
        CloseDecision::Proceed
    }

    fn on_command(&mut self, _ctx: &ReactorHandle<Self::Command>, _command: Self::Command) {}

    /// Fires every `tick_interval` when one is configured
    fn on_tick(&mut self, _ctx: &ReactorHandle<Self::Command>) {}

    fn on_fatal(&mut self, _error: &ReactorError) {}
}

/// Configuration for a reactor
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Bytes requested per socket read
    pub read_chunk_size: usize,
    /// Outbound connect timeout
    pub connect_timeout: Duration,
    /// Period of `on_tick`, if any
    pub tick_interval: Option<Duration>,
    /// Maximum unsent bytes per channel before `send` reports backpressure
    pub outbound_high_water: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 4096,
            connect_timeout: Duration::from_millis(5000),
            tick_interval: None,
            outbound_high_water: 4 * 1024 * 1024, // 4 MB
        }
    }
}

/// Bind a non-blocking listener for a reactor
pub fn bind(addr: SocketAddr) -> ReactorResult<std::net::TcpListener> {
    let listener =
        std::net::TcpListener::bind(addr).map_err(|source| ReactorError::Bind { addr, source })?;
    listener
        .set_nonblocking(true)
        .map_err(|source| ReactorError::Bind { addr, source })?;
    Ok(listener)
}

/// A reactor running on its own thread
pub struct ReactorThread<C> {
    handle: ReactorHandle<C>,
    local_addr: Option<SocketAddr>,
    thread: JoinHandle<ReactorResult<()>>,
}

impl<C: Send + 'static> ReactorThread<C> {
    /// Get a handle for talking to the loop
    pub fn handle(&self) -> ReactorHandle<C> {
        self.handle.clone()
    }

    /// Address of the listener, if the reactor has one
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Wait for the loop to exit
    pub fn join(self) -> ReactorResult<()> {
        self.thread.join().map_err(|_| ReactorError::Panicked)?
    }
}

/// Start a reactor thread
///
/// `listener` comes from [`bind`] so that bind errors reach the caller
/// before any thread exists.
pub fn spawn<H: Handler>(
    name: &str,
    config: ReactorConfig,
    listener: Option<std::net::TcpListener>,
    handler: H,
) -> ReactorResult<ReactorThread<H::Command>> {
    let local_addr = match &listener {
        Some(l) => Some(l.local_addr().map_err(ReactorError::Listener)?),
        None => None,
    };

    let shared = Arc::new(Shared::new(config.outbound_high_water));
    let handle = ReactorHandle::new(shared.clone());
    let loop_handle = handle.clone();

    let thread = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let result = run_thread(config, loop_handle, listener, handler);
            shared.running.store(false, Ordering::SeqCst);
            result
        })
        .map_err(ReactorError::Runtime)?;

    tracing::debug!("Reactor '{}' started (listener: {:?})", name, local_addr);

    Ok(ReactorThread {
        handle,
        local_addr,
        thread,
    })
}

fn run_thread<H: Handler>(
    config: ReactorConfig,
    handle: ReactorHandle<H::Command>,
    listener: Option<std::net::TcpListener>,
    handler: H,
) -> ReactorResult<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(ReactorError::Runtime)?;

    runtime.block_on(async move {
        let listener = match listener {
            Some(l) => Some(tokio::net::TcpListener::from_std(l).map_err(ReactorError::Listener)?),
            None => None,
        };
        EventLoop::new(config, handle, listener, handler).run().await
    })
}
