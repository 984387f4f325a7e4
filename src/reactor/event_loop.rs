//! The reactor event loop
//!
//! Each iteration drains the pending-op queue, parks until something is
//! ready, then handles every ready source once. All sockets live in this
//! loop; nothing here spawns a task per connection.

use bytes::Buf;
use futures::future::{FutureExt, LocalBoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use tokio::io::Ready;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Interval, MissedTickBehavior};

use super::handle::PendingOp;
use super::{
    ChannelId, ChannelInfo, CloseDecision, Flow, Handler, Interest, ReactorConfig, ReactorError,
    ReactorHandle, ReactorResult,
};

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>>>>;

enum SlotState {
    Connecting(ConnectFuture),
    Established(TcpStream),
}

/// One registered channel
struct Slot {
    remote: SocketAddr,
    state: SlotState,
    interest: Interest,
    /// Reading stopped after a vetoed close
    read_closed: bool,
}

impl Slot {
    fn established(stream: TcpStream, remote: SocketAddr) -> Self {
        Self {
            remote,
            state: SlotState::Established(stream),
            interest: Interest::Read,
            read_closed: false,
        }
    }

    fn tokio_interest(&self) -> Option<tokio::io::Interest> {
        match (self.interest, self.read_closed) {
            (Interest::Read, false) => Some(tokio::io::Interest::READABLE),
            (Interest::ReadWrite, false) => {
                Some(tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE)
            }
            (Interest::ReadWrite, true) => Some(tokio::io::Interest::WRITABLE),
            (Interest::Read, true) => None,
        }
    }
}

/// Something the loop woke up for
enum LoopEvent {
    Wakeup,
    Tick,
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Connected(ChannelId, io::Result<TcpStream>),
    Ready(ChannelId, io::Result<Ready>),
}

/// Why a channel is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseCause {
    Requested,
    Eof,
    Error,
    Shutdown,
}

/// Whether the loop should keep going after applying ops
#[derive(PartialEq, Eq)]
enum Control {
    Continue,
    Shutdown,
}

pub(super) struct EventLoop<H: Handler> {
    config: ReactorConfig,
    handle: ReactorHandle<H::Command>,
    listener: Option<TcpListener>,
    channels: HashMap<ChannelId, Slot>,
    handler: H,
    read_buf: Vec<u8>,
}

impl<H: Handler> EventLoop<H> {
    pub(super) fn new(
        config: ReactorConfig,
        handle: ReactorHandle<H::Command>,
        listener: Option<TcpListener>,
        handler: H,
    ) -> Self {
        let read_buf = vec![0u8; config.read_chunk_size.max(1)];
        Self {
            config,
            handle,
            listener,
            channels: HashMap::new(),
            handler,
            read_buf,
        }
    }

    /// Run until shutdown or a fatal error
    pub(super) async fn run(mut self) -> ReactorResult<()> {
        let mut ticker = self.config.tick_interval.map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let result = loop {
            if self.apply_pending_ops() == Control::Shutdown {
                tracing::debug!("Reactor shutdown requested");
                break Ok(());
            }

            let events = self.wait(ticker.as_mut()).await;

            if let Err(e) = self.dispatch_all(events) {
                tracing::error!("Reactor failed: {}", e);
                self.handler.on_fatal(&e);
                break Err(e);
            }
        };

        self.teardown();
        result
    }

    fn dispatch_all(&mut self, events: Vec<LoopEvent>) -> ReactorResult<()> {
        for event in events {
            self.dispatch(event)?;
        }
        Ok(())
    }

    /// Apply queued ops; the queue is swapped out under its lock
    fn apply_pending_ops(&mut self) -> Control {
        let ops = mem::take(&mut *self.handle.shared().ops.lock());
        let mut control = Control::Continue;

        for op in ops {
            match op {
                PendingOp::Register { channel, addr } => self.register_dial(channel, addr),
                PendingOp::ChangeInterest { channel, interest } => {
                    if let Some(slot) = self.channels.get_mut(&channel) {
                        slot.interest = interest;
                    }
                }
                PendingOp::Close(channel) => self.close_channel(channel, CloseCause::Requested),
                PendingOp::Post(command) => self.handler.on_command(&self.handle, command),
                PendingOp::Shutdown => control = Control::Shutdown,
            }
        }

        control
    }

    fn register_dial(&mut self, channel: ChannelId, addr: SocketAddr) {
        let timeout = self.config.connect_timeout;
        let connect: ConnectFuture = Box::pin(async move {
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                )),
            }
        });

        tracing::debug!("Dialing {} on {}", addr, channel);
        self.channels.insert(
            channel,
            Slot {
                remote: addr,
                state: SlotState::Connecting(connect),
                interest: Interest::Read,
                read_closed: false,
            },
        );
    }

    /// Park until at least one source is ready, then collect all ready ones
    async fn wait(&mut self, ticker: Option<&mut Interval>) -> Vec<LoopEvent> {
        let shared = self.handle.shared();
        let mut waits: FuturesUnordered<LocalBoxFuture<'_, LoopEvent>> = FuturesUnordered::new();

        waits.push(
            async move {
                shared.wakeup.notified().await;
                LoopEvent::Wakeup
            }
            .boxed_local(),
        );

        if let Some(ticker) = ticker {
            waits.push(
                async move {
                    ticker.tick().await;
                    LoopEvent::Tick
                }
                .boxed_local(),
            );
        }

        if let Some(listener) = self.listener.as_ref() {
            waits.push(async move { LoopEvent::Accepted(listener.accept().await) }.boxed_local());
        }

        for (id, slot) in self.channels.iter_mut() {
            waits.push(wait_slot(*id, slot).boxed_local());
        }

        let mut events = Vec::new();
        if let Some(event) = waits.next().await {
            events.push(event);
        }
        while let Some(Some(event)) = waits.next().now_or_never() {
            events.push(event);
        }
        events
    }

    fn dispatch(&mut self, event: LoopEvent) -> ReactorResult<()> {
        match event {
            LoopEvent::Wakeup => Ok(()),
            LoopEvent::Tick => {
                self.handler.on_tick(&self.handle);
                Ok(())
            }
            LoopEvent::Accepted(Ok((stream, remote))) => self.accept(stream, remote),
            LoopEvent::Accepted(Err(e)) => match e.kind() {
                io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::Interrupted
                | io::ErrorKind::WouldBlock => {
                    tracing::warn!("Accept error: {}", e);
                    Ok(())
                }
                _ => Err(ReactorError::Listener(e)),
            },
            LoopEvent::Connected(id, result) => self.finish_connect(id, result),
            LoopEvent::Ready(id, Ok(ready)) => self.service(id, ready),
            LoopEvent::Ready(id, Err(e)) => {
                tracing::debug!("Poll error on {}: {}", id, e);
                self.close_channel(id, CloseCause::Error);
                Ok(())
            }
        }
    }

    fn accept(&mut self, stream: TcpStream, remote: SocketAddr) -> ReactorResult<()> {
        let id = self.handle.shared().next_channel();
        let _ = stream.set_nodelay(true);
        let info = ChannelInfo {
            id,
            remote,
            local: stream.local_addr().ok(),
        };

        tracing::debug!("Accepted {} from {}", id, remote);
        self.handle.shared().open_queue(id);
        self.channels.insert(id, Slot::established(stream, remote));

        let flow = self.handler.on_accepted(&self.handle, &info);
        self.apply_flow(id, flow)
    }

    fn finish_connect(&mut self, id: ChannelId, result: io::Result<TcpStream>) -> ReactorResult<()> {
        let Some(slot) = self.channels.get_mut(&id) else {
            return Ok(());
        };

        match result {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let info = ChannelInfo {
                    id,
                    remote: slot.remote,
                    local: stream.local_addr().ok(),
                };
                slot.state = SlotState::Established(stream);

                tracing::debug!("Connected {} to {}", id, info.remote);
                let flow = self.handler.on_connected(&self.handle, &info);
                self.apply_flow(id, flow)
            }
            Err(e) => {
                let addr = slot.remote;
                tracing::debug!("Connect {} to {} failed: {}", id, addr, e);
                self.channels.remove(&id);
                self.forget(id);
                self.handler.on_connect_failed(&self.handle, id, addr, &e);
                Ok(())
            }
        }
    }

    /// Handle one ready channel: at most one read, then a flush
    fn service(&mut self, id: ChannelId, ready: Ready) -> ReactorResult<()> {
        let can_read = self.channels.get(&id).map(|s| !s.read_closed).unwrap_or(false);
        let readable = ready.is_readable() && can_read;

        if readable {
            self.read(id)?;
        }
        if ready.is_writable() && self.channels.contains_key(&id) {
            return self.write(id);
        }
        if !readable && (ready.is_read_closed() || ready.is_write_closed()) {
            self.close_channel(id, CloseCause::Eof);
        }
        Ok(())
    }

    fn read(&mut self, id: ChannelId) -> ReactorResult<()> {
        let Some(Slot {
            state: SlotState::Established(stream),
            ..
        }) = self.channels.get(&id)
        else {
            return Ok(());
        };

        match stream.try_read(&mut self.read_buf) {
            Ok(0) => {
                tracing::debug!("{} closed by peer", id);
                self.close_channel(id, CloseCause::Eof);
                Ok(())
            }
            Ok(n) => {
                let flow = self.handler.on_readable(&self.handle, id, &self.read_buf[..n]);
                self.apply_flow(id, flow)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                tracing::debug!("Read error on {}: {}", id, e);
                self.close_channel(id, CloseCause::Error);
                Ok(())
            }
        }
    }

    /// Flush as much of the outbound queue as the socket takes
    fn write(&mut self, id: ChannelId) -> ReactorResult<()> {
        let Some(slot) = self.channels.get_mut(&id) else {
            return Ok(());
        };
        let SlotState::Established(stream) = &slot.state else {
            return Ok(());
        };

        let mut written = 0;
        let mut failed = None;
        {
            let shared = self.handle.shared();
            let mut outbound = shared.outbound.lock();
            let Some(queue) = outbound.get_mut(&id) else {
                return Ok(());
            };

            while let Some(chunk) = queue.chunks.front_mut() {
                match stream.try_write(chunk) {
                    Ok(n) => {
                        written += n;
                        queue.queued -= n;
                        if n < chunk.len() {
                            // Keep the remainder at the front, retry when writable
                            chunk.advance(n);
                            break;
                        }
                        queue.chunks.pop_front();
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }

            if queue.chunks.is_empty() {
                slot.interest = Interest::Read;
            }
        }

        if let Some(e) = failed {
            tracing::debug!("Write error on {}: {}", id, e);
            self.close_channel(id, CloseCause::Error);
            return Ok(());
        }

        if written == 0 {
            return Ok(());
        }

        let flow = self.handler.on_written(&self.handle, id, written);
        self.apply_flow(id, flow)
    }

    fn apply_flow(&mut self, id: ChannelId, flow: Flow) -> ReactorResult<()> {
        match flow {
            Flow::Continue => Ok(()),
            Flow::CloseChannel => {
                self.close_channel(id, CloseCause::Requested);
                Ok(())
            }
            Flow::Fatal => Err(ReactorError::Aborted(id)),
        }
    }

    /// Close a channel unless the handler vetoes it
    ///
    /// Unknown channels are ignored, so closing twice is harmless.
    fn close_channel(&mut self, id: ChannelId, cause: CloseCause) {
        if !self.channels.contains_key(&id) {
            return;
        }

        let decision = self.handler.on_closed(&self.handle, id);
        if decision == CloseDecision::Veto && cause != CloseCause::Shutdown {
            tracing::debug!("Close of {} vetoed ({:?})", id, cause);
            if matches!(cause, CloseCause::Eof | CloseCause::Error) {
                if let Some(slot) = self.channels.get_mut(&id) {
                    slot.read_closed = true;
                }
            }
            return;
        }

        // Dropping the stream closes the socket
        if let Some(slot) = self.channels.remove(&id) {
            tracing::debug!("Closed {} ({}, {:?})", id, slot.remote, cause);
        }
        self.forget(id);
    }

    /// Drop queued bytes and ops that still reference a channel
    fn forget(&mut self, id: ChannelId) {
        let shared = self.handle.shared();
        let discarded = shared.drop_queue(id);
        if discarded > 0 {
            tracing::debug!("Discarded {} unsent bytes for {}", discarded, id);
        }
        shared.ops.lock().retain(|op| op.channel() != Some(id));
    }

    fn teardown(&mut self) {
        self.handle.shared().running.store(false, Ordering::SeqCst);
        let ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in ids {
            self.close_channel(id, CloseCause::Shutdown);
        }
        self.listener = None;
        self.handle.shared().ops.lock().clear();
    }
}

async fn wait_slot(id: ChannelId, slot: &mut Slot) -> LoopEvent {
    let interest = slot.tokio_interest();
    match &mut slot.state {
        SlotState::Connecting(connect) => LoopEvent::Connected(id, connect.as_mut().await),
        SlotState::Established(stream) => match interest {
            Some(interest) => LoopEvent::Ready(id, stream.ready(interest).await),
            None => std::future::pending().await,
        },
    }
}
