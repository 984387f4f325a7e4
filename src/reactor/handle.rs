//! Thread-safe entry points into a running reactor
//!
//! Every thread talks to the event loop through a [`ReactorHandle`]. Calls
//! only enqueue work and wake the loop; the loop applies it on its own thread.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::{ChannelId, Interest, ReactorError, SendError};

/// A command waiting for the event loop
pub(crate) enum PendingOp<C> {
    /// Open an outbound socket and register it for connect readiness
    Register { channel: ChannelId, addr: SocketAddr },
    /// Switch the readiness a channel is polled for
    ChangeInterest { channel: ChannelId, interest: Interest },
    /// Close a channel
    Close(ChannelId),
    /// Deliver an owner command on the loop thread
    Post(C),
    /// Stop the loop
    Shutdown,
}

impl<C> PendingOp<C> {
    pub(crate) fn channel(&self) -> Option<ChannelId> {
        match self {
            PendingOp::Register { channel, .. }
            | PendingOp::ChangeInterest { channel, .. }
            | PendingOp::Close(channel) => Some(*channel),
            PendingOp::Post(_) | PendingOp::Shutdown => None,
        }
    }
}

/// Unsent bytes for one channel
#[derive(Debug, Default)]
pub(crate) struct OutboundQueue {
    pub(crate) chunks: VecDeque<Bytes>,
    pub(crate) queued: usize,
}

/// State shared between the loop and every handle
pub(crate) struct Shared<C> {
    pub(crate) ops: Mutex<Vec<PendingOp<C>>>,
    /// Keyed by live channel; a missing entry means the channel is gone
    pub(crate) outbound: Mutex<HashMap<ChannelId, OutboundQueue>>,
    pub(crate) wakeup: Notify,
    pub(crate) running: AtomicBool,
    next_channel: AtomicU64,
    high_water: usize,
}

impl<C> Shared<C> {
    pub(crate) fn new(high_water: usize) -> Self {
        Self {
            ops: Mutex::new(Vec::new()),
            outbound: Mutex::new(HashMap::new()),
            wakeup: Notify::new(),
            running: AtomicBool::new(true),
            next_channel: AtomicU64::new(1),
            high_water,
        }
    }

    pub(crate) fn next_channel(&self) -> ChannelId {
        ChannelId(self.next_channel.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn open_queue(&self, channel: ChannelId) {
        self.outbound.lock().entry(channel).or_default();
    }

    pub(crate) fn drop_queue(&self, channel: ChannelId) -> usize {
        self.outbound
            .lock()
            .remove(&channel)
            .map(|q| q.queued)
            .unwrap_or(0)
    }

    fn push(&self, op: PendingOp<C>) -> Result<(), ReactorError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ReactorError::Stopped);
        }
        self.ops.lock().push(op);
        self.wakeup.notify_one();
        Ok(())
    }
}

/// A cloneable, thread-safe handle to a reactor
pub struct ReactorHandle<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for ReactorHandle<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C> std::fmt::Debug for ReactorHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("running", &self.is_running())
            .finish()
    }
}

impl<C> ReactorHandle<C> {
    pub(crate) fn new(shared: Arc<Shared<C>>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Shared<C> {
        &self.shared
    }

    /// Queue bytes for a channel and switch it to write interest
    ///
    /// Never blocks. Bytes for a channel that is closed or unknown are
    /// dropped silently, since a send may legitimately race a close.
    pub fn send(&self, channel: ChannelId, data: impl Into<Bytes>) -> Result<(), SendError> {
        let data = data.into();
        if data.is_empty() {
            return Ok(());
        }
        {
            // Same lock order as the loop: ops, then outbound
            let mut ops = self.shared.ops.lock();
            let mut outbound = self.shared.outbound.lock();
            let Some(queue) = outbound.get_mut(&channel) else {
                tracing::trace!("Dropping {} bytes for closed channel {}", data.len(), channel);
                return Ok(());
            };

            let wanted = queue.queued + data.len();
            if wanted > self.shared.high_water {
                return Err(SendError::Backpressure {
                    channel,
                    queued: queue.queued,
                    limit: self.shared.high_water,
                });
            }

            queue.queued = wanted;
            queue.chunks.push_back(data);
            ops.push(PendingOp::ChangeInterest {
                channel,
                interest: Interest::ReadWrite,
            });
        }
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// Request that a channel be closed
    ///
    /// Closing a channel twice, or one that never existed, has no effect.
    pub fn close(&self, channel: ChannelId) {
        if self.shared.push(PendingOp::Close(channel)).is_err() {
            tracing::trace!("Reactor stopped, ignoring close of {}", channel);
        }
    }

    /// Start an outbound connection
    ///
    /// Returns the channel id right away; completion is reported to the
    /// handler through `on_connected` or `on_connect_failed`.
    pub fn dial(&self, addr: SocketAddr) -> Result<ChannelId, ReactorError> {
        let channel = self.shared.next_channel();
        // Bytes sent before the connect completes wait in the queue
        self.shared.open_queue(channel);
        if let Err(e) = self.shared.push(PendingOp::Register { channel, addr }) {
            self.shared.drop_queue(channel);
            return Err(e);
        }
        Ok(channel)
    }

    /// Deliver a command to the handler on the loop thread
    pub fn post(&self, command: C) -> Result<(), ReactorError> {
        self.shared.push(PendingOp::Post(command))
    }

    /// Ask the loop to close every channel and exit
    pub fn shutdown(&self) {
        let _ = self.shared.push(PendingOp::Shutdown);
    }

    /// Whether the loop is still accepting work
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Bytes currently queued for a channel
    pub fn queued_bytes(&self, channel: ChannelId) -> usize {
        self.shared
            .outbound
            .lock()
            .get(&channel)
            .map(|q| q.queued)
            .unwrap_or(0)
    }
}

#[cfg(test)]
impl<C> ReactorHandle<C> {
    /// A handle with no loop behind it, for driving handlers directly
    pub(crate) fn detached(high_water: usize) -> Self {
        Self::new(Arc::new(Shared::new(high_water)))
    }

    /// Register a channel as if the loop had accepted it
    pub(crate) fn open_test_channel(&self) -> ChannelId {
        let channel = self.shared.next_channel();
        self.shared.open_queue(channel);
        channel
    }

    /// Drain everything queued for a channel
    pub(crate) fn take_sent(&self, channel: ChannelId) -> Vec<u8> {
        let mut outbound = self.shared.outbound.lock();
        let Some(queue) = outbound.get_mut(&channel) else {
            return Vec::new();
        };
        queue.queued = 0;
        queue.chunks.drain(..).flat_map(|c| c.to_vec()).collect()
    }

    /// Channels with a queued close request
    pub(crate) fn close_requests(&self) -> Vec<ChannelId> {
        self.shared
            .ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                PendingOp::Close(channel) => Some(*channel),
                _ => None,
            })
            .collect()
    }

    /// Addresses with a queued dial
    pub(crate) fn dial_requests(&self) -> Vec<(ChannelId, SocketAddr)> {
        self.shared
            .ops
            .lock()
            .iter()
            .filter_map(|op| match op {
                PendingOp::Register { channel, addr } => Some((*channel, *addr)),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_queues_and_requests_write_interest() {
        let handle: ReactorHandle<()> = ReactorHandle::detached(1024);
        let ch = handle.open_test_channel();

        handle.send(ch, Bytes::from_static(b"abc")).unwrap();
        handle.send(ch, Bytes::from_static(b"def")).unwrap();

        assert_eq!(handle.queued_bytes(ch), 6);
        let ops = handle.shared.ops.lock();
        assert!(ops.iter().all(|op| matches!(
            op,
            PendingOp::ChangeInterest { interest: Interest::ReadWrite, .. }
        )));
        drop(ops);
        assert_eq!(handle.take_sent(ch), b"abcdef");
    }

    #[test]
    fn test_send_to_unknown_channel_is_dropped() {
        let handle: ReactorHandle<()> = ReactorHandle::detached(1024);
        assert!(handle.send(ChannelId(42), Bytes::from_static(b"x")).is_ok());
        assert_eq!(handle.queued_bytes(ChannelId(42)), 0);
        assert!(handle.shared.ops.lock().is_empty());
    }

    #[test]
    fn test_backpressure() {
        let handle: ReactorHandle<()> = ReactorHandle::detached(8);
        let ch = handle.open_test_channel();

        handle.send(ch, vec![0u8; 6]).unwrap();
        let err = handle.send(ch, vec![0u8; 3]).unwrap_err();
        assert!(matches!(err, SendError::Backpressure { queued: 6, limit: 8, .. }));
        assert_eq!(handle.queued_bytes(ch), 6);
    }

    #[test]
    fn test_stopped_reactor_rejects_work() {
        let handle: ReactorHandle<u32> = ReactorHandle::detached(8);
        handle.shared.running.store(false, Ordering::SeqCst);

        assert!(matches!(handle.post(7), Err(ReactorError::Stopped)));
        assert!(handle.dial("127.0.0.1:1".parse().unwrap()).is_err());
        assert!(handle.shared.outbound.lock().is_empty());
    }
}
