//! Transport capability set and an in-memory implementation.
//!
//! The runtime never performs I/O itself. The owner of a connection appends
//! inbound bytes to the transport and calls [`Runtime::on_message`]; the
//! runtime consumes whole frames through [`Transport::peek`] and
//! [`Transport::read`] and writes replies through [`Transport::send`].
//!
//! [`Runtime::on_message`]: crate::Runtime::on_message

use crate::error::TransportError;
use bytes::{Bytes, BytesMut};
use idlrpc_protocol::GlobalIndex;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A connected, readable and writable byte stream.
///
/// All methods take `&self`: a transport is shared between the dispatch loop,
/// stub workers replying to calls and proxies issuing requests.
pub trait Transport: Send + Sync {
    /// Returns a copy of the first `len` buffered bytes without consuming
    /// them, or `None` if fewer are buffered.
    fn peek(&self, len: usize) -> Option<Bytes>;

    /// Consumes exactly `len` bytes, or nothing if fewer are buffered.
    fn read(&self, len: usize) -> Option<Bytes>;

    /// Number of inbound bytes currently buffered.
    fn buffered(&self) -> usize;

    /// Queues a complete frame for sending. Safe to call concurrently.
    fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Connection id assigned by the owner.
    fn id(&self) -> u64;

    fn set_id(&self, id: u64);

    fn local_addr(&self) -> String;

    fn remote_addr(&self) -> String;

    /// Nonzero when the peer is a gateway relaying an external connection.
    fn global_index(&self) -> GlobalIndex;

    /// Records liveness after a pong from the peer.
    fn heartbeat(&self);
}

/// Transport backed by an in-process buffer and channel.
///
/// Inbound bytes are pushed with [`MemoryTransport::push`]; every frame sent
/// comes out of the receiver returned by [`MemoryTransport::new`].
pub struct MemoryTransport {
    id: AtomicU64,
    global_index: GlobalIndex,
    inbound: Mutex<BytesMut>,
    outbound: mpsc::UnboundedSender<Bytes>,
    closed: AtomicBool,
    heartbeats: AtomicU64,
}

impl MemoryTransport {
    pub fn new(id: u64, global_index: GlobalIndex) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            id: AtomicU64::new(id),
            global_index,
            inbound: Mutex::new(BytesMut::with_capacity(8192)),
            outbound: tx,
            closed: AtomicBool::new(false),
            heartbeats: AtomicU64::new(0),
        });
        (transport, rx)
    }

    /// Appends bytes as if they had arrived from the peer.
    pub fn push(&self, data: &[u8]) {
        self.inbound.lock().extend_from_slice(data);
    }

    /// Number of heartbeats recorded so far.
    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }
}

impl Transport for MemoryTransport {
    fn peek(&self, len: usize) -> Option<Bytes> {
        let buf = self.inbound.lock();
        if buf.len() < len {
            return None;
        }
        Some(Bytes::copy_from_slice(&buf[..len]))
    }

    fn read(&self, len: usize) -> Option<Bytes> {
        let mut buf = self.inbound.lock();
        if buf.len() < len {
            return None;
        }
        Some(buf.split_to(len).freeze())
    }

    fn buffered(&self) -> usize {
        self.inbound.lock().len()
    }

    fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("[Transport] {} closed", self.id());
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::Relaxed);
    }

    fn local_addr(&self) -> String {
        format!("memory:{}", self.id())
    }

    fn remote_addr(&self) -> String {
        format!("memory-peer:{}", self.id())
    }

    fn global_index(&self) -> GlobalIndex {
        self.global_index
    }

    fn heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }
}
