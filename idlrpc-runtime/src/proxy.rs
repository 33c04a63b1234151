//! Client-side remote service handles.

use crate::transport::Transport;
use idlrpc_protocol::GlobalIndex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Identifier assigned to a proxy by the proxy manager.
pub type ProxyId = u32;

/// Target server id meaning "no known instance".
pub const INVALID_STUB_ID: u32 = 0;

/// State shared by every proxy: identity, routing and connectivity.
pub struct ProxyBase {
    id: AtomicU32,
    service_uuid: u64,
    target_id: AtomicU32,
    global_index: GlobalIndex,
    connected: AtomicBool,
    transport: Arc<dyn Transport>,
}

impl ProxyBase {
    pub fn new(service_uuid: u64, transport: Arc<dyn Transport>, global_index: GlobalIndex) -> Self {
        Self {
            id: AtomicU32::new(0),
            service_uuid,
            target_id: AtomicU32::new(INVALID_STUB_ID),
            global_index,
            connected: AtomicBool::new(true),
            transport,
        }
    }

    pub fn id(&self) -> ProxyId {
        self.id.load(Ordering::Acquire)
    }

    pub(crate) fn set_id(&self, id: ProxyId) {
        self.id.store(id, Ordering::Release);
    }

    pub fn service_uuid(&self) -> u64 {
        self.service_uuid
    }

    /// Last known server instance serving this proxy.
    pub fn target_id(&self) -> u32 {
        self.target_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_target_id(&self, id: u32) {
        self.target_id.store(id, Ordering::Release);
    }

    pub fn global_index(&self) -> GlobalIndex {
        self.global_index
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// True until the proxy is invalidated or its transport closes.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.transport.is_closed()
    }

    /// Marks the proxy unusable without touching the transport.
    pub(crate) fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

/// A generated proxy for one remote service.
pub trait Proxy: Send + Sync {
    fn base(&self) -> &ProxyBase;

    fn service_name(&self) -> &str;

    fn signature(&self, method_id: u32) -> &str;

    fn is_one_way(&self, _method_id: u32) -> bool {
        false
    }

    fn id(&self) -> ProxyId {
        self.base().id()
    }

    fn uuid(&self) -> u64 {
        self.base().service_uuid()
    }

    fn global_index(&self) -> GlobalIndex {
        self.base().global_index()
    }

    fn is_connected(&self) -> bool {
        self.base().is_connected()
    }
}

/// Builds a proxy around a prepared [`ProxyBase`].
pub type ProxyFactory = Arc<dyn Fn(ProxyBase) -> Arc<dyn Proxy> + Send + Sync>;
