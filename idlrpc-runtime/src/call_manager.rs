//! In-flight outbound call correlation.

use crate::error::RpcError;
use crate::proxy::ProxyId;
use bytes::Bytes;
use idlrpc_protocol::GlobalIndex;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A response delivered to a waiting caller.
#[derive(Debug, Clone)]
pub struct Reply {
    pub code: u32,
    pub server_id: u32,
    pub body: Bytes,
}

/// One outbound call waiting for its response.
pub struct ProxyCall {
    call_id: u32,
    proxy_id: ProxyId,
    method_id: u32,
    global_index: GlobalIndex,
    timeout_ms: u64,
    retries: AtomicU32,
    error_code: AtomicU32,
    /// Packed request, kept for retransmission.
    request: Mutex<Bytes>,
    slot: mpsc::Sender<Reply>,
}

impl ProxyCall {
    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    pub fn proxy_id(&self) -> ProxyId {
        self.proxy_id
    }

    pub fn method_id(&self) -> u32 {
        self.method_id
    }

    pub fn global_index(&self) -> GlobalIndex {
        self.global_index
    }

    /// Requested timeout in milliseconds, 0 meaning the configured default.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn retries_left(&self) -> u32 {
        self.retries.load(Ordering::Acquire)
    }

    /// Consumes one retry, returning false once none are left.
    pub fn take_retry(&self) -> bool {
        self.retries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Result code of the last delivered response.
    pub fn error_code(&self) -> u32 {
        self.error_code.load(Ordering::Acquire)
    }

    pub fn set_request(&self, request: Bytes) {
        *self.request.lock() = request;
    }

    pub fn request(&self) -> Bytes {
        self.request.lock().clone()
    }

    /// Hands a response to the waiting caller. The slot holds one reply; a
    /// second delivery before the caller has taken the first is dropped and
    /// leaves the recorded error code untouched.
    pub fn deliver(&self, reply: Reply) -> bool {
        let code = reply.code;
        match self.slot.try_send(reply) {
            Ok(()) => {
                self.error_code.store(code, Ordering::Release);
                true
            }
            Err(_) => {
                tracing::warn!(
                    "[ProxyCall] dropped extra response for call {}",
                    self.call_id
                );
                false
            }
        }
    }
}

/// Tracks in-flight calls by call id.
pub struct ProxyCallManager {
    next_call_id: AtomicU32,
    max_retries: u32,
    calls: RwLock<HashMap<u32, Arc<ProxyCall>>>,
}

impl ProxyCallManager {
    pub fn new(max_retries: u32) -> Self {
        Self {
            next_call_id: AtomicU32::new(1),
            max_retries,
            calls: RwLock::new(HashMap::new()),
        }
    }

    /// Builds a call record with a fresh call id. The id wraps at `u32::MAX`;
    /// a collision with a still-active call is caught by [`add`](Self::add).
    pub fn create_call(
        &self,
        proxy_id: ProxyId,
        method_id: u32,
        timeout_ms: u64,
        retries: u32,
        global_index: GlobalIndex,
    ) -> (Arc<ProxyCall>, mpsc::Receiver<Reply>) {
        let (tx, rx) = mpsc::channel(1);
        let call = Arc::new(ProxyCall {
            call_id: self.next_call_id.fetch_add(1, Ordering::Relaxed),
            proxy_id,
            method_id,
            global_index,
            timeout_ms,
            retries: AtomicU32::new(retries.min(self.max_retries)),
            error_code: AtomicU32::new(0),
            request: Mutex::new(Bytes::new()),
            slot: tx,
        });
        (call, rx)
    }

    pub fn add(&self, call: Arc<ProxyCall>) -> Result<(), RpcError> {
        let mut calls = self.calls.write();
        if calls.contains_key(&call.call_id) {
            tracing::error!("[ProxyCall] call {} already exists", call.call_id);
            return Err(RpcError::CallExists(call.call_id));
        }
        calls.insert(call.call_id, call);
        Ok(())
    }

    pub fn get(&self, call_id: u32) -> Result<Arc<ProxyCall>, RpcError> {
        self.calls
            .read()
            .get(&call_id)
            .cloned()
            .ok_or(RpcError::CallNotFound(call_id))
    }

    pub fn destroy(&self, call_id: u32) {
        self.calls.write().remove(&call_id);
    }

    /// Returns a guard that destroys the call record when dropped.
    pub fn guard(&self, call_id: u32) -> CallGuard<'_> {
        CallGuard {
            manager: self,
            call_id,
        }
    }

    pub fn len(&self) -> usize {
        self.calls.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes a call from its manager on every exit path of the caller.
pub struct CallGuard<'a> {
    manager: &'a ProxyCallManager,
    call_id: u32,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.manager.destroy(self.call_id);
    }
}
