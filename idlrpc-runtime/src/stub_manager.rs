//! Registry of services by uuid.

use crate::config::RuntimeConfig;
use crate::error::RpcError;
use crate::service::{Service, ServiceContext};
use crate::stub::StubWrapper;
use idlrpc_protocol::Protocol;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct StubManager {
    stubs: RwLock<HashMap<u64, Arc<StubWrapper>>>,
    next_sequence: AtomicU64,
}

impl StubManager {
    pub fn new() -> Self {
        Self {
            stubs: RwLock::new(HashMap::new()),
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Registers a service and starts its workers. The uuid must be free and
    /// the service's init hook must succeed.
    pub fn add(
        &self,
        service: Arc<dyn Service>,
        protocol: Arc<dyn Protocol>,
        config: &RuntimeConfig,
        ctx: &ServiceContext,
    ) -> Result<Arc<StubWrapper>, RpcError> {
        let uuid = service.uuid();
        let mut stubs = self.stubs.write();
        if stubs.contains_key(&uuid) {
            tracing::warn!(
                "[Service] {} ({:#x}) already registered",
                service.name(),
                uuid
            );
            return Err(RpcError::ServiceExists(uuid));
        }

        let stub = StubWrapper::new(service, protocol, config);
        stub.init(ctx)?;
        stub.start();
        stubs.insert(uuid, stub.clone());
        Ok(stub)
    }

    pub fn get(&self, uuid: u64) -> Option<Arc<StubWrapper>> {
        self.stubs.read().get(&uuid).cloned()
    }

    /// Sequence number for the next inbound call.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    pub fn tick(&self) {
        let stubs: Vec<_> = self.stubs.read().values().cloned().collect();
        for stub in stubs {
            stub.tick();
        }
    }

    /// Unregisters every service and waits for their workers to stop.
    pub async fn shutdown(&self) {
        let stubs: Vec<_> = self.stubs.write().drain().map(|(_, stub)| stub).collect();
        for stub in stubs {
            stub.close().await;
        }
    }

    pub fn len(&self) -> usize {
        self.stubs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StubManager {
    fn default() -> Self {
        Self::new()
    }
}
