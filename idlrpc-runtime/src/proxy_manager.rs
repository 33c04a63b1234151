//! Proxy identity cache.
//!
//! Proxies are cached per (service uuid, peer). A peer is either a direct
//! connection, keyed by transport id, or an external connection behind a
//! gateway, keyed by its global index.

use crate::error::RpcError;
use crate::proxy::{Proxy, ProxyBase, ProxyFactory, ProxyId};
use crate::transport::Transport;
use idlrpc_protocol::{GlobalIndex, DIRECT_GLOBAL_INDEX};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// The peer a proxy is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Peer {
    /// Direct connection, by the transport id seen at creation.
    Transport(u64),
    /// External connection behind a gateway.
    Outside(GlobalIndex),
}

impl Peer {
    fn of(global_index: GlobalIndex, transport: &dyn Transport) -> Self {
        if global_index != DIRECT_GLOBAL_INDEX {
            Peer::Outside(global_index)
        } else {
            Peer::Transport(transport.id())
        }
    }
}

/// Service uuid to proxy, for one peer.
type Bucket = HashMap<u64, Arc<dyn Proxy>>;

struct Entry {
    proxy: Arc<dyn Proxy>,
    peer: Peer,
}

#[derive(Default)]
struct Inner {
    proxies: HashMap<ProxyId, Entry>,
    buckets: HashMap<Peer, Bucket>,
    factories: HashMap<u64, ProxyFactory>,
}

impl Inner {
    /// Removes a whole peer bucket and its proxies from the id map.
    fn evict(&mut self, peer: Peer) -> Bucket {
        let bucket = self.buckets.remove(&peer).unwrap_or_default();
        for proxy in bucket.values() {
            self.proxies.remove(&proxy.id());
        }
        bucket
    }
}

/// Creates, caches and invalidates proxies.
pub struct ProxyManager {
    next_id: AtomicU32,
    inner: RwLock<Inner>,
}

impl ProxyManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            inner: RwLock::new(Inner::default()),
        }
    }

    fn next_proxy_id(&self) -> ProxyId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers the factory used for proxies of `uuid`, replacing any
    /// previous one.
    pub fn add_factory(&self, uuid: u64, factory: ProxyFactory) {
        self.inner.write().factories.insert(uuid, factory);
    }

    /// Returns the cached connected proxy for `uuid` on this peer, or builds
    /// a new one with the registered factory.
    pub fn get_or_create(
        &self,
        uuid: u64,
        global_index: GlobalIndex,
        transport: &Arc<dyn Transport>,
    ) -> Result<Arc<dyn Proxy>, RpcError> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let factory = inner
            .factories
            .get(&uuid)
            .cloned()
            .ok_or(RpcError::FactoryNotFound(uuid))?;

        let peer = Peer::of(global_index, transport.as_ref());
        let bucket = inner.buckets.entry(peer).or_default();

        if let Some(proxy) = bucket.get(&uuid) {
            if proxy.is_connected() {
                return Ok(proxy.clone());
            }
            // Replaced below; drop the stale id as well.
            inner.proxies.remove(&proxy.id());
        }

        let proxy = factory(ProxyBase::new(uuid, transport.clone(), global_index));
        let id = self.next_proxy_id();
        proxy.base().set_id(id);

        bucket.insert(uuid, proxy.clone());
        inner.proxies.insert(
            id,
            Entry {
                proxy: proxy.clone(),
                peer,
            },
        );

        tracing::debug!(
            "[ProxyManager] created proxy {} for {} ({:#x}) on transport {} global index {}",
            id,
            proxy.service_name(),
            uuid,
            transport.id(),
            global_index
        );

        Ok(proxy)
    }

    pub fn get(&self, id: ProxyId) -> Result<Arc<dyn Proxy>, RpcError> {
        self.inner
            .read()
            .proxies
            .get(&id)
            .map(|entry| entry.proxy.clone())
            .ok_or(RpcError::ProxyNotFound(id))
    }

    /// Removes a proxy from the id map and from its peer bucket, dropping the
    /// bucket once it is empty. Unknown ids are ignored.
    pub fn destroy(&self, id: ProxyId) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let Some(entry) = inner.proxies.remove(&id) else {
            return;
        };

        let emptied = match inner.buckets.get_mut(&entry.peer) {
            Some(bucket) => {
                let uuid = entry.proxy.uuid();
                if bucket.get(&uuid).map(|p| p.id()) == Some(id) {
                    bucket.remove(&uuid);
                }
                bucket.is_empty()
            }
            None => false,
        };
        if emptied {
            inner.buckets.remove(&entry.peer);
        }
    }

    /// Evicts every proxy bound to an external connection that the gateway
    /// reported as gone and marks them disconnected. The gateway transport
    /// itself stays open.
    pub fn close_outside(&self, global_index: GlobalIndex) -> Result<usize, RpcError> {
        if global_index == DIRECT_GLOBAL_INDEX {
            tracing::warn!("[ProxyManager] cannot close outside proxies for global index 0");
            return Err(RpcError::InvalidGlobalIndex(global_index));
        }

        let evicted = self.inner.write().evict(Peer::Outside(global_index));
        for proxy in evicted.values() {
            proxy.base().disconnect();
        }

        tracing::info!(
            "[ProxyManager] closed {} proxies of external connection {}",
            evicted.len(),
            global_index
        );
        Ok(evicted.len())
    }

    /// Evicts the proxies of a direct connection whose transport was closed.
    pub fn transport_closed(&self, transport_id: u64) -> usize {
        let evicted = self.inner.write().evict(Peer::Transport(transport_id));
        for proxy in evicted.values() {
            proxy.base().disconnect();
        }
        evicted.len()
    }

    /// Number of live proxies.
    pub fn len(&self) -> usize {
        self.inner.read().proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ProxyManager {
    fn default() -> Self {
        Self::new()
    }
}
