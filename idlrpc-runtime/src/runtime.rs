//! The RPC runtime: inbound dispatch, outbound calls and lifecycle.

use crate::call_manager::{ProxyCallManager, Reply};
use crate::config::RuntimeConfig;
use crate::error::RpcError;
use crate::proxy::{Proxy, ProxyFactory, ProxyId, INVALID_STUB_ID};
use crate::proxy_manager::ProxyManager;
use crate::relay::ProxyHandler;
use crate::service::{CallContext, Service, ServiceContext};
use crate::stub::StubCall;
use crate::stub_manager::StubManager;
use crate::transport::Transport;
use bytes::Bytes;
use idlrpc_protocol::{
    validate_header, BaseHeader, BinaryProtocol, ErrorCode, MessageType, PongHeader, Protocol,
    ProtocolError, ProxyCallHeader, ProxyRequest, ProxyResponse, Request, Response, BASE_HEADER_SIZE,
    DIRECT_GLOBAL_INDEX,
};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Lifecycle state of a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStatus {
    NotInit,
    Running,
    Closed,
}

/// Builder for [`Runtime`].
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    protocol: Option<Arc<dyn Protocol>>,
    user_data: Option<Arc<dyn Any + Send + Sync>>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the default binary protocol.
    pub fn protocol(mut self, protocol: Arc<dyn Protocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Data handed to every service's `on_after_fork`.
    pub fn user_data(mut self, data: Arc<dyn Any + Send + Sync>) -> Self {
        self.user_data = Some(data);
        self
    }

    pub fn build(self) -> Runtime {
        let protocol = self
            .protocol
            .unwrap_or_else(|| Arc::new(BinaryProtocol) as Arc<dyn Protocol>);
        Runtime {
            calls: ProxyCallManager::new(self.config.max_retries),
            config: self.config,
            protocol,
            status: Mutex::new(RuntimeStatus::NotInit),
            stubs: StubManager::new(),
            proxies: ProxyManager::new(),
            service_ctx: ServiceContext::new(self.user_data),
        }
    }
}

/// Connects registered services to transports and issues outbound calls.
pub struct Runtime {
    config: RuntimeConfig,
    protocol: Arc<dyn Protocol>,
    status: Mutex<RuntimeStatus>,
    stubs: StubManager,
    proxies: ProxyManager,
    calls: ProxyCallManager,
    service_ctx: ServiceContext,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    pub fn status(&self) -> RuntimeStatus {
        *self.status.lock()
    }

    fn ensure_running(&self) -> Result<(), RpcError> {
        match self.status() {
            RuntimeStatus::Running => Ok(()),
            _ => Err(RpcError::NotRunning),
        }
    }

    pub fn start(&self) -> Result<(), RpcError> {
        let mut status = self.status.lock();
        match *status {
            RuntimeStatus::NotInit => {
                *status = RuntimeStatus::Running;
                tracing::info!("[Rpc] runtime started");
                Ok(())
            }
            RuntimeStatus::Running => Ok(()),
            RuntimeStatus::Closed => Err(RpcError::NotRunning),
        }
    }

    /// Drives every service's tick hook. Call once per period from the
    /// application's own loop.
    pub fn tick(&self) -> Result<(), RpcError> {
        self.ensure_running()?;
        self.stubs.tick();
        Ok(())
    }

    /// Stops every service. Outstanding outbound calls are not cancelled and
    /// finish through their own timeout.
    pub async fn shutdown(&self) -> Result<(), RpcError> {
        {
            let mut status = self.status.lock();
            if *status != RuntimeStatus::Running {
                return Err(RpcError::NotRunning);
            }
            *status = RuntimeStatus::Closed;
        }
        tracing::info!("[Rpc] shutting down {} service(s)", self.stubs.len());
        self.stubs.shutdown().await;
        Ok(())
    }

    /// Registers a service and starts its workers. Must run inside a Tokio
    /// runtime.
    pub fn register_service(&self, service: Arc<dyn Service>) -> Result<(), RpcError> {
        self.ensure_running()?;
        let name = service.name().to_string();
        match self
            .stubs
            .add(service, self.protocol.clone(), &self.config, &self.service_ctx)
        {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!("[Rpc] failed to register service {}: {}", name, e);
                Err(e)
            }
        }
    }

    pub fn add_proxy_factory(&self, uuid: u64, factory: ProxyFactory) {
        self.proxies.add_factory(uuid, factory);
    }

    /// Returns the proxy for `uuid` on `transport`, creating it if needed.
    pub fn service_proxy(
        &self,
        uuid: u64,
        transport: &Arc<dyn Transport>,
    ) -> Result<Arc<dyn Proxy>, RpcError> {
        if transport.is_closed() {
            return Err(RpcError::TransportClosed);
        }
        self.proxies
            .get_or_create(uuid, transport.global_index(), transport)
    }

    /// Returns a proxy that calls back to the peer which issued `ctx`.
    pub fn proxy_from_peer(&self, ctx: &CallContext, uuid: u64) -> Result<Arc<dyn Proxy>, RpcError> {
        let transport = ctx.transport().ok_or(RpcError::TransportClosed)?;
        if transport.is_closed() {
            return Err(RpcError::TransportClosed);
        }
        self.proxies.get_or_create(uuid, ctx.global_index, &transport)
    }

    pub fn proxy_by_id(&self, id: ProxyId) -> Result<Arc<dyn Proxy>, RpcError> {
        self.proxies.get(id)
    }

    pub fn destroy_proxy(&self, id: ProxyId) {
        self.proxies.destroy(id);
    }

    /// Disconnects every proxy of a direct connection the owner has closed.
    pub fn transport_closed(&self, transport: &dyn Transport) -> usize {
        let count = self.proxies.transport_closed(transport.id());
        if count > 0 {
            tracing::info!(
                "[Rpc] transport {} ({}) closed, {} proxies disconnected",
                transport.id(),
                transport.remote_addr(),
                count
            );
        }
        count
    }

    /// Number of outbound calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    /// Reads the next complete frame, or `None` if one is not buffered yet.
    /// A malformed header closes the transport.
    fn next_frame(
        &self,
        transport: &Arc<dyn Transport>,
    ) -> Result<Option<(MessageType, BaseHeader, Bytes)>, RpcError> {
        let Some(raw) = transport.peek(BASE_HEADER_SIZE) else {
            return Ok(None);
        };
        let header = self.protocol.read_header(&raw)?;

        let ty = match validate_header(&header, self.config.max_frame_size) {
            Ok(ty) => ty,
            Err(e) => {
                tracing::error!(
                    "[Rpc] illegal frame from {} global index {}: {}",
                    transport.remote_addr(),
                    transport.global_index(),
                    e
                );
                transport.close();
                return Err(e.into());
            }
        };

        let length = header.length as usize;
        if transport.buffered() < length {
            return Ok(None);
        }
        match transport.read(length) {
            Some(frame) => Ok(Some((ty, header, frame))),
            None => Ok(None),
        }
    }

    /// Routes every complete frame buffered on `transport`. Returns the
    /// number of frames consumed. Handler errors are logged; only an illegal
    /// frame stops the loop.
    pub async fn on_message(&self, transport: &Arc<dyn Transport>) -> Result<usize, RpcError> {
        self.ensure_running()?;

        let mut routed = 0;
        while let Some((ty, _, frame)) = self.next_frame(transport)? {
            routed += 1;
            if let Err(e) = self.route(ty, frame, transport).await {
                tracing::warn!(
                    "[Rpc] {:?} from {} failed: {}",
                    ty,
                    transport.remote_addr(),
                    e
                );
            }
        }
        Ok(routed)
    }

    /// Gateway mode: frames are handed to `handler` instead of being routed
    /// locally.
    pub async fn on_proxy_message(
        &self,
        transport: &Arc<dyn Transport>,
        handler: &dyn ProxyHandler,
    ) -> Result<usize, RpcError> {
        self.ensure_running()?;

        let mut relayed = 0;
        while let Some((_, header, frame)) = self.next_frame(transport)? {
            relayed += 1;
            if let Err(e) = handler.on_relay(transport, header, frame).await {
                tracing::warn!(
                    "[Rpc] relay from {} failed: {}",
                    transport.remote_addr(),
                    e
                );
            }
        }
        Ok(relayed)
    }

    async fn route(
        &self,
        ty: MessageType,
        frame: Bytes,
        transport: &Arc<dyn Transport>,
    ) -> Result<(), RpcError> {
        match ty {
            MessageType::Request => self.on_request(frame, transport).await,
            MessageType::ProxyRequest => self.on_proxy_request(frame, transport).await,
            MessageType::Response => {
                let resp = self.protocol.parse_response(&frame)?;
                let header = resp.header;
                self.on_reply(header.call_id, header.server_id, header.error_code, resp.body)
            }
            MessageType::ProxyResponse => {
                let resp = self.protocol.parse_proxy_response(&frame)?;
                let header = resp.header;
                self.on_reply(header.call_id, header.server_id, header.error_code, resp.body)
            }
            MessageType::Ping => {
                let ping = self.protocol.parse_ping(&frame)?;
                let pong = self.protocol.pack_pong(&PongHeader::new(ping.ping_id));
                transport.send(pong)?;
                Ok(())
            }
            MessageType::Pong => {
                self.protocol.parse_pong(&frame)?;
                transport.heartbeat();
                Ok(())
            }
            MessageType::ConnTimeout => {
                let notice = self.protocol.parse_conn_timeout(&frame)?;
                tracing::info!(
                    "[Rpc] external connection {} timed out",
                    notice.global_index
                );
                self.proxies.close_outside(notice.global_index)?;
                Ok(())
            }
            MessageType::LoggedOut => {
                let notice = self.protocol.parse_logged_out(&frame)?;
                tracing::info!(
                    "[Rpc] external connection {} was logged out",
                    notice.global_index
                );
                self.proxies.close_outside(notice.global_index)?;
                Ok(())
            }
            MessageType::NotRpc
            | MessageType::EventSub
            | MessageType::EventPub
            | MessageType::EventCancel
            | MessageType::CallAlias => {
                tracing::debug!(
                    "[Rpc] ignoring {:?} frame of {} bytes from {}",
                    ty,
                    frame.len(),
                    transport.remote_addr()
                );
                Ok(())
            }
            MessageType::Invalid | MessageType::Max => {
                Err(ProtocolError::InvalidType(ty.as_u32()).into())
            }
        }
    }

    async fn on_request(&self, frame: Bytes, transport: &Arc<dyn Transport>) -> Result<(), RpcError> {
        let request = self.protocol.parse_request(&frame)?;
        let uuid = request.header.service_uuid;

        let Some(stub) = self.stubs.get(uuid) else {
            tracing::warn!(
                "[Rpc] service {:#x} not found for call {} from {}",
                uuid,
                request.header.call_id,
                transport.remote_addr()
            );
            transport.send(self.protocol.pack_response(&Response::not_found(&request)))?;
            return Err(RpcError::ServiceNotFound(uuid));
        };

        let call = StubCall::from_request(self.stubs.next_sequence(), request, transport);
        stub.enqueue(call).await
    }

    async fn on_proxy_request(
        &self,
        frame: Bytes,
        transport: &Arc<dyn Transport>,
    ) -> Result<(), RpcError> {
        let request = self.protocol.parse_proxy_request(&frame)?;
        let uuid = request.header.service_uuid;

        let Some(stub) = self.stubs.get(uuid) else {
            tracing::warn!(
                "[Rpc] service {:#x} not found for relayed call {} of {}",
                uuid,
                request.header.call_id,
                request.header.global_index
            );
            if !request.header.is_one_way() {
                transport.send(
                    self.protocol
                        .pack_proxy_response(&ProxyResponse::not_found(&request)),
                )?;
            }
            return Err(RpcError::ServiceNotFound(uuid));
        };

        let call = StubCall::from_proxy_request(self.stubs.next_sequence(), request, transport);
        stub.enqueue(call).await
    }

    /// Hands a response to the call waiting on it and refreshes the target
    /// server id of the issuing proxy.
    fn on_reply(&self, call_id: u32, server_id: u32, code: u32, body: Bytes) -> Result<(), RpcError> {
        let call = self.calls.get(call_id)?;

        if let Ok(proxy) = self.proxies.get(call.proxy_id()) {
            let target = if code == ErrorCode::Success.as_u32() {
                server_id
            } else {
                INVALID_STUB_ID
            };
            proxy.base().set_target_id(target);
        }

        if self.config.call_trace {
            tracing::debug!("[Rpc] response for call {} code {}", call_id, code);
        }
        call.deliver(Reply {
            code,
            server_id,
            body,
        });
        Ok(())
    }

    fn pack_call(&self, proxy: &dyn Proxy, call_id: u32, method_id: u32, payload: Bytes) -> Bytes {
        let base = proxy.base();
        let request = Request::new(base.service_uuid(), base.target_id(), call_id, method_id, payload);
        if base.global_index() == DIRECT_GLOBAL_INDEX {
            return self.protocol.pack_request(&request);
        }

        let mut relayed = ProxyRequest::from_request(&request, base.global_index());
        relayed.header = ProxyCallHeader {
            one_way: u16::from(proxy.is_one_way(method_id)),
            ..relayed.header
        };
        self.protocol.pack_proxy_request(&relayed)
    }

    /// Calls `method_id` on the service behind `proxy` and waits for the
    /// result.
    ///
    /// A `timeout_ms` of 0 uses the configured default; `retries` is clamped
    /// to the configured maximum. Each retry resends the same frame under the
    /// same call id. One-way methods return as soon as the request is sent.
    pub async fn call(
        &self,
        proxy: &Arc<dyn Proxy>,
        method_id: u32,
        timeout_ms: u64,
        retries: u32,
        payload: Bytes,
    ) -> Result<Bytes, RpcError> {
        let (call, mut rx) =
            self.calls
                .create_call(proxy.id(), method_id, timeout_ms, retries, proxy.global_index());
        self.calls.add(call.clone())?;
        let _guard = self.calls.guard(call.call_id());

        if !proxy.is_connected() {
            tracing::error!(
                "[Rpc] proxy {} of {} ({:#x}) global index {} is disconnected, cannot call {}",
                proxy.id(),
                proxy.service_name(),
                proxy.uuid(),
                proxy.global_index(),
                proxy.signature(method_id)
            );
            return Err(RpcError::ProxyDisconnected(proxy.id()));
        }

        let frame = self.pack_call(proxy.as_ref(), call.call_id(), method_id, payload);
        call.set_request(frame.clone());
        let transport = proxy.base().transport();
        transport.send(frame)?;

        if proxy.is_one_way(method_id) {
            return Ok(Bytes::new());
        }

        let wait = self.config.call_timeout(call.timeout_ms());
        let mut reply = wait_reply(&mut rx, wait).await;

        if reply.is_none() {
            tracing::warn!(
                "[Rpc] call {} to {} ({:#x}) method {} timed out, {} retries left",
                call.call_id(),
                proxy.service_name(),
                proxy.uuid(),
                proxy.signature(method_id),
                call.retries_left()
            );
            while call.take_retry() {
                if !proxy.is_connected() {
                    tracing::warn!(
                        "[Rpc] proxy {} of {} lost during retry of call {}",
                        proxy.id(),
                        proxy.service_name(),
                        call.call_id()
                    );
                    return Err(RpcError::ProxyDisconnected(proxy.id()));
                }
                transport.send(call.request())?;
                reply = wait_reply(&mut rx, wait).await;
                if reply.is_some() {
                    break;
                }
            }
        }

        let Some(reply) = reply else {
            tracing::warn!(
                "[Rpc] call {} to {} method {} timed out, last code {}",
                call.call_id(),
                proxy.service_name(),
                proxy.signature(method_id),
                call.error_code()
            );
            return Err(RpcError::Timeout {
                call_id: call.call_id(),
            });
        };

        if reply.code == ErrorCode::Success.as_u32() {
            return Ok(reply.body);
        }
        let err = RpcError::from_code(reply.code, call.call_id(), reply.body);
        tracing::warn!(
            "[Rpc] service {:#x} method {} failed: {}",
            proxy.uuid(),
            proxy.signature(method_id),
            err
        );
        Err(err)
    }
}

/// Waits for a non-timeout reply. A timeout reply or an elapsed timer both
/// yield `None`.
async fn wait_reply(rx: &mut mpsc::Receiver<Reply>, wait: Duration) -> Option<Reply> {
    match tokio::time::timeout(wait, rx.recv()).await {
        Ok(Some(reply)) if reply.code != ErrorCode::Timeout.as_u32() => Some(reply),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyBase;
    use crate::stub::tests::{EchoService, ECHO_UUID};
    use crate::transport::MemoryTransport;
    use bytes::{BufMut, BytesMut};
    use futures::future::BoxFuture;
    use idlrpc_protocol::{ConnTimeoutHeader, GlobalIndex, LoggedOutHeader, PingHeader};
    use std::sync::atomic::Ordering;
    use std::time::Instant;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::task::JoinHandle;

    struct EchoProxy {
        base: ProxyBase,
    }

    impl Proxy for EchoProxy {
        fn base(&self) -> &ProxyBase {
            &self.base
        }

        fn service_name(&self) -> &str {
            "EchoService"
        }

        fn signature(&self, _method_id: u32) -> &str {
            "EchoService::method"
        }

        fn is_one_way(&self, method_id: u32) -> bool {
            method_id == 4
        }
    }

    fn echo_factory() -> ProxyFactory {
        Arc::new(|base| Arc::new(EchoProxy { base }) as Arc<dyn Proxy>)
    }

    fn started() -> Arc<Runtime> {
        started_with(RuntimeConfig {
            default_timeout_ms: 1000,
            ..Default::default()
        })
    }

    fn started_with(config: RuntimeConfig) -> Arc<Runtime> {
        let rt = Arc::new(Runtime::new(config));
        rt.start().unwrap();
        rt
    }

    fn memory(
        id: u64,
        global_index: GlobalIndex,
    ) -> (Arc<MemoryTransport>, Arc<dyn Transport>, UnboundedReceiver<Bytes>) {
        let (mem, rx) = MemoryTransport::new(id, global_index);
        let transport: Arc<dyn Transport> = mem.clone();
        (mem, transport, rx)
    }

    /// Feeds every frame sent on one side into the other side's runtime.
    fn pump(
        mut rx: UnboundedReceiver<Bytes>,
        dest: Arc<MemoryTransport>,
        runtime: Arc<Runtime>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let transport: Arc<dyn Transport> = dest.clone();
            while let Some(frame) = rx.recv().await {
                dest.push(&frame);
                if runtime.on_message(&transport).await.is_err() {
                    break;
                }
            }
        })
    }

    async fn recv(rx: &mut UnboundedReceiver<Bytes>) -> Bytes {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn raw_header(length: u32, msg_type: u32) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(length);
        buf.put_u32(msg_type);
        buf
    }

    #[tokio::test]
    async fn test_direct_request_scenario() {
        let rt = started();
        let service = Arc::new(EchoService::default());
        rt.register_service(service.clone()).unwrap();

        let (mem, transport, mut out) = memory(1, 0);
        let request = Request::new(ECHO_UUID, 0, 1, 1, Bytes::from_static(b"hello"));
        mem.push(&BinaryProtocol.pack_request(&request));

        assert_eq!(rt.on_message(&transport).await.unwrap(), 1);

        let resp = BinaryProtocol.parse_response(&recv(&mut out).await).unwrap();
        assert_eq!(resp.header.call_id, 1);
        assert_eq!(resp.code(), Some(ErrorCode::Success));
        assert_eq!(&resp.body[..], b"hello");

        rt.shutdown().await.unwrap();
        assert!(out.try_recv().is_err());
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_service_scenario() {
        let rt = started();
        let service = Arc::new(EchoService::default());
        rt.register_service(service.clone()).unwrap();

        let (mem, transport, mut out) = memory(1, 0);
        let request = Request::new(0xDEAD, 0, 5, 1, Bytes::from_static(b"hello"));
        mem.push(&BinaryProtocol.pack_request(&request));

        assert_eq!(rt.on_message(&transport).await.unwrap(), 1);

        let resp = BinaryProtocol.parse_response(&recv(&mut out).await).unwrap();
        assert_eq!(resp.header.call_id, 5);
        assert_eq!(resp.code(), Some(ErrorCode::ServiceNotFound));
        assert!(out.try_recv().is_err());
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
        assert!(!transport.is_closed());

        rt.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_frame_not_consumed() {
        let rt = started();
        rt.register_service(Arc::new(EchoService::default())).unwrap();

        let (mem, transport, mut out) = memory(1, 0);
        let frame = BinaryProtocol.pack_request(&Request::new(
            ECHO_UUID,
            0,
            1,
            1,
            Bytes::from_static(b"hello"),
        ));

        // Not even a full base header yet.
        mem.push(&frame[..5]);
        assert_eq!(rt.on_message(&transport).await.unwrap(), 0);
        assert_eq!(transport.buffered(), 5);

        // Header complete, body still missing.
        mem.push(&frame[5..BASE_HEADER_SIZE + 3]);
        assert_eq!(rt.on_message(&transport).await.unwrap(), 0);
        assert_eq!(transport.buffered(), BASE_HEADER_SIZE + 3);

        mem.push(&frame[BASE_HEADER_SIZE + 3..]);
        assert_eq!(rt.on_message(&transport).await.unwrap(), 1);
        assert_eq!(transport.buffered(), 0);

        let resp = BinaryProtocol.parse_response(&recv(&mut out).await).unwrap();
        assert_eq!(&resp.body[..], b"hello");

        rt.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_drains_all_buffered_frames() {
        let rt = started();
        let (mem, transport, mut out) = memory(1, 0);

        mem.push(&BinaryProtocol.pack_ping(&PingHeader::new(1)));
        mem.push(&BinaryProtocol.pack_ping(&PingHeader::new(2)));
        let third = BinaryProtocol.pack_ping(&PingHeader::new(3));
        mem.push(&third[..4]);

        assert_eq!(rt.on_message(&transport).await.unwrap(), 2);
        assert_eq!(transport.buffered(), 4);

        let first = BinaryProtocol.parse_pong(&recv(&mut out).await).unwrap();
        let second = BinaryProtocol.parse_pong(&recv(&mut out).await).unwrap();
        assert_eq!((first.ping_id, second.ping_id), (1, 2));
    }

    #[tokio::test]
    async fn test_zero_length_closes_transport() {
        let rt = started();
        let (mem, transport, _out) = memory(1, 0);
        mem.push(&raw_header(0, 1));

        let result = rt.on_message(&transport).await;
        assert!(matches!(
            result,
            Err(RpcError::Protocol(ProtocolError::InvalidLength(0)))
        ));
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_type_closes_transport() {
        for bad in [0u32, 14, 200] {
            let rt = started();
            let (mem, transport, _out) = memory(1, 0);
            mem.push(&raw_header(8, bad));

            let result = rt.on_message(&transport).await;
            assert!(matches!(
                result,
                Err(RpcError::Protocol(ProtocolError::InvalidType(t))) if t == bad
            ));
            assert!(transport.is_closed());
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_transport() {
        let rt = started_with(RuntimeConfig {
            max_frame_size: 64,
            ..Default::default()
        });
        let (mem, transport, _out) = memory(1, 0);
        mem.push(&raw_header(100, 1));

        let result = rt.on_message(&transport).await;
        assert!(matches!(
            result,
            Err(RpcError::Protocol(ProtocolError::FrameTooLarge { size: 100, max: 64 }))
        ));
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn test_ping_pong_and_heartbeat() {
        let rt = started();
        let (mem, transport, mut out) = memory(1, 0);

        mem.push(&BinaryProtocol.pack_ping(&PingHeader::new(0xABCDEF)));
        rt.on_message(&transport).await.unwrap();
        let pong = BinaryProtocol.parse_pong(&recv(&mut out).await).unwrap();
        assert_eq!(pong.ping_id, 0xABCDEF);

        mem.push(&BinaryProtocol.pack_pong(&PongHeader::new(1)));
        rt.on_message(&transport).await.unwrap();
        assert_eq!(mem.heartbeats(), 1);
    }

    #[tokio::test]
    async fn test_not_rpc_frames_ignored() {
        let rt = started();
        let (mem, transport, mut out) = memory(1, 0);

        let mut junk = raw_header(12, MessageType::NotRpc.as_u32());
        junk.put_slice(b"junk");
        mem.push(&junk);
        mem.push(&raw_header(8, MessageType::EventPub.as_u32()));
        mem.push(&BinaryProtocol.pack_ping(&PingHeader::new(9)));

        assert_eq!(rt.on_message(&transport).await.unwrap(), 3);
        assert!(!transport.is_closed());
        let pong = BinaryProtocol.parse_pong(&recv(&mut out).await).unwrap();
        assert_eq!(pong.ping_id, 9);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_loop() {
        let rt = started();
        let (mem, transport, mut out) = memory(1, 0);

        // A response for a call nobody is waiting on.
        mem.push(&BinaryProtocol.pack_response(&Response::success(77, Bytes::new())));
        mem.push(&BinaryProtocol.pack_ping(&PingHeader::new(4)));

        assert_eq!(rt.on_message(&transport).await.unwrap(), 2);
        assert!(BinaryProtocol.parse_pong(&recv(&mut out).await).is_ok());
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let client = started();
        let server = started();
        server
            .register_service(Arc::new(EchoService::default()))
            .unwrap();

        let (client_mem, client_t, client_out) = memory(1, 0);
        let (server_mem, _server_t, server_out) = memory(2, 0);
        pump(client_out, server_mem, server.clone());
        pump(server_out, client_mem, client.clone());

        client.add_proxy_factory(ECHO_UUID, echo_factory());
        let proxy = client.service_proxy(ECHO_UUID, &client_t).unwrap();

        let body = client
            .call(&proxy, 1, 0, 0, Bytes::from_static(b"ping"))
            .await
            .unwrap();
        assert_eq!(&body[..], b"ping");

        let err = client.call(&proxy, 2, 0, 0, Bytes::new()).await.unwrap_err();
        match err {
            RpcError::RemoteFailed(diag) => assert_eq!(&diag[..], b"rejected"),
            other => panic!("unexpected {:?}", other),
        }

        let err = client.call(&proxy, 3, 0, 0, Bytes::new()).await.unwrap_err();
        match err {
            RpcError::RemoteFailed(diag) => assert_eq!(&diag[..], b"exploded"),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(client.pending_calls(), 0);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_call_remote_not_found() {
        let client = started();
        let server = started();

        let (client_mem, client_t, client_out) = memory(1, 0);
        let (server_mem, _server_t, server_out) = memory(2, 0);
        pump(client_out, server_mem, server.clone());
        pump(server_out, client_mem, client.clone());

        client.add_proxy_factory(0xBEEF, echo_factory());
        let proxy = client.service_proxy(0xBEEF, &client_t).unwrap();

        let err = client.call(&proxy, 1, 0, 3, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::RemoteNotFound));
        assert_eq!(proxy.base().target_id(), INVALID_STUB_ID);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_relayed_call_round_trip() {
        let client = started();
        let server = started();
        server
            .register_service(Arc::new(EchoService::default()))
            .unwrap();

        // The client side sees the service through a gateway identity.
        let (client_mem, client_t, client_out) = memory(1, 500);
        let (server_mem, _server_t, mut server_out) = memory(2, 0);
        pump(client_out, server_mem.clone(), server.clone());

        client.add_proxy_factory(ECHO_UUID, echo_factory());
        let proxy = client.service_proxy(ECHO_UUID, &client_t).unwrap();
        assert_eq!(proxy.global_index(), 500);

        let caller = {
            let client = client.clone();
            let proxy = proxy.clone();
            tokio::spawn(async move {
                client
                    .call(&proxy, 1, 0, 0, Bytes::from_static(b"via gateway"))
                    .await
            })
        };

        let frame = recv(&mut server_out).await;
        let resp = BinaryProtocol.parse_proxy_response(&frame).unwrap();
        assert_eq!(resp.global_index(), 500);

        client_mem.push(&frame);
        client.on_message(&client_t).await.unwrap();

        let body = caller.await.unwrap().unwrap();
        assert_eq!(&body[..], b"via gateway");
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_one_way_call_returns_immediately() {
        let client = started();
        let (_mem, transport, mut out) = memory(1, 0);
        client.add_proxy_factory(ECHO_UUID, echo_factory());
        let proxy = client.service_proxy(ECHO_UUID, &transport).unwrap();

        let start = Instant::now();
        let body = client
            .call(&proxy, 4, 5000, 5, Bytes::from_static(b"note"))
            .await
            .unwrap();
        assert!(body.is_empty());
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(client.pending_calls(), 0);

        let req = BinaryProtocol.parse_request(&recv(&mut out).await).unwrap();
        assert_eq!(req.header.method_id, 4);
    }

    #[tokio::test]
    async fn test_timeout_after_all_retries() {
        let client = started();
        let (_mem, transport, mut out) = memory(1, 0);
        client.add_proxy_factory(ECHO_UUID, echo_factory());
        let proxy = client.service_proxy(ECHO_UUID, &transport).unwrap();

        let start = Instant::now();
        let err = client
            .call(&proxy, 1, 50, 2, Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, RpcError::Timeout { .. }));
        assert!(err.is_retryable());
        assert!(elapsed >= Duration::from_millis(150), "{:?}", elapsed);
        assert_eq!(client.pending_calls(), 0);

        // Original send plus two retries, all the same bytes.
        let first = out.try_recv().unwrap();
        assert_eq!(out.try_recv().unwrap(), first);
        assert_eq!(out.try_recv().unwrap(), first);
        assert!(out.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_retry_after_timeout_reply() {
        let client = started();
        let (client_mem, client_t, mut client_out) = memory(1, 0);
        client.add_proxy_factory(ECHO_UUID, echo_factory());
        let proxy = client.service_proxy(ECHO_UUID, &client_t).unwrap();

        // Answers the first attempt with a timeout code, the second with success.
        let server = {
            let client = client.clone();
            tokio::spawn(async move {
                let mut frames = Vec::new();
                for (code, server_id) in [(ErrorCode::Timeout, 9), (ErrorCode::Success, 7)] {
                    let frame = recv(&mut client_out).await;
                    let req = BinaryProtocol.parse_request(&frame).unwrap();
                    let resp = Response::new(server_id, req.header.call_id, code, req.body.clone());
                    client_mem.push(&BinaryProtocol.pack_response(&resp));
                    client.on_message(&client_t).await.unwrap();
                    frames.push(frame);
                }
                frames
            })
        };

        let body = client
            .call(&proxy, 1, 1000, 3, Bytes::from_static(b"retry me"))
            .await
            .unwrap();
        assert_eq!(&body[..], b"retry me");
        assert_eq!(proxy.base().target_id(), 7);

        let frames = server.await.unwrap();
        assert_eq!(frames[0], frames[1]);
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_disconnected_proxy_fails_fast() {
        let client = started();
        let (_mem, transport, mut out) = memory(1, 0);
        client.add_proxy_factory(ECHO_UUID, echo_factory());
        let proxy = client.service_proxy(ECHO_UUID, &transport).unwrap();

        assert_eq!(client.transport_closed(transport.as_ref()), 1);
        let err = client.call(&proxy, 1, 0, 0, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::ProxyDisconnected(id) if id == proxy.id()));
        assert!(out.try_recv().is_err());
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_during_retry() {
        let client = started();
        let (_mem, transport, _out) = memory(1, 0);
        client.add_proxy_factory(ECHO_UUID, echo_factory());
        let proxy = client.service_proxy(ECHO_UUID, &transport).unwrap();

        {
            let client = client.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(70)).await;
                client.transport_closed(transport.as_ref());
            });
        }

        let err = client.call(&proxy, 1, 50, 5, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, RpcError::ProxyDisconnected(_)));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_conn_timeout_notice_disconnects_proxies() {
        let rt = started();
        rt.add_proxy_factory(ECHO_UUID, echo_factory());

        let (mem, gateway, _out) = memory(1, 42);
        let proxy = rt.service_proxy(ECHO_UUID, &gateway).unwrap();
        assert!(proxy.is_connected());

        mem.push(&BinaryProtocol.pack_conn_timeout(&ConnTimeoutHeader::new(42)));
        rt.on_message(&gateway).await.unwrap();

        assert!(!proxy.is_connected());
        assert!(!gateway.is_closed());
        assert!(rt.proxy_by_id(proxy.id()).is_err());

        let fresh = rt.service_proxy(ECHO_UUID, &gateway).unwrap();
        assert_ne!(fresh.id(), proxy.id());
        assert!(fresh.is_connected());
    }

    #[tokio::test]
    async fn test_logged_out_notice_disconnects_peer_proxy() {
        let rt = started();
        rt.add_proxy_factory(ECHO_UUID, echo_factory());

        let (mem, gateway, _out) = memory(1, 0);
        let inbound = ProxyRequest::from_request(&Request::new(1, 0, 1, 1, Bytes::new()), 77);
        let ctx = StubCall::from_proxy_request(1, inbound, &gateway).context();

        let proxy = rt.proxy_from_peer(&ctx, ECHO_UUID).unwrap();
        assert_eq!(proxy.global_index(), 77);
        assert_eq!(proxy.base().transport().id(), gateway.id());

        mem.push(&BinaryProtocol.pack_logged_out(&LoggedOutHeader::new(77)));
        rt.on_message(&gateway).await.unwrap();
        assert!(!proxy.is_connected());
    }

    #[tokio::test]
    async fn test_proxy_api() {
        let rt = started();
        let (_mem, transport, _out) = memory(1, 0);

        assert!(matches!(
            rt.service_proxy(ECHO_UUID, &transport),
            Err(RpcError::FactoryNotFound(ECHO_UUID))
        ));

        rt.add_proxy_factory(ECHO_UUID, echo_factory());
        let proxy = rt.service_proxy(ECHO_UUID, &transport).unwrap();
        assert_eq!(rt.proxy_by_id(proxy.id()).unwrap().id(), proxy.id());

        rt.destroy_proxy(proxy.id());
        assert!(matches!(
            rt.proxy_by_id(proxy.id()),
            Err(RpcError::ProxyNotFound(_))
        ));

        transport.close();
        assert!(matches!(
            rt.service_proxy(ECHO_UUID, &transport),
            Err(RpcError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let rt = Arc::new(Runtime::new(RuntimeConfig::default()));
        let (_mem, transport, _out) = memory(1, 0);

        assert_eq!(rt.status(), RuntimeStatus::NotInit);
        assert!(matches!(rt.on_message(&transport).await, Err(RpcError::NotRunning)));
        assert!(matches!(
            rt.register_service(Arc::new(EchoService::default())),
            Err(RpcError::NotRunning)
        ));
        assert!(matches!(rt.shutdown().await, Err(RpcError::NotRunning)));

        rt.start().unwrap();
        rt.start().unwrap();
        assert_eq!(rt.status(), RuntimeStatus::Running);

        let service = Arc::new(EchoService::default());
        rt.register_service(service.clone()).unwrap();
        assert!(matches!(
            rt.register_service(Arc::new(EchoService::default())),
            Err(RpcError::ServiceExists(ECHO_UUID))
        ));
        rt.tick().unwrap();
        assert_eq!(service.ticks.load(Ordering::SeqCst), 1);

        rt.shutdown().await.unwrap();
        assert_eq!(rt.status(), RuntimeStatus::Closed);
        assert!(service.destroyed.load(Ordering::SeqCst));

        assert!(matches!(rt.shutdown().await, Err(RpcError::NotRunning)));
        assert!(matches!(rt.tick(), Err(RpcError::NotRunning)));
        assert!(matches!(rt.start(), Err(RpcError::NotRunning)));
        assert!(matches!(rt.on_message(&transport).await, Err(RpcError::NotRunning)));
    }

    #[derive(Default)]
    struct RecordingRelay {
        seen: parking_lot::Mutex<Vec<(u32, usize)>>,
    }

    impl ProxyHandler for RecordingRelay {
        fn on_relay<'a>(
            &'a self,
            _transport: &'a Arc<dyn Transport>,
            header: BaseHeader,
            frame: Bytes,
        ) -> BoxFuture<'a, Result<(), RpcError>> {
            Box::pin(async move {
                self.seen.lock().push((header.msg_type, frame.len()));
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_relay_mode_hands_frames_to_handler() {
        let rt = started();
        let service = Arc::new(EchoService::default());
        rt.register_service(service.clone()).unwrap();

        let (mem, transport, mut out) = memory(1, 0);
        let request = BinaryProtocol.pack_request(&Request::new(
            ECHO_UUID,
            0,
            1,
            1,
            Bytes::from_static(b"abc"),
        ));
        mem.push(&request);
        mem.push(&BinaryProtocol.pack_ping(&PingHeader::new(1)));

        let relay = RecordingRelay::default();
        assert_eq!(rt.on_proxy_message(&transport, &relay).await.unwrap(), 2);

        let seen = relay.seen.lock().clone();
        assert_eq!(
            seen,
            vec![(MessageType::Request.as_u32(), request.len()), (MessageType::Ping.as_u32(), 16)]
        );
        assert!(out.try_recv().is_err());
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);

        rt.shutdown().await.unwrap();
    }
}
