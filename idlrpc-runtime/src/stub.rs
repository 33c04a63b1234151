//! Server-side service wrapper and its worker pool.
//!
//! Each registered service gets a bounded call queue and a fixed number of
//! worker tasks. Workers run method bodies with panic isolation and send
//! exactly one reply per non-one-way call.

use crate::config::RuntimeConfig;
use crate::error::RpcError;
use crate::service::{panic_diagnostics, CallContext, Service, ServiceContext};
use crate::transport::Transport;
use bytes::Bytes;
use futures::FutureExt;
use idlrpc_protocol::{
    ErrorCode, GlobalIndex, Protocol, ProxyRequest, ProxyResponse, Request, Response,
    DIRECT_GLOBAL_INDEX,
};
use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// One inbound invocation, consumed by exactly one worker.
pub struct StubCall {
    pub sequence: u64,
    pub service_uuid: u64,
    pub server_id: u32,
    pub call_id: u32,
    pub method_id: u32,
    pub global_index: GlobalIndex,
    /// Set by the gateway on relayed calls.
    pub one_way: bool,
    pub payload: Bytes,
    transport: Weak<dyn Transport>,
}

impl StubCall {
    pub fn from_request(sequence: u64, request: Request, transport: &Arc<dyn Transport>) -> Self {
        let header = request.header;
        Self {
            sequence,
            service_uuid: header.service_uuid,
            server_id: header.server_id,
            call_id: header.call_id,
            method_id: header.method_id,
            global_index: DIRECT_GLOBAL_INDEX,
            one_way: false,
            payload: request.body,
            transport: Arc::downgrade(transport),
        }
    }

    pub fn from_proxy_request(
        sequence: u64,
        request: ProxyRequest,
        transport: &Arc<dyn Transport>,
    ) -> Self {
        let header = request.header;
        Self {
            sequence,
            service_uuid: header.service_uuid,
            server_id: header.server_id,
            call_id: header.call_id,
            method_id: header.method_id,
            global_index: header.global_index,
            one_way: header.is_one_way(),
            payload: request.body,
            transport: Arc::downgrade(transport),
        }
    }

    pub fn context(&self) -> CallContext {
        CallContext {
            sequence: self.sequence,
            service_uuid: self.service_uuid,
            call_id: self.call_id,
            method_id: self.method_id,
            global_index: self.global_index,
            one_way: self.one_way,
            transport: self.transport.clone(),
        }
    }

    /// Sends the reply variant matching the inbound call. Server id is
    /// always 0. A reply to a dropped or closed transport is discarded.
    pub fn reply(&self, protocol: &dyn Protocol, code: ErrorCode, body: Bytes) -> Result<(), RpcError> {
        let Some(transport) = self.transport.upgrade() else {
            tracing::debug!("[Service] transport gone, dropping reply to call {}", self.call_id);
            return Ok(());
        };
        if transport.is_closed() {
            tracing::debug!("[Service] transport closed, dropping reply to call {}", self.call_id);
            return Ok(());
        }

        let frame = if self.global_index == DIRECT_GLOBAL_INDEX {
            protocol.pack_response(&Response::new(0, self.call_id, code, body))
        } else {
            protocol.pack_proxy_response(&ProxyResponse::new(
                0,
                self.call_id,
                code,
                self.global_index,
                body,
            ))
        };
        transport.send(frame)?;
        Ok(())
    }
}

/// Wraps a registered service: queue, workers and lifecycle.
pub struct StubWrapper {
    service: Arc<dyn Service>,
    protocol: Arc<dyn Protocol>,
    workers: usize,
    stack_trace: bool,
    call_trace: bool,
    closed: AtomicBool,
    queue: Mutex<Option<mpsc::Sender<StubCall>>>,
    receiver: Mutex<Option<mpsc::Receiver<StubCall>>>,
    stop_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    live_workers: AtomicUsize,
}

impl StubWrapper {
    pub fn new(service: Arc<dyn Service>, protocol: Arc<dyn Protocol>, config: &RuntimeConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.call_queue_capacity.max(1));
        let (stop_tx, _) = broadcast::channel(1);
        let workers = config.workers_for(service.concurrency());

        Arc::new(Self {
            service,
            protocol,
            workers,
            stack_trace: config.stack_trace,
            call_trace: config.call_trace,
            closed: AtomicBool::new(false),
            queue: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            stop_tx,
            handles: Mutex::new(Vec::new()),
            live_workers: AtomicUsize::new(0),
        })
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    pub fn uuid(&self) -> u64 {
        self.service.uuid()
    }

    pub fn name(&self) -> &str {
        self.service.name()
    }

    /// Runs the post-construction hook. A panic or a false return is an
    /// initialisation failure.
    pub fn init(&self, ctx: &ServiceContext) -> Result<(), RpcError> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.service.on_after_fork(ctx)));
        match result {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::warn!("[Service] {} ({:#x}) refused to start", self.name(), self.uuid());
                Err(RpcError::ServiceInit(self.name().to_string()))
            }
            Err(panic) => {
                tracing::error!(
                    "[Service] {} ({:#x}) panicked on init: {:?}",
                    self.name(),
                    self.uuid(),
                    panic_diagnostics(panic.as_ref())
                );
                self.log_backtrace();
                Err(RpcError::ServiceInit(self.name().to_string()))
            }
        }
    }

    /// Spawns the worker tasks. Must run inside a Tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let Some(rx) = self.receiver.lock().take() else {
            tracing::warn!("[Service] {} already started", self.name());
            return;
        };
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = self.handles.lock();
        for index in 0..self.workers {
            let stub = self.clone();
            let rx = rx.clone();
            let stop = self.stop_tx.subscribe();
            self.live_workers.fetch_add(1, Ordering::SeqCst);
            handles.push(tokio::spawn(async move {
                stub.worker_loop(index, rx, stop).await;
            }));
        }

        tracing::info!(
            "[Service] {} ({:#x}) started with {} worker(s)",
            self.name(),
            self.uuid(),
            self.workers
        );
    }

    async fn worker_loop(
        self: Arc<Self>,
        index: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<StubCall>>>,
        mut stop: broadcast::Receiver<()>,
    ) {
        loop {
            let next = async { rx.lock().await.recv().await };
            let call = tokio::select! {
                biased;
                _ = stop.recv() => break,
                call = next => match call {
                    Some(call) => call,
                    None => break,
                },
            };

            let survived = match AssertUnwindSafe(self.dispatch(call)).catch_unwind().await {
                Ok(survived) => survived,
                Err(panic) => {
                    tracing::error!(
                        "[Service] {} worker {} panicked outside a method body: {}",
                        self.name(),
                        index,
                        String::from_utf8_lossy(&panic_diagnostics(panic.as_ref()))
                    );
                    false
                }
            };
            if !survived {
                tracing::error!(
                    "[Service] {} worker {} exiting after panic",
                    self.name(),
                    index
                );
                break;
            }
        }
        self.live_workers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Runs one call. Returns false if service code panicked.
    async fn dispatch(&self, call: StubCall) -> bool {
        let method_id = call.method_id;
        let one_way = match panic::catch_unwind(AssertUnwindSafe(|| {
            call.one_way || self.service.is_one_way(method_id)
        })) {
            Ok(one_way) => one_way,
            Err(panic) => {
                let diagnostics = panic_diagnostics(panic.as_ref());
                tracing::error!(
                    "[Service] {} ({:#x}) call {} method {} panicked in is_one_way: {}",
                    self.name(),
                    self.uuid(),
                    call.call_id,
                    method_id,
                    String::from_utf8_lossy(&diagnostics)
                );
                self.log_backtrace();
                if !call.one_way {
                    self.send_reply(&call, ErrorCode::ServiceError, diagnostics);
                }
                return false;
            }
        };

        if self.call_trace {
            tracing::debug!(
                "[Service] {} call {} method {} seq {} global index {}",
                self.name(),
                call.call_id,
                self.signature(method_id),
                call.sequence,
                call.global_index
            );
        }

        let ctx = call.context();
        let payload = call.payload.clone();
        let service = &self.service;
        let result = AssertUnwindSafe(async move { service.call(ctx, method_id, payload).await })
            .catch_unwind()
            .await;

        let (code, body, survived) = match result {
            Ok(Ok(body)) => (ErrorCode::Success, body, true),
            Ok(Err(err)) => {
                tracing::warn!(
                    "[Service] {} ({:#x}) call {} method {} failed: {}",
                    self.name(),
                    self.uuid(),
                    call.call_id,
                    self.signature(method_id),
                    err
                );
                (ErrorCode::ServiceError, err.diagnostics(), true)
            }
            Err(panic) => {
                let diagnostics = panic_diagnostics(panic.as_ref());
                tracing::error!(
                    "[Service] {} ({:#x}) call {} method {} panicked: {}",
                    self.name(),
                    self.uuid(),
                    call.call_id,
                    self.signature(method_id),
                    String::from_utf8_lossy(&diagnostics)
                );
                self.log_backtrace();
                (ErrorCode::ServiceError, diagnostics, false)
            }
        };

        if !one_way {
            self.send_reply(&call, code, body);
        }
        survived
    }

    fn send_reply(&self, call: &StubCall, code: ErrorCode, body: Bytes) {
        if let Err(e) = call.reply(self.protocol.as_ref(), code, body) {
            tracing::warn!(
                "[Service] {} failed to reply to call {}: {}",
                self.name(),
                call.call_id,
                e
            );
        }
    }

    /// Method name for logs. Falls back to the numeric id if the hook panics.
    fn signature(&self, method_id: u32) -> String {
        panic::catch_unwind(AssertUnwindSafe(|| self.service.signature(method_id).to_string()))
            .unwrap_or_else(|_| format!("#{}", method_id))
    }

    fn log_backtrace(&self) {
        if self.stack_trace {
            tracing::error!("trace back: {}", Backtrace::force_capture());
        }
    }

    /// Queues a call for the workers. Waits while the queue is full.
    pub async fn enqueue(&self, call: StubCall) -> Result<(), RpcError> {
        if self.closed.load(Ordering::Acquire) {
            tracing::warn!(
                "[Service] {} is shut down, rejecting call {}",
                self.name(),
                call.call_id
            );
            return Err(RpcError::ServiceShutdown(self.name().to_string()));
        }

        let tx = self
            .queue
            .lock()
            .clone()
            .ok_or_else(|| RpcError::ServiceShutdown(self.name().to_string()))?;
        tx.send(call)
            .await
            .map_err(|_| RpcError::ServiceShutdown(self.name().to_string()))
    }

    /// Runs the tick hook, isolating panics.
    pub fn tick(&self) {
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| self.service.on_tick())) {
            tracing::warn!(
                "[Service] {} ({:#x}) panicked on tick: {}",
                self.name(),
                self.uuid(),
                String::from_utf8_lossy(&panic_diagnostics(panic.as_ref()))
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Workers still running.
    pub fn live_workers(&self) -> usize {
        self.live_workers.load(Ordering::SeqCst)
    }

    /// Stops the workers and runs the teardown hook. Only the first call has
    /// any effect.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("[Service] {} ({:#x}) closed more than once", self.name(), self.uuid());
            return;
        }

        self.queue.lock().take();
        let _ = self.stop_tx.send(());

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("[Service] {} worker terminated abnormally: {}", self.name(), e);
            }
        }

        if let Err(panic) =
            panic::catch_unwind(AssertUnwindSafe(|| self.service.on_before_destroy()))
        {
            tracing::warn!(
                "[Service] {} panicked on destroy: {}",
                self.name(),
                String::from_utf8_lossy(&panic_diagnostics(panic.as_ref()))
            );
        }
        tracing::info!("[Service] {} ({:#x}) stopped", self.name(), self.uuid());
    }
}
