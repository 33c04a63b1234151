//! idlrpc - loopback runner
//!
//! Starts a server and a client runtime joined by an in-memory transport
//! pair, registers a greeter service and drives a few calls through it.

use bytes::Bytes;
use futures::future::BoxFuture;
use idlrpc_runtime::{
    CallContext, MemoryTransport, Proxy, ProxyBase, Runtime, RuntimeConfig, Service,
    ServiceContext, ServiceError, Transport,
};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

const GREETER_UUID: u64 = 0x6EE7_0001;
const METHOD_GREET: u32 = 1;
const METHOD_NOTIFY: u32 = 2;

#[derive(Default)]
struct Greeter {
    prefix: OnceLock<String>,
}

impl Service for Greeter {
    fn uuid(&self) -> u64 {
        GREETER_UUID
    }

    fn name(&self) -> &str {
        "Greeter"
    }

    fn signature(&self, method_id: u32) -> &str {
        match method_id {
            METHOD_GREET => "Greeter::greet",
            METHOD_NOTIFY => "Greeter::notify",
            _ => "Greeter::unknown",
        }
    }

    fn concurrency(&self) -> usize {
        2
    }

    fn is_one_way(&self, method_id: u32) -> bool {
        method_id == METHOD_NOTIFY
    }

    fn call(
        &self,
        ctx: CallContext,
        method_id: u32,
        payload: Bytes,
    ) -> BoxFuture<'_, Result<Bytes, ServiceError>> {
        Box::pin(async move {
            match method_id {
                METHOD_GREET => {
                    let name = String::from_utf8(payload.to_vec())
                        .map_err(|e| ServiceError::InvalidArguments(e.to_string()))?;
                    let prefix = self.prefix.get().map(String::as_str).unwrap_or("hello");
                    Ok(Bytes::from(format!("{}, {}", prefix, name)))
                }
                METHOD_NOTIFY => {
                    tracing::info!(
                        "[Greeter] notice #{}: {}",
                        ctx.sequence,
                        String::from_utf8_lossy(&payload)
                    );
                    Ok(Bytes::new())
                }
                other => Err(ServiceError::MethodNotFound(other)),
            }
        })
    }

    fn on_after_fork(&self, ctx: &ServiceContext) -> bool {
        if let Some(prefix) = ctx.user_data::<String>() {
            let _ = self.prefix.set(prefix.clone());
        }
        true
    }

    fn on_before_destroy(&self) -> bool {
        tracing::info!("[Greeter] destroyed");
        true
    }
}

struct GreeterProxy {
    base: ProxyBase,
}

impl Proxy for GreeterProxy {
    fn base(&self) -> &ProxyBase {
        &self.base
    }

    fn service_name(&self) -> &str {
        "Greeter"
    }

    fn signature(&self, method_id: u32) -> &str {
        match method_id {
            METHOD_GREET => "Greeter::greet",
            METHOD_NOTIFY => "Greeter::notify",
            _ => "Greeter::unknown",
        }
    }

    fn is_one_way(&self, method_id: u32) -> bool {
        method_id == METHOD_NOTIFY
    }
}

/// Feeds frames sent on one side into the other side's runtime.
fn spawn_pump(
    mut rx: UnboundedReceiver<Bytes>,
    dest: Arc<MemoryTransport>,
    runtime: Arc<Runtime>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let transport: Arc<dyn Transport> = dest.clone();
        while let Some(frame) = rx.recv().await {
            dest.push(&frame);
            if let Err(e) = runtime.on_message(&transport).await {
                tracing::error!("[Loopback] transport {} stopped: {}", transport.id(), e);
                break;
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if IDLRPC_CONFIG is set, then env overrides)
    let config = match RuntimeConfig::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("IDLRPC_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            if std::env::var("IDLRPC_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            RuntimeConfig::default()
        }
    };

    tracing::info!("Starting idlrpc loopback");
    tracing::info!("  Default timeout: {}ms", config.default_timeout_ms);
    tracing::info!("  Max retries: {}", config.max_retries);
    tracing::info!("  Queue capacity: {}", config.call_queue_capacity);

    let server = Arc::new(
        Runtime::builder()
            .config(config.clone())
            .user_data(Arc::new(String::from("greetings")))
            .build(),
    );
    let client = Arc::new(Runtime::new(config));
    server.start()?;
    client.start()?;

    server.register_service(Arc::new(Greeter::default()))?;
    client.add_proxy_factory(
        GREETER_UUID,
        Arc::new(|base| Arc::new(GreeterProxy { base }) as Arc<dyn Proxy>),
    );

    let (client_mem, client_out) = MemoryTransport::new(1, 0);
    let (server_mem, server_out) = MemoryTransport::new(2, 0);
    let server_pump = spawn_pump(client_out, server_mem.clone(), server.clone());
    let client_pump = spawn_pump(server_out, client_mem.clone(), client.clone());

    let client_transport: Arc<dyn Transport> = client_mem;
    let proxy = client.service_proxy(GREETER_UUID, &client_transport)?;

    for name in ["alice", "bob"] {
        let reply = client
            .call(&proxy, METHOD_GREET, 0, 1, Bytes::from(name))
            .await?;
        tracing::info!("[Loopback] {}", String::from_utf8_lossy(&reply));
    }

    client
        .call(&proxy, METHOD_NOTIFY, 0, 0, Bytes::from_static(b"done"))
        .await?;

    match client.call(&proxy, 99, 0, 0, Bytes::new()).await {
        Ok(_) => tracing::warn!("[Loopback] unknown method unexpectedly succeeded"),
        Err(e) => tracing::info!("[Loopback] unknown method rejected: {}", e),
    }

    // Let the one-way notice drain before stopping.
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.tick()?;

    server.shutdown().await?;
    client.shutdown().await?;

    server_mem.close();
    client_transport.close();
    client.transport_closed(client_transport.as_ref());
    server_pump.abort();
    client_pump.abort();

    tracing::info!("Loopback stopped");
    Ok(())
}
