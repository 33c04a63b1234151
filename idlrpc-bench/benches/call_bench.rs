//! End-to-end call benchmarks over an in-memory transport pair.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::future::BoxFuture;
use idlrpc_runtime::{
    CallContext, MemoryTransport, Proxy, ProxyBase, Runtime, RuntimeConfig, Service, ServiceError,
    Transport,
};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

const ECHO_UUID: u64 = 0xBE7C;

struct Echo;

impl Service for Echo {
    fn uuid(&self) -> u64 {
        ECHO_UUID
    }

    fn name(&self) -> &str {
        "Echo"
    }

    fn signature(&self, _method_id: u32) -> &str {
        "Echo::echo"
    }

    fn concurrency(&self) -> usize {
        4
    }

    fn call(
        &self,
        _ctx: CallContext,
        _method_id: u32,
        payload: Bytes,
    ) -> BoxFuture<'_, Result<Bytes, ServiceError>> {
        Box::pin(async move { Ok(payload) })
    }
}

struct EchoProxy {
    base: ProxyBase,
}

impl Proxy for EchoProxy {
    fn base(&self) -> &ProxyBase {
        &self.base
    }

    fn service_name(&self) -> &str {
        "Echo"
    }

    fn signature(&self, _method_id: u32) -> &str {
        "Echo::echo"
    }
}

struct TestSetup {
    client: Arc<Runtime>,
    proxy: Arc<dyn Proxy>,
}

fn pump(mut rx: UnboundedReceiver<Bytes>, dest: Arc<MemoryTransport>, runtime: Arc<Runtime>) {
    tokio::spawn(async move {
        let transport: Arc<dyn Transport> = dest.clone();
        while let Some(frame) = rx.recv().await {
            dest.push(&frame);
            if runtime.on_message(&transport).await.is_err() {
                break;
            }
        }
    });
}

fn setup(rt: &tokio::runtime::Runtime) -> TestSetup {
    rt.block_on(async {
        let client = Arc::new(Runtime::new(RuntimeConfig::default()));
        let server = Arc::new(Runtime::new(RuntimeConfig::default()));
        client.start().unwrap();
        server.start().unwrap();
        server.register_service(Arc::new(Echo)).unwrap();

        let (client_mem, client_out) = MemoryTransport::new(1, 0);
        let (server_mem, server_out) = MemoryTransport::new(2, 0);
        pump(client_out, server_mem, server);
        pump(server_out, client_mem.clone(), client.clone());

        client.add_proxy_factory(
            ECHO_UUID,
            Arc::new(|base| Arc::new(EchoProxy { base }) as Arc<dyn Proxy>),
        );
        let transport: Arc<dyn Transport> = client_mem;
        let proxy = client.service_proxy(ECHO_UUID, &transport).unwrap();

        TestSetup { client, proxy }
    })
}

fn bench_call_latency(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let setup = setup(&rt);

    let mut group = c.benchmark_group("call");

    for size in [16, 1024, 16 * 1024] {
        let payload = Bytes::from(vec![0x5Au8; size]);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.to_async(&rt).iter(|| async {
                black_box(
                    setup
                        .client
                        .call(&setup.proxy, 1, 0, 0, payload.clone())
                        .await
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_call_latency);
criterion_main!(benches);
