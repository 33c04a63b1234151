//! # idlrpc-runtime
//!
//! RPC runtime for idlrpc.
//!
//! This crate provides:
//! - Frame dispatch over any byte-stream `Transport`
//! - Per-service stub worker pools with panic isolation
//! - Proxy caching per connection and per external connection
//! - Outbound call correlation with timeouts and retries
//! - Gateway relay mode and keep-alive handling

pub mod call_manager;
pub mod config;
pub mod error;
pub mod proxy;
pub mod proxy_manager;
pub mod relay;
pub mod runtime;
pub mod service;
pub mod stub;
pub mod stub_manager;
pub mod transport;

pub use call_manager::{ProxyCall, ProxyCallManager, Reply};
pub use config::{ConfigError, RuntimeConfig};
pub use error::{RpcError, ServiceError, TransportError};
pub use proxy::{Proxy, ProxyBase, ProxyFactory, ProxyId, INVALID_STUB_ID};
pub use proxy_manager::ProxyManager;
pub use relay::ProxyHandler;
pub use runtime::{Runtime, RuntimeBuilder, RuntimeStatus};
pub use service::{CallContext, Service, ServiceContext, ServicePanic};
pub use stub::{StubCall, StubWrapper};
pub use stub_manager::StubManager;
pub use transport::{MemoryTransport, Transport};

pub use idlrpc_protocol::{ErrorCode, GlobalIndex, DIRECT_GLOBAL_INDEX};
