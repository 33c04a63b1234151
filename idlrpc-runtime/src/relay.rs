//! Gateway relay hook.

use crate::error::RpcError;
use crate::transport::Transport;
use bytes::Bytes;
use futures::future::BoxFuture;
use idlrpc_protocol::BaseHeader;
use std::sync::Arc;

/// Receives every complete frame read by
/// [`Runtime::on_proxy_message`](crate::Runtime::on_proxy_message).
///
/// A gateway implements this to forward frames between external connections
/// and the services behind it without decoding them locally.
pub trait ProxyHandler: Send + Sync {
    fn on_relay<'a>(
        &'a self,
        transport: &'a Arc<dyn Transport>,
        header: BaseHeader,
        frame: Bytes,
    ) -> BoxFuture<'a, Result<(), RpcError>>;
}
