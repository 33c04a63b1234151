//! Runtime error types.

use bytes::Bytes;
use idlrpc_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Errors raised by a transport collaborator.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runtime errors.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("runtime not running")]
    NotRunning,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("transport closed")]
    TransportClosed,

    #[error("proxy not found: {0}")]
    ProxyNotFound(u32),

    #[error("proxy {0} disconnected")]
    ProxyDisconnected(u32),

    #[error("no proxy factory for service {0:#x}")]
    FactoryNotFound(u64),

    #[error("call {0} already exists")]
    CallExists(u32),

    #[error("call not found: {0}")]
    CallNotFound(u32),

    #[error("service not found: {0:#x}")]
    ServiceNotFound(u64),

    #[error("service {0:#x} already registered")]
    ServiceExists(u64),

    #[error("service {0} is shut down")]
    ServiceShutdown(String),

    #[error("service {0} failed to initialise")]
    ServiceInit(String),

    #[error("invalid global index: {0}")]
    InvalidGlobalIndex(u32),

    #[error("call {call_id} timed out")]
    Timeout { call_id: u32 },

    #[error("remote service not found")]
    RemoteNotFound,

    #[error("remote service error ({} byte diagnostic)", .0.len())]
    RemoteFailed(Bytes),

    #[error("unexpected result code {0}")]
    UnexpectedCode(u32),
}

impl RpcError {
    /// Maps a non-success result code carried by a response.
    pub fn from_code(code: u32, call_id: u32, body: Bytes) -> Self {
        match ErrorCode::from_u32(code) {
            Some(ErrorCode::ServiceNotFound) => RpcError::RemoteNotFound,
            Some(ErrorCode::ServiceError) => RpcError::RemoteFailed(body),
            Some(ErrorCode::Timeout) => RpcError::Timeout { call_id },
            _ => RpcError::UnexpectedCode(code),
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}

/// Error returned by a service method body.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unknown method id {0}")]
    MethodNotFound(u32),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{message}")]
    Failed { message: String, payload: Bytes },
}

impl ServiceError {
    pub fn failed(message: impl Into<String>) -> Self {
        ServiceError::Failed {
            message: message.into(),
            payload: Bytes::new(),
        }
    }

    /// Diagnostic bytes sent back in the service-error reply.
    pub fn diagnostics(&self) -> Bytes {
        match self {
            ServiceError::Failed { payload, .. } if !payload.is_empty() => payload.clone(),
            other => Bytes::from(other.to_string()),
        }
    }
}
