//! # idlrpc-protocol
//!
//! Wire protocol for idlrpc, the RPC runtime behind IDL-generated stubs and
//! proxies.
//!
//! This crate provides:
//! - Fixed-layout big-endian headers for every message type
//! - Request/response packages and the standard reply builders
//! - The `Protocol` trait with its binary implementation
//! - Result codes shared with the other language runtimes

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{pack, unpack, validate_header, BinaryProtocol, Protocol};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{
    BaseHeader, CallHeader, ConnTimeoutHeader, LoggedOutHeader, MessageType, PingHeader,
    PongHeader, ProxyCallHeader, ProxyReturnHeader, ReturnHeader, WireHeader, BASE_HEADER_SIZE,
    CALL_HEADER_SIZE, CONN_TIMEOUT_HEADER_SIZE, LOGGED_OUT_HEADER_SIZE, PING_HEADER_SIZE,
    PONG_HEADER_SIZE, PROXY_CALL_HEADER_SIZE, PROXY_RETURN_HEADER_SIZE, RETURN_HEADER_SIZE,
};
pub use message::{ProxyRequest, ProxyResponse, Request, Response};

/// Identifies an external connection behind a gateway. Zero means the call
/// is direct, not relayed.
pub type GlobalIndex = u32;

/// Global index of a direct, non-relayed call.
pub const DIRECT_GLOBAL_INDEX: GlobalIndex = 0;

/// Maximum frame size accepted by default (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest value the `length` field can carry. Headers built for a longer
/// frame saturate to it, and every frame-size cap must stay below it so such
/// frames are rejected instead of misframed.
pub const MAX_WIRE_LENGTH: u32 = u32::MAX;
