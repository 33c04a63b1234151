//! Request and response packages: a header plus its opaque payload.

use crate::error::ErrorCode;
use crate::frame::{CallHeader, ProxyCallHeader, ProxyReturnHeader, ReturnHeader};
use crate::GlobalIndex;
use bytes::Bytes;

/// A direct call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub header: CallHeader,
    pub body: Bytes,
}

impl Request {
    pub fn new(service_uuid: u64, server_id: u32, call_id: u32, method_id: u32, body: Bytes) -> Self {
        Self {
            header: CallHeader::new(service_uuid, server_id, call_id, method_id, body.len()),
            body,
        }
    }
}

/// A call relayed by a gateway on behalf of an external connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub header: ProxyCallHeader,
    pub body: Bytes,
}

impl ProxyRequest {
    /// Wraps a direct request for relaying, keeping its payload.
    pub fn from_request(request: &Request, global_index: GlobalIndex) -> Self {
        Self {
            header: ProxyCallHeader::from_call(&request.header, global_index),
            body: request.body.clone(),
        }
    }

    pub fn global_index(&self) -> GlobalIndex {
        self.header.global_index
    }
}

/// Result of a direct call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub header: ReturnHeader,
    pub body: Bytes,
}

impl Response {
    pub fn new(server_id: u32, call_id: u32, code: ErrorCode, body: Bytes) -> Self {
        Self {
            header: ReturnHeader::new(server_id, call_id, code.as_u32(), body.len()),
            body,
        }
    }

    pub fn success(call_id: u32, body: Bytes) -> Self {
        Self::new(0, call_id, ErrorCode::Success, body)
    }

    /// Answer for a request naming a service that is not registered.
    pub fn not_found(request: &Request) -> Self {
        Self::new(0, request.header.call_id, ErrorCode::ServiceNotFound, Bytes::new())
    }

    /// Answer for a method body that failed. The payload carries whatever
    /// diagnostics the failure produced and may be empty.
    pub fn exception(call_id: u32, diagnostics: Bytes) -> Self {
        Self::new(0, call_id, ErrorCode::ServiceError, diagnostics)
    }

    pub fn timeout(call_id: u32) -> Self {
        Self::new(0, call_id, ErrorCode::Timeout, Bytes::new())
    }

    /// Decoded result code, `None` if the peer sent an unknown value.
    pub fn code(&self) -> Option<ErrorCode> {
        ErrorCode::from_u32(self.header.error_code)
    }
}

/// Result of a relayed call, routed back to `global_index` by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub header: ProxyReturnHeader,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn new(
        server_id: u32,
        call_id: u32,
        code: ErrorCode,
        global_index: GlobalIndex,
        body: Bytes,
    ) -> Self {
        Self {
            header: ProxyReturnHeader::new(
                server_id,
                call_id,
                code.as_u32(),
                global_index,
                body.len(),
            ),
            body,
        }
    }

    pub fn success(call_id: u32, global_index: GlobalIndex, body: Bytes) -> Self {
        Self::new(0, call_id, ErrorCode::Success, global_index, body)
    }

    pub fn not_found(request: &ProxyRequest) -> Self {
        Self::new(
            0,
            request.header.call_id,
            ErrorCode::ServiceNotFound,
            request.header.global_index,
            Bytes::new(),
        )
    }

    pub fn exception(call_id: u32, global_index: GlobalIndex, diagnostics: Bytes) -> Self {
        Self::new(0, call_id, ErrorCode::ServiceError, global_index, diagnostics)
    }

    pub fn timeout(call_id: u32, global_index: GlobalIndex) -> Self {
        Self::new(0, call_id, ErrorCode::Timeout, global_index, Bytes::new())
    }

    pub fn code(&self) -> Option<ErrorCode> {
        ErrorCode::from_u32(self.header.error_code)
    }

    pub fn global_index(&self) -> GlobalIndex {
        self.header.global_index
    }
}
