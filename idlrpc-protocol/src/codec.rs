//! Packing and parsing of whole frames.

use crate::error::ProtocolError;
use crate::frame::{
    BaseHeader, CallHeader, ConnTimeoutHeader, LoggedOutHeader, MessageType, PingHeader,
    PongHeader, ProxyCallHeader, ProxyReturnHeader, ReturnHeader, WireHeader, BASE_HEADER_SIZE,
};
use crate::message::{ProxyRequest, ProxyResponse, Request, Response};
use bytes::{Bytes, BytesMut};

/// Codec used by the runtime to turn frames into packages and back.
///
/// The runtime only talks to this trait, so an alternative encoding can be
/// plugged in without touching the dispatch loop.
pub trait Protocol: Send + Sync {
    /// Reads the base header from the start of `buf`.
    fn read_header(&self, buf: &[u8]) -> Result<BaseHeader, ProtocolError>;

    fn parse_request(&self, frame: &Bytes) -> Result<Request, ProtocolError>;
    fn parse_proxy_request(&self, frame: &Bytes) -> Result<ProxyRequest, ProtocolError>;
    fn parse_response(&self, frame: &Bytes) -> Result<Response, ProtocolError>;
    fn parse_proxy_response(&self, frame: &Bytes) -> Result<ProxyResponse, ProtocolError>;
    fn parse_conn_timeout(&self, frame: &[u8]) -> Result<ConnTimeoutHeader, ProtocolError>;
    fn parse_logged_out(&self, frame: &[u8]) -> Result<LoggedOutHeader, ProtocolError>;
    fn parse_ping(&self, frame: &[u8]) -> Result<PingHeader, ProtocolError>;
    fn parse_pong(&self, frame: &[u8]) -> Result<PongHeader, ProtocolError>;

    fn pack_request(&self, request: &Request) -> Bytes;
    fn pack_proxy_request(&self, request: &ProxyRequest) -> Bytes;
    fn pack_response(&self, response: &Response) -> Bytes;
    fn pack_proxy_response(&self, response: &ProxyResponse) -> Bytes;
    fn pack_conn_timeout(&self, header: &ConnTimeoutHeader) -> Bytes;
    fn pack_logged_out(&self, header: &LoggedOutHeader) -> Bytes;
    fn pack_ping(&self, header: &PingHeader) -> Bytes;
    fn pack_pong(&self, header: &PongHeader) -> Bytes;
}

/// Checks a peeked base header before the rest of the frame is consumed.
///
/// A zero or undersized length, a type outside the valid range, or a frame
/// larger than `max_frame_size` is a stream-level error.
pub fn validate_header(
    header: &BaseHeader,
    max_frame_size: usize,
) -> Result<MessageType, ProtocolError> {
    if (header.length as usize) < BASE_HEADER_SIZE {
        return Err(ProtocolError::InvalidLength(header.length));
    }
    let ty = header
        .message_type()
        .ok_or(ProtocolError::InvalidType(header.msg_type))?;
    if header.length as usize > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: header.length as usize,
            max: max_frame_size,
        });
    }
    Ok(ty)
}

/// Writes `header` followed by `body`.
pub fn pack<H: WireHeader>(header: &H, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(H::SIZE + body.len());
    header.put(&mut buf);
    buf.extend_from_slice(body);
    buf.freeze()
}

/// Splits a complete frame into its header and a zero-copy view of the
/// payload. Bytes past `length` are ignored.
pub fn unpack<H: WireHeader>(frame: &Bytes) -> Result<(H, Bytes), ProtocolError> {
    let header = H::parse(frame)?;
    let length = header.base().length as usize;
    if length < H::SIZE {
        return Err(ProtocolError::InvalidLength(header.base().length));
    }
    if frame.len() < length {
        return Err(ProtocolError::Truncated {
            needed: length,
            actual: frame.len(),
        });
    }
    Ok((header, frame.slice(H::SIZE..length)))
}

/// The fixed-layout big-endian encoding shared with the other runtimes.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryProtocol;

impl Protocol for BinaryProtocol {
    fn read_header(&self, buf: &[u8]) -> Result<BaseHeader, ProtocolError> {
        BaseHeader::peek(buf)
    }

    fn parse_request(&self, frame: &Bytes) -> Result<Request, ProtocolError> {
        let (header, body) = unpack::<CallHeader>(frame)?;
        Ok(Request { header, body })
    }

    fn parse_proxy_request(&self, frame: &Bytes) -> Result<ProxyRequest, ProtocolError> {
        let (header, body) = unpack::<ProxyCallHeader>(frame)?;
        Ok(ProxyRequest { header, body })
    }

    fn parse_response(&self, frame: &Bytes) -> Result<Response, ProtocolError> {
        let (header, body) = unpack::<ReturnHeader>(frame)?;
        Ok(Response { header, body })
    }

    fn parse_proxy_response(&self, frame: &Bytes) -> Result<ProxyResponse, ProtocolError> {
        let (header, body) = unpack::<ProxyReturnHeader>(frame)?;
        Ok(ProxyResponse { header, body })
    }

    fn parse_conn_timeout(&self, frame: &[u8]) -> Result<ConnTimeoutHeader, ProtocolError> {
        ConnTimeoutHeader::parse(frame)
    }

    fn parse_logged_out(&self, frame: &[u8]) -> Result<LoggedOutHeader, ProtocolError> {
        LoggedOutHeader::parse(frame)
    }

    fn parse_ping(&self, frame: &[u8]) -> Result<PingHeader, ProtocolError> {
        PingHeader::parse(frame)
    }

    fn parse_pong(&self, frame: &[u8]) -> Result<PongHeader, ProtocolError> {
        PongHeader::parse(frame)
    }

    fn pack_request(&self, request: &Request) -> Bytes {
        pack(&request.header, &request.body)
    }

    fn pack_proxy_request(&self, request: &ProxyRequest) -> Bytes {
        pack(&request.header, &request.body)
    }

    fn pack_response(&self, response: &Response) -> Bytes {
        pack(&response.header, &response.body)
    }

    fn pack_proxy_response(&self, response: &ProxyResponse) -> Bytes {
        pack(&response.header, &response.body)
    }

    fn pack_conn_timeout(&self, header: &ConnTimeoutHeader) -> Bytes {
        pack(header, &[])
    }

    fn pack_logged_out(&self, header: &LoggedOutHeader) -> Bytes {
        pack(header, &[])
    }

    fn pack_ping(&self, header: &PingHeader) -> Bytes {
        pack(header, &[])
    }

    fn pack_pong(&self, header: &PongHeader) -> Bytes {
        pack(header, &[])
    }
}
