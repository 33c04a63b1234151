//! Fixed-layout binary headers.
//!
//! Every frame starts with the 8-byte base header, followed by the
//! type-specific fields and the opaque payload. All integers are big-endian
//! and `length` always counts the whole frame (header + payload).
//!
//! ```text
//! +----------+----------+--------------------------+-----------------+
//! |  length  |   type   | type-specific fields     | payload         |
//! |  4 bytes |  4 bytes | (see the header structs) | length - header |
//! +----------+----------+--------------------------+-----------------+
//! ```

use crate::error::ProtocolError;
use crate::{GlobalIndex, MAX_WIRE_LENGTH};
use bytes::{Buf, BufMut, BytesMut};

/// Size of the base header (length + type).
pub const BASE_HEADER_SIZE: usize = 8;
/// 8 + 8 + 4 + 4 + 4
pub const CALL_HEADER_SIZE: usize = 28;
/// 8 + 8 + 4 + 4 + 4 + 4 + 2
pub const PROXY_CALL_HEADER_SIZE: usize = 34;
/// 8 + 4 + 4 + 4
pub const RETURN_HEADER_SIZE: usize = 20;
/// 8 + 4 + 4 + 4 + 4
pub const PROXY_RETURN_HEADER_SIZE: usize = 24;
pub const CONN_TIMEOUT_HEADER_SIZE: usize = 12;
pub const PING_HEADER_SIZE: usize = 16;
pub const PONG_HEADER_SIZE: usize = 16;
pub const LOGGED_OUT_HEADER_SIZE: usize = 12;

/// Message type carried in the base header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Invalid = 0,
    Request = 1,
    Response = 2,
    ProxyRequest = 3,
    ProxyResponse = 4,
    NotRpc = 5,
    EventSub = 6,
    EventPub = 7,
    EventCancel = 8,
    CallAlias = 9,
    Ping = 10,
    Pong = 11,
    ConnTimeout = 12,
    LoggedOut = 13,
    /// Upper sentinel, never sent on the wire.
    Max = 14,
}

impl MessageType {
    /// Converts a raw type, accepting only the open range `(Invalid, Max)`.
    pub fn from_u32(raw: u32) -> Option<Self> {
        let ty = match raw {
            1 => MessageType::Request,
            2 => MessageType::Response,
            3 => MessageType::ProxyRequest,
            4 => MessageType::ProxyResponse,
            5 => MessageType::NotRpc,
            6 => MessageType::EventSub,
            7 => MessageType::EventPub,
            8 => MessageType::EventCancel,
            9 => MessageType::CallAlias,
            10 => MessageType::Ping,
            11 => MessageType::Pong,
            12 => MessageType::ConnTimeout,
            13 => MessageType::LoggedOut,
            _ => return None,
        };
        Some(ty)
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// A header with a fixed wire size.
pub trait WireHeader: Sized {
    /// Encoded size in bytes, base header included.
    const SIZE: usize;
    /// Message type this header is sent with.
    const TYPE: MessageType;

    fn base(&self) -> &BaseHeader;

    /// Writes the header at the end of `buf`.
    fn put(&self, buf: &mut BytesMut);

    /// Parses the header from the start of `buf`.
    fn parse(buf: &[u8]) -> Result<Self, ProtocolError>;
}

fn check_len(buf: &[u8], needed: usize) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn parse_base(cur: &mut &[u8], expected: MessageType) -> Result<BaseHeader, ProtocolError> {
    let base = BaseHeader {
        length: cur.get_u32(),
        msg_type: cur.get_u32(),
    };
    if base.msg_type != expected.as_u32() {
        return Err(ProtocolError::UnexpectedType {
            expected: expected.as_u32(),
            actual: base.msg_type,
        });
    }
    Ok(base)
}

/// The 8-byte header shared by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseHeader {
    /// Total frame length, header included.
    pub length: u32,
    /// Raw message type. Validated by the dispatch loop, not here.
    pub msg_type: u32,
}

impl BaseHeader {
    /// Builds a header for a frame of `length` bytes. Lengths that do not
    /// fit the wire field saturate to [`MAX_WIRE_LENGTH`], which no frame
    /// size cap accepts.
    pub fn new(msg_type: MessageType, length: usize) -> Self {
        Self {
            length: u32::try_from(length).unwrap_or(MAX_WIRE_LENGTH),
            msg_type: msg_type.as_u32(),
        }
    }

    /// Reads only the base header, so the frame size is known before the
    /// rest of the frame has arrived.
    pub fn peek(buf: &[u8]) -> Result<Self, ProtocolError> {
        check_len(buf, BASE_HEADER_SIZE)?;
        let mut cur = buf;
        Ok(Self {
            length: cur.get_u32(),
            msg_type: cur.get_u32(),
        })
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u32(self.msg_type)
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.length);
        buf.put_u32(self.msg_type);
    }
}

/// Direct call request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHeader {
    pub base: BaseHeader,
    pub service_uuid: u64,
    pub server_id: u32,
    pub call_id: u32,
    pub method_id: u32,
}

impl CallHeader {
    pub fn new(
        service_uuid: u64,
        server_id: u32,
        call_id: u32,
        method_id: u32,
        body_len: usize,
    ) -> Self {
        Self {
            base: BaseHeader::new(
                MessageType::Request,
                CALL_HEADER_SIZE.saturating_add(body_len),
            ),
            service_uuid,
            server_id,
            call_id,
            method_id,
        }
    }
}

impl WireHeader for CallHeader {
    const SIZE: usize = CALL_HEADER_SIZE;
    const TYPE: MessageType = MessageType::Request;

    fn base(&self) -> &BaseHeader {
        &self.base
    }

    fn put(&self, buf: &mut BytesMut) {
        self.base.put(buf);
        buf.put_u64(self.service_uuid);
        buf.put_u32(self.server_id);
        buf.put_u32(self.call_id);
        buf.put_u32(self.method_id);
    }

    fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        check_len(buf, Self::SIZE)?;
        let mut cur = buf;
        Ok(Self {
            base: parse_base(&mut cur, Self::TYPE)?,
            service_uuid: cur.get_u64(),
            server_id: cur.get_u32(),
            call_id: cur.get_u32(),
            method_id: cur.get_u32(),
        })
    }
}

/// Gateway-relayed call request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyCallHeader {
    pub base: BaseHeader,
    pub service_uuid: u64,
    pub server_id: u32,
    pub call_id: u32,
    pub method_id: u32,
    pub global_index: GlobalIndex,
    pub one_way: u16,
}

impl ProxyCallHeader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        service_uuid: u64,
        server_id: u32,
        call_id: u32,
        method_id: u32,
        global_index: GlobalIndex,
        one_way: bool,
        body_len: usize,
    ) -> Self {
        Self {
            base: BaseHeader::new(
                MessageType::ProxyRequest,
                PROXY_CALL_HEADER_SIZE.saturating_add(body_len),
            ),
            service_uuid,
            server_id,
            call_id,
            method_id,
            global_index,
            one_way: u16::from(one_way),
        }
    }

    /// Re-labels a direct call header for relaying on behalf of
    /// `global_index`. The length grows by the extra header bytes.
    pub fn from_call(header: &CallHeader, global_index: GlobalIndex) -> Self {
        let body_len = (header.base.length as usize).saturating_sub(CALL_HEADER_SIZE);
        Self::new(
            header.service_uuid,
            header.server_id,
            header.call_id,
            header.method_id,
            global_index,
            false,
            body_len,
        )
    }

    pub fn is_one_way(&self) -> bool {
        self.one_way != 0
    }
}

impl WireHeader for ProxyCallHeader {
    const SIZE: usize = PROXY_CALL_HEADER_SIZE;
    const TYPE: MessageType = MessageType::ProxyRequest;

    fn base(&self) -> &BaseHeader {
        &self.base
    }

    fn put(&self, buf: &mut BytesMut) {
        self.base.put(buf);
        buf.put_u64(self.service_uuid);
        buf.put_u32(self.server_id);
        buf.put_u32(self.call_id);
        buf.put_u32(self.method_id);
        buf.put_u32(self.global_index);
        buf.put_u16(self.one_way);
    }

    fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        check_len(buf, Self::SIZE)?;
        let mut cur = buf;
        Ok(Self {
            base: parse_base(&mut cur, Self::TYPE)?,
            service_uuid: cur.get_u64(),
            server_id: cur.get_u32(),
            call_id: cur.get_u32(),
            method_id: cur.get_u32(),
            global_index: cur.get_u32(),
            one_way: cur.get_u16(),
        })
    }
}

/// Direct call return header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnHeader {
    pub base: BaseHeader,
    pub server_id: u32,
    pub call_id: u32,
    pub error_code: u32,
}

impl ReturnHeader {
    pub fn new(server_id: u32, call_id: u32, error_code: u32, body_len: usize) -> Self {
        Self {
            base: BaseHeader::new(
                MessageType::Response,
                RETURN_HEADER_SIZE.saturating_add(body_len),
            ),
            server_id,
            call_id,
            error_code,
        }
    }
}

impl WireHeader for ReturnHeader {
    const SIZE: usize = RETURN_HEADER_SIZE;
    const TYPE: MessageType = MessageType::Response;

    fn base(&self) -> &BaseHeader {
        &self.base
    }

    fn put(&self, buf: &mut BytesMut) {
        self.base.put(buf);
        buf.put_u32(self.server_id);
        buf.put_u32(self.call_id);
        buf.put_u32(self.error_code);
    }

    fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        check_len(buf, Self::SIZE)?;
        let mut cur = buf;
        Ok(Self {
            base: parse_base(&mut cur, Self::TYPE)?,
            server_id: cur.get_u32(),
            call_id: cur.get_u32(),
            error_code: cur.get_u32(),
        })
    }
}

/// Gateway-relayed call return header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyReturnHeader {
    pub base: BaseHeader,
    pub server_id: u32,
    pub call_id: u32,
    pub error_code: u32,
    pub global_index: GlobalIndex,
}

impl ProxyReturnHeader {
    pub fn new(
        server_id: u32,
        call_id: u32,
        error_code: u32,
        global_index: GlobalIndex,
        body_len: usize,
    ) -> Self {
        Self {
            base: BaseHeader::new(
                MessageType::ProxyResponse,
                PROXY_RETURN_HEADER_SIZE.saturating_add(body_len),
            ),
            server_id,
            call_id,
            error_code,
            global_index,
        }
    }
}

impl WireHeader for ProxyReturnHeader {
    const SIZE: usize = PROXY_RETURN_HEADER_SIZE;
    const TYPE: MessageType = MessageType::ProxyResponse;

    fn base(&self) -> &BaseHeader {
        &self.base
    }

    fn put(&self, buf: &mut BytesMut) {
        self.base.put(buf);
        buf.put_u32(self.server_id);
        buf.put_u32(self.call_id);
        buf.put_u32(self.error_code);
        buf.put_u32(self.global_index);
    }

    fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        check_len(buf, Self::SIZE)?;
        let mut cur = buf;
        Ok(Self {
            base: parse_base(&mut cur, Self::TYPE)?,
            server_id: cur.get_u32(),
            call_id: cur.get_u32(),
            error_code: cur.get_u32(),
            global_index: cur.get_u32(),
        })
    }
}

/// Sent by a gateway when an external connection stopped answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnTimeoutHeader {
    pub base: BaseHeader,
    pub global_index: GlobalIndex,
}

impl ConnTimeoutHeader {
    pub fn new(global_index: GlobalIndex) -> Self {
        Self {
            base: BaseHeader::new(MessageType::ConnTimeout, CONN_TIMEOUT_HEADER_SIZE),
            global_index,
        }
    }
}

impl WireHeader for ConnTimeoutHeader {
    const SIZE: usize = CONN_TIMEOUT_HEADER_SIZE;
    const TYPE: MessageType = MessageType::ConnTimeout;

    fn base(&self) -> &BaseHeader {
        &self.base
    }

    fn put(&self, buf: &mut BytesMut) {
        self.base.put(buf);
        buf.put_u32(self.global_index);
    }

    fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        check_len(buf, Self::SIZE)?;
        let mut cur = buf;
        Ok(Self {
            base: parse_base(&mut cur, Self::TYPE)?,
            global_index: cur.get_u32(),
        })
    }
}

/// Sent by a gateway when an external connection was forcibly logged out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggedOutHeader {
    pub base: BaseHeader,
    pub global_index: GlobalIndex,
}

impl LoggedOutHeader {
    pub fn new(global_index: GlobalIndex) -> Self {
        Self {
            base: BaseHeader::new(MessageType::LoggedOut, LOGGED_OUT_HEADER_SIZE),
            global_index,
        }
    }
}

impl WireHeader for LoggedOutHeader {
    const SIZE: usize = LOGGED_OUT_HEADER_SIZE;
    const TYPE: MessageType = MessageType::LoggedOut;

    fn base(&self) -> &BaseHeader {
        &self.base
    }

    fn put(&self, buf: &mut BytesMut) {
        self.base.put(buf);
        buf.put_u32(self.global_index);
    }

    fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        check_len(buf, Self::SIZE)?;
        let mut cur = buf;
        Ok(Self {
            base: parse_base(&mut cur, Self::TYPE)?,
            global_index: cur.get_u32(),
        })
    }
}

/// Heartbeat request. The ping id is assigned once per external connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingHeader {
    pub base: BaseHeader,
    pub ping_id: u64,
}

impl PingHeader {
    pub fn new(ping_id: u64) -> Self {
        Self {
            base: BaseHeader::new(MessageType::Ping, PING_HEADER_SIZE),
            ping_id,
        }
    }
}

impl WireHeader for PingHeader {
    const SIZE: usize = PING_HEADER_SIZE;
    const TYPE: MessageType = MessageType::Ping;

    fn base(&self) -> &BaseHeader {
        &self.base
    }

    fn put(&self, buf: &mut BytesMut) {
        self.base.put(buf);
        buf.put_u64(self.ping_id);
    }

    fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        check_len(buf, Self::SIZE)?;
        let mut cur = buf;
        Ok(Self {
            base: parse_base(&mut cur, Self::TYPE)?,
            ping_id: cur.get_u64(),
        })
    }
}

/// Heartbeat answer, echoes the ping id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongHeader {
    pub base: BaseHeader,
    pub ping_id: u64,
}

impl PongHeader {
    pub fn new(ping_id: u64) -> Self {
        Self {
            base: BaseHeader::new(MessageType::Pong, PONG_HEADER_SIZE),
            ping_id,
        }
    }
}

impl WireHeader for PongHeader {
    const SIZE: usize = PONG_HEADER_SIZE;
    const TYPE: MessageType = MessageType::Pong;

    fn base(&self) -> &BaseHeader {
        &self.base
    }

    fn put(&self, buf: &mut BytesMut) {
        self.base.put(buf);
        buf.put_u64(self.ping_id);
    }

    fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        check_len(buf, Self::SIZE)?;
        let mut cur = buf;
        Ok(Self {
            base: parse_base(&mut cur, Self::TYPE)?,
            ping_id: cur.get_u64(),
        })
    }
}
