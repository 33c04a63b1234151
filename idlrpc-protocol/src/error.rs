//! Protocol error types and wire result codes.

use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur while framing, parsing or packing.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame length: {0}")]
    InvalidLength(u32),

    #[error("invalid message type: {0}")]
    InvalidType(u32),

    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedType { expected: u32, actual: u32 },

    #[error("truncated frame: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Result codes carried in the `errorCode` field of return headers.
///
/// These values are part of the wire contract shared with the other
/// language runtimes and must remain stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 1,
    ServiceNotFound = 2,
    ServiceError = 3,
    Timeout = 4,
    RateLimited = 5,
}

impl ErrorCode {
    /// Converts a raw wire value, returning `None` for unknown codes.
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            1 => Some(ErrorCode::Success),
            2 => Some(ErrorCode::ServiceNotFound),
            3 => Some(ErrorCode::ServiceError),
            4 => Some(ErrorCode::Timeout),
            5 => Some(ErrorCode::RateLimited),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Returns whether a caller may resend the same request after this code.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::Timeout)
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> Self {
        code.as_u32()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Success => write!(f, "SUCCESS"),
            ErrorCode::ServiceNotFound => write!(f, "SERVICE_NOT_FOUND"),
            ErrorCode::ServiceError => write!(f, "SERVICE_ERROR"),
            ErrorCode::Timeout => write!(f, "TIMEOUT"),
            ErrorCode::RateLimited => write!(f, "RATE_LIMITED"),
        }
    }
}
