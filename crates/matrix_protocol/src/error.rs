//! Protocol error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("header too short: expected {expected} bytes, got {got}")]
    HeaderTooShort { expected: usize, got: usize },

    #[error("body length {0} exceeds the 1 MiB frame limit")]
    BodyTooLarge(u32),

    #[error("unknown compression flag: {0:#04x}")]
    UnknownCompression(u8),

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("header checksum mismatch")]
    CrcMismatch,

    #[error("truncated packet: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("invalid payload type: {0}")]
    InvalidPayloadType(u8),

    #[error("invalid field length {len} for {field}")]
    InvalidFieldLength { field: &'static str, len: u32 },

    #[error("packet expired: {age_ms} ms old")]
    Expired { age_ms: i64 },

    #[error("unknown intranet event type: {0}")]
    UnknownEventType(u16),

    #[error("field is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("snappy decompression failed: {0}")]
    Decompression(#[from] snap::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
