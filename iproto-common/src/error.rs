//! # Protocol Errors
//!
//! Purpose: Describe every way a byte stream can fail to be a valid frame,
//! greeting, or packet, independent of any socket or runtime.

use thiserror::Error;

/// Result alias for codec-level operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The length prefix is not a MessagePack unsigned integer.
    #[error("invalid frame length prefix (marker {0:#04x})")]
    InvalidLengthPrefix(u8),
    /// The declared frame length exceeds the configured limit.
    #[error("frame of {len} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { len: usize, limit: usize },
    /// MessagePack payload could not be decoded.
    #[error("malformed msgpack: {0}")]
    Decode(String),
    /// MessagePack payload could not be encoded.
    #[error("msgpack encode failed: {0}")]
    Encode(String),
    /// The packet header is missing or has the wrong shape.
    #[error("malformed header: {0}")]
    Header(&'static str),
    /// The packet body has the wrong shape.
    #[error("malformed body: {0}")]
    Body(&'static str),
    /// The server greeting could not be parsed.
    #[error("invalid greeting: {0}")]
    Greeting(&'static str),
}

impl From<rmpv::decode::Error> for ProtocolError {
    fn from(err: rmpv::decode::Error) -> Self {
        ProtocolError::Decode(err.to_string())
    }
}
