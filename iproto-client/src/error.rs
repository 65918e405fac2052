//! # Client Errors
//!
//! Purpose: One error type for every failure a caller can observe, from
//! socket errors to server-reported application errors.

use std::time::Duration;

use iproto_common::{ProtocolError, ServerError};
use thiserror::Error;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Frame, greeting, or MessagePack error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Request deadline passed before a response arrived.
    #[error("request {sync} timed out after {timeout:?}")]
    Timeout { sync: u64, timeout: Duration },
    /// Connection was closed while the request was pending or being sent.
    #[error("connection closed")]
    ConnectionClosed,
    /// The pool was closed.
    #[error("connection pool is closed")]
    PoolClosed,
    /// No Ready connection became available within the connect timeout.
    #[error("no available connection after {waited:?}")]
    NoAvailableConnection { waited: Duration },
    /// Space or index metadata could not be found.
    #[error("no schema: {0}")]
    NoSchema(String),
    /// Server returned an error response.
    #[error("server error {code}: {message}")]
    Server { code: u32, message: String },
    /// Request rejected client-side before anything was sent.
    #[error("{0}")]
    Contract(String),
    /// Server schema is older than the cached one under the strict policy.
    #[error("schema version mismatch: cached {cached}, received {received}")]
    SchemaVersionMismatch { cached: u64, received: u64 },
    /// TLS configuration or handshake failure.
    #[error("tls error: {0}")]
    Tls(String),
    /// Authentication was rejected.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Invalid client configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Address could not be resolved.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl ClientError {
    /// Returns true for transient failures a caller may retry on another
    /// connection or after a short delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Timeout { .. }
                | ClientError::ConnectionClosed
                | ClientError::NoAvailableConnection { .. }
        )
    }

    /// Server error code, if this is a server error.
    pub fn server_code(&self) -> Option<u32> {
        match self {
            ClientError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<ServerError> for ClientError {
    fn from(err: ServerError) -> Self {
        ClientError::Server {
            code: err.code,
            message: err.message,
        }
    }
}
