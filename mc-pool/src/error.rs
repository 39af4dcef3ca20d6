//! # Error Types
//!
//! Two layers of failure: `ClientError` covers a single connection and its
//! wire exchange, `PoolError` wraps it with the pool-level context that tells
//! the caller which stage failed.

use thiserror::Error;

/// Result type for single-connection client calls.
pub type ClientResult<T> = Result<T, ClientError>;

/// Result type for pool calls.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by a cache client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while connecting, reading or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Reply framing could not be parsed.
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    /// Server answered `ERROR` or `SERVER_ERROR`.
    #[error("server error: {message}")]
    Server { message: String },
    /// Server rejected the request with `CLIENT_ERROR`.
    #[error("request rejected: {message}")]
    Request { message: String },
    /// Reply was well-formed but not valid for the command sent.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// Key is empty, too long, or contains whitespace/control bytes.
    #[error("invalid key: {key:?}")]
    InvalidKey { key: String },
    /// Value could not be encoded to or decoded from JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Stored text value is not valid UTF-8.
    #[error("value is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    /// Stored item was written as a different kind (text, JSON, list).
    #[error("stored value has kind flag {found}, expected {expected}")]
    KindMismatch { expected: u32, found: u32 },
    /// A command was issued before `connect`.
    #[error("client is not connected")]
    NotConnected,
    /// Connect or request exceeded its configured timeout.
    #[error("operation timed out")]
    Timeout,
}

impl ClientError {
    /// Returns true when the stream can no longer be trusted to be in sync
    /// with the server and must be dropped.
    pub fn breaks_connection(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Protocol(_)
                | ClientError::UnexpectedResponse
                | ClientError::Timeout
        )
    }
}

/// Errors surfaced by the connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Construction options are contradictory. No pool is created.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A slot's client failed to connect.
    #[error("connection error: {0}")]
    Connection(#[source] ClientError),
    /// The delegated cache operation failed.
    #[error("operation error: {0}")]
    Operation(#[source] ClientError),
    /// Every slot is held and the pool reached its configured ceiling.
    #[error("connection pool exhausted: all {max} slots in use")]
    Exhausted { max: usize },
}
