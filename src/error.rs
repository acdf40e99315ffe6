//! Error types for fastrpc.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all fastrpc operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on the underlying transport.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection (EOF while reading a frame).
    #[error("connection closed")]
    Eof,

    /// JSON serialization/deserialization error (handshake or JSON codec).
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary codec serialization error.
    #[error("codec encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Binary codec deserialization error.
    #[error("codec decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Handshake carried a magic number other than [`crate::conn::MAGIC_NUMBER`].
    #[error("invalid magic number {0:#x}")]
    InvalidMagic(u32),

    /// The HTTP CONNECT exchange returned something other than the
    /// connected status line.
    #[error("unexpected HTTP response: {0}")]
    HttpUpgrade(String),

    /// Dial (transport connect + handshake) exceeded the configured budget.
    #[error("fastrpc client: connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),

    /// `close` was called on a client that is already closing.
    #[error("connection already closed")]
    Closed,

    /// Submission rejected: the client is closing or shut down.
    #[error("connection not available")]
    NotAvailable,

    /// A synchronous call was cancelled locally before a response arrived.
    #[error("fastrpc client: call failed: {0}")]
    Cancelled(String),

    /// The server reported a failure in the response header.
    #[error("{0}")]
    Remote(String),

    /// The client entered shutdown while this call was pending.
    #[error("connection shutdown: {0}")]
    Shutdown(String),

    /// Protocol violation (malformed address, corrupt frame, bad reply body).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// HTTP request to the registry failed.
    #[error("registry http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Service discovery could not produce a server address.
    #[error("fastrpc discovery: {0}")]
    Discovery(String),
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
