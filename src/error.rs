use std::{io, time::Duration};

use rmpv::Value;
use thiserror::Error;

/// Errors that can occur during RPC operations.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The caller passed a malformed method name, or the operation is not
    /// legal for the endpoint's mode. Fails fast, no I/O is performed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Decoded bytes do not match the msgpack-rpc schema, or a message kind
    /// is illegal for the endpoint's mode. Fatal to the current connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A value could not be serialized to MessagePack.
    #[error("encode error: {0}")]
    Encode(#[from] rmpv::encode::Error),

    /// Transport-level read/write failure or peer-initiated close.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// A call did not receive a response within the configured duration.
    /// Local-only; the connection is unaffected.
    #[error("call {id} timed out after {timeout:?}")]
    Timeout { id: u32, timeout: Duration },

    /// The peer's handler reported a failure. Carries the peer-supplied
    /// error payload.
    #[error("remote error: {0}")]
    Remote(Value),

    /// The endpoint has been closed.
    #[error("endpoint closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, RpcError>;
