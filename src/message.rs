//! msgpack-rpc message types and the streaming wire codec.
//!
//! Each message is a fixed-arity MessagePack array whose first element is an
//! integer type tag. The serialization is self-delimiting, so no external
//! framing is added. [`Codec`] accumulates raw bytes from the socket and
//! yields complete messages as they become available, handling messages that
//! arrive split across reads as well as several messages in one read.
use std::io::{self, Cursor};

use bytes::{Buf, Bytes, BytesMut};
use rmpv::Value;

use crate::error::*;

const REQUEST_MESSAGE: u64 = 0;
const RESPONSE_MESSAGE: u64 = 1;
const NOTIFICATION_MESSAGE: u64 = 2;

/// The three msgpack-rpc message kinds: requests, responses, and
/// notifications.
#[derive(PartialEq, Clone, Debug)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// An RPC request carrying a correlation id, method name, and parameters.
#[derive(PartialEq, Clone, Debug)]
pub struct Request {
    pub id: u32,
    pub method: String,
    pub params: Vec<Value>,
}

/// An RPC response carrying a correlation id and either a result or an error.
#[derive(PartialEq, Clone, Debug)]
pub struct Response {
    pub id: u32,
    pub result: std::result::Result<Value, Value>,
}

/// A one-way RPC notification carrying a method name and parameters.
#[derive(PartialEq, Clone, Debug)]
pub struct Notification {
    pub method: String,
    pub params: Vec<Value>,
}

impl Message {
    /// A short name for the message kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "request",
            Message::Response(_) => "response",
            Message::Notification(_) => "notification",
        }
    }

    /// Converts the message to its msgpack-rpc wire value.
    pub fn to_value(&self) -> Value {
        match self {
            Message::Request(req) => Value::Array(vec![
                Value::Integer(REQUEST_MESSAGE.into()),
                Value::Integer(req.id.into()),
                Value::String(req.method.clone().into()),
                Value::Array(req.params.clone()),
            ]),
            Message::Response(resp) => Value::Array(vec![
                Value::Integer(RESPONSE_MESSAGE.into()),
                Value::Integer(resp.id.into()),
                match &resp.result {
                    Ok(_) => Value::Nil,
                    Err(err) => err.clone(),
                },
                match &resp.result {
                    Ok(value) => value.clone(),
                    Err(_) => Value::Nil,
                },
            ]),
            Message::Notification(notif) => Value::Array(vec![
                Value::Integer(NOTIFICATION_MESSAGE.into()),
                Value::String(notif.method.clone().into()),
                Value::Array(notif.params.clone()),
            ]),
        }
    }

    /// Creates a message from a decoded wire value, validating tag and arity.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(array) => {
                if array.is_empty() {
                    return Err(RpcError::Protocol("empty message array".into()));
                }
                match array[0] {
                    Value::Integer(msg_type) => match msg_type.as_u64() {
                        Some(REQUEST_MESSAGE) => {
                            if array.len() != 4 {
                                return Err(RpcError::Protocol(
                                    "invalid request message length".into(),
                                ));
                            }
                            let id = array[1]
                                .as_u64()
                                .ok_or(RpcError::Protocol("invalid request id".into()))?
                                as u32;
                            let method = array[2]
                                .as_str()
                                .ok_or(RpcError::Protocol("invalid request method".into()))?
                                .to_string();
                            let params = match &array[3] {
                                Value::Array(params) => params.clone(),
                                _ => {
                                    return Err(RpcError::Protocol("invalid request params".into()))
                                }
                            };
                            Ok(Message::Request(Request { id, method, params }))
                        }
                        Some(RESPONSE_MESSAGE) => {
                            if array.len() != 4 {
                                return Err(RpcError::Protocol(
                                    "invalid response message length".into(),
                                ));
                            }
                            let id = array[1]
                                .as_u64()
                                .ok_or(RpcError::Protocol("invalid response id".into()))?
                                as u32;
                            let result = if array[2] == Value::Nil {
                                Ok(array[3].clone())
                            } else {
                                Err(array[2].clone())
                            };
                            Ok(Message::Response(Response { id, result }))
                        }
                        Some(NOTIFICATION_MESSAGE) => {
                            if array.len() != 3 {
                                return Err(RpcError::Protocol(
                                    "invalid notification message length".into(),
                                ));
                            }
                            let method = array[1]
                                .as_str()
                                .ok_or(RpcError::Protocol("invalid notification method".into()))?
                                .to_string();
                            let params = match &array[2] {
                                Value::Array(params) => params.clone(),
                                _ => {
                                    return Err(RpcError::Protocol(
                                        "invalid notification params".into(),
                                    ))
                                }
                            };
                            Ok(Message::Notification(Notification { method, params }))
                        }
                        _ => Err(RpcError::Protocol("invalid message type tag".into())),
                    },
                    _ => Err(RpcError::Protocol("invalid message type tag".into())),
                }
            }
            _ => Err(RpcError::Protocol("message is not an array".into())),
        }
    }

    /// Encodes the message to MessagePack bytes.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &self.to_value())?;
        Ok(Bytes::from(buf))
    }
}

/// Streaming decoder for inbound msgpack-rpc traffic.
///
/// Bytes read from the socket are appended with [`feed`](Codec::feed);
/// [`try_decode`](Codec::try_decode) yields the next fully-buffered message
/// without blocking and never partially consumes one. The reader loop must
/// drain it until `Ok(None)` before reading again.
#[derive(Debug)]
pub struct Codec {
    buf: BytesMut,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    pub fn new() -> Self {
        Self::with_capacity(64 * 1024)
    }

    /// Creates a codec with an initial buffer capacity, typically the
    /// reader's chunk size. The buffer still grows past it as needed.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Appends raw bytes received from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete message, or `None` if more bytes are needed.
    ///
    /// Malformed framing (bad tag, wrong arity, unexpected element types, or
    /// undecodable MessagePack) fails with [`RpcError::Protocol`]; the caller
    /// must then treat the connection as unusable.
    pub fn try_decode(&mut self) -> Result<Option<Message>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&self.buf[..]);
        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => {
                let consumed = cursor.position() as usize;
                self.buf.advance(consumed);
                Message::from_value(value).map(Some)
            }
            Err(rmpv::decode::Error::InvalidMarkerRead(e))
            | Err(rmpv::decode::Error::InvalidDataRead(e))
                if e.kind() == io::ErrorKind::UnexpectedEof =>
            {
                // Message split across reads; wait for the rest.
                Ok(None)
            }
            Err(e) => Err(RpcError::Protocol(format!("undecodable msgpack: {}", e))),
        }
    }
}
