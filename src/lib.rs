//! Duplex MessagePack-RPC endpoint for Rust.
//!
//! A process can act as caller, callee, or both over a single byte-stream
//! connection. The [`Endpoint`] owns the connection, correlates asynchronous
//! request/response traffic, supports fire-and-forget notifications, and
//! survives transient connection loss through a pluggable
//! [`ReconnectPolicy`].
//!
//! To serve methods:
//! 1. Build a [`Router`] and register call/notify handlers
//! 2. Create an [`Endpoint`] with `Mode::Server` (or `Mode::Both`)
//! 3. Attach an established stream with [`Endpoint::attach_connection`]
//!
//! To issue calls:
//! 1. Create an [`Endpoint`] with `Mode::Client` (or `Mode::Both`)
//! 2. Attach a stream, then use [`Endpoint::call`] and [`Endpoint::notify`]
//!
//! Listener setup and connection establishment are the application's job;
//! the endpoint consumes any `AsyncRead + AsyncWrite` stream.
//!
//! Uses `tokio` for async I/O and `rmpv` for MessagePack serialization.

mod endpoint;
mod error;
mod message;
mod reconnect;
mod router;

pub use endpoint::*;
pub use error::*;
pub use message::*;
pub use reconnect::*;
pub use router::*;

pub use rmpv::Value;
