//! Message-oriented connection traits consumed by [`WsConn`](crate::WsConn).
//!
//! These describe what an established WebSocket session must offer: a
//! blocking source of inbound message readers, a factory for outbound
//! message writers, close, addresses and per-direction deadlines. The
//! [`WebSocket`](crate::websocket::WebSocket) session implements them over
//! any tokio transport; other WebSocket libraries can be plugged in the same
//! way.

use std::future::Future;
use std::net::SocketAddr;

use tokio::time::Instant;

use crate::error::Result;

/// Payload classification of a WebSocket data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// UTF-8 text message.
    Text,
    /// Binary message.
    Binary,
}

/// Reads the payload of one inbound message.
pub trait MessageReader: Send {
    /// Copy payload bytes into `buf`, returning how many were copied.
    ///
    /// Returns `Err(Error::EndOfMessage)` once the payload is exhausted.
    /// Returns `Ok(0)` only for an empty `buf`.
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<usize>> + Send;
}

/// Writes the payload of one outbound message.
pub trait MessageWriter: Send {
    /// Append `buf` to the message payload.
    fn write(&mut self, buf: &[u8]) -> impl Future<Output = Result<usize>> + Send;

    /// Finish the message and flush it to the transport.
    fn close(self) -> impl Future<Output = Result<()>> + Send;
}

/// An established, message-oriented WebSocket connection.
pub trait MessageConn: Send + Sync + 'static {
    /// Reader handed out by [`next_reader`](MessageConn::next_reader).
    type Reader: MessageReader;
    /// Writer handed out by [`next_writer`](MessageConn::next_writer).
    type Writer: MessageWriter;

    /// Wait for the next inbound data message.
    fn next_reader(&self) -> impl Future<Output = Result<(MessageKind, Self::Reader)>> + Send;

    /// Start an outbound message of the given kind.
    fn next_writer(&self, kind: MessageKind) -> impl Future<Output = Result<Self::Writer>> + Send;

    /// Close the connection.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;

    /// Local address of the transport, if it has one.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Remote address of the transport, if it has one.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Bound future reads by `deadline`; `None` removes the bound.
    fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<()>;

    /// Bound future writes by `deadline`; `None` removes the bound.
    fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<()>;
}
