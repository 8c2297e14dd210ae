//! Expose an established WebSocket connection as a full-duplex byte stream.
//!
//! [`WsConn`] hides inbound message boundaries so consecutive reads see the
//! concatenated payloads, and sends every write as one binary message. This
//! lets byte-oriented protocols such as STOMP or SSH run over a WebSocket
//! unchanged. [`WsIo`] adds tokio's `AsyncRead` and `AsyncWrite` on top.
//!
//! The [`websocket`] module provides an RFC 6455 session over any tokio
//! transport. Connections made with `tokio-tungstenite` are wrapped with
//! `TungsteniteConn` (feature `tungstenite`, on by default); other sessions
//! plug in through the [`conn`] traits.

#![warn(clippy::dbg_macro, clippy::print_stdout)]
#![warn(missing_docs)]

mod adapter;
pub mod conn;
mod error;
mod io;
#[cfg(feature = "tungstenite")]
mod tungstenite_conn;

/// RFC 6455 framing and sessions
pub mod websocket;

pub use adapter::WsConn;
pub use conn::{MessageConn, MessageKind, MessageReader, MessageWriter};
pub use error::{Error, ProtocolError, Result};
pub use io::WsIo;
#[cfg(feature = "tungstenite")]
pub use tungstenite_conn::{TungsteniteConn, TungsteniteReader, TungsteniteWriter};
pub use websocket::{CloseFrame, Config, Role, SocketInfo, WebSocket};
