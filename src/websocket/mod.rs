//! RFC 6455 session layer for already-upgraded transports.
//!
//! This module provides frame parsing and encoding, a streaming frame codec
//! for `tokio_util::codec`, and [`WebSocket`], a message-oriented session
//! implementing [`MessageConn`](crate::conn::MessageConn).

mod codec;
mod config;
mod frame;
mod session;
mod socket;

pub use codec::{FrameCodec, FrameEvent, OutFrame};
pub use config::{Config, Role};
pub use frame::{CloseFrame, FrameHeader, MAX_CONTROL_PAYLOAD, Opcode, apply_mask};
pub use session::{WebSocket, WsMessageReader, WsMessageWriter};
pub use socket::SocketInfo;
