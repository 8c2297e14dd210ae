//! Error types shared by the adapter and the WebSocket session.

use std::io;

use thiserror::Error;

use crate::websocket::CloseFrame;

/// Result type for stream and session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by [`WsConn`](crate::WsConn) and the WebSocket session.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The peer violated RFC 6455 framing rules.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The peer closed the connection.
    ///
    /// `None` means the transport ended without a close frame.
    #[error("connection closed: {}", describe_close(.0))]
    ConnectionClosed(Option<CloseFrame>),

    /// The connection was already closed locally.
    #[error("connection already closed")]
    AlreadyClosed,

    /// A read or write deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// An inbound message exceeded the configured size limit.
    #[error("message exceeds {limit} bytes")]
    MessageTooLarge {
        /// Configured limit in bytes.
        limit: usize,
    },

    /// The payload of the current inbound message is exhausted.
    ///
    /// Readers use this to mark a message boundary; [`WsConn`](crate::WsConn)
    /// never returns it.
    #[error("end of message")]
    EndOfMessage,
}

impl Error {
    /// Returns true if the peer ended the connection with a clean close
    /// handshake (normal closure, going away or no status).
    pub fn is_normal_closure(&self) -> bool {
        matches!(self, Error::ConnectionClosed(Some(frame)) if frame.is_normal())
    }

    /// Copy of this error, for reporting a stored failure again.
    ///
    /// I/O errors keep their kind and message but lose their source.
    pub(crate) fn replay(&self) -> Error {
        match self {
            Error::Io(inner) => Error::Io(io::Error::new(inner.kind(), inner.to_string())),
            Error::Protocol(err) => Error::Protocol(err.clone()),
            Error::ConnectionClosed(frame) => Error::ConnectionClosed(frame.clone()),
            Error::AlreadyClosed => Error::AlreadyClosed,
            Error::DeadlineExceeded => Error::DeadlineExceeded,
            Error::MessageTooLarge { limit } => Error::MessageTooLarge { limit: *limit },
            Error::EndOfMessage => Error::EndOfMessage,
        }
    }
}

fn describe_close(frame: &Option<CloseFrame>) -> String {
    match frame {
        Some(frame) => frame.to_string(),
        None => "abnormal closure".to_string(),
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(inner) => inner,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

impl Error {
    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Error::Io(inner) => inner.kind(),
            Error::ConnectionClosed(None) => io::ErrorKind::UnexpectedEof,
            Error::ConnectionClosed(Some(_)) => io::ErrorKind::ConnectionAborted,
            Error::AlreadyClosed => io::ErrorKind::NotConnected,
            Error::DeadlineExceeded => io::ErrorKind::TimedOut,
            Error::Protocol(_) | Error::MessageTooLarge { .. } => io::ErrorKind::InvalidData,
            Error::EndOfMessage => io::ErrorKind::Other,
        }
    }
}

/// Framing violations detected while decoding inbound frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Opcode not defined by RFC 6455.
    #[error("invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    /// Reserved bits set without a negotiated extension.
    #[error("reserved bits set without extension")]
    ReservedBitsSet,

    /// Control frame payload longer than 125 bytes.
    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,

    /// Control frame without the FIN bit.
    #[error("control frame is fragmented")]
    ControlFrameFragmented,

    /// Payload length with the most significant bit set.
    #[error("frame too large")]
    FrameTooLarge,

    /// A server received a frame without a masking key.
    #[error("client frame is not masked")]
    UnmaskedFrame,

    /// A client received a frame with a masking key.
    #[error("server frame is masked")]
    MaskedFrame,

    /// Continuation frame with no message in progress.
    #[error("continuation frame outside a fragmented message")]
    UnexpectedContinuation,

    /// New data frame while a fragmented message is in progress.
    #[error("expected continuation frame")]
    ExpectedContinuation,

    /// Close frame payload of a single byte.
    #[error("invalid close frame payload")]
    InvalidClosePayload,

    /// Close status code that must not appear on the wire.
    #[error("invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// Close reason is not valid UTF-8.
    #[error("invalid UTF-8 in close reason")]
    InvalidUtf8,
}
