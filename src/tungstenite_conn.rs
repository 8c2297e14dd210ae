//! [`MessageConn`] for `tokio-tungstenite` connections.
//!
//! Lets a [`WebSocketStream`] established with `tokio-tungstenite` be
//! wrapped in a [`WsConn`](crate::WsConn). tungstenite answers pings
//! itself; pongs and raw frames are skipped while waiting for data.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, trace};

use crate::conn::{MessageConn, MessageKind, MessageReader, MessageWriter};
use crate::error::{Error, ProtocolError, Result};
use crate::websocket::{CloseFrame, SocketInfo};

/// A `tokio-tungstenite` stream seen as a [`MessageConn`].
pub struct TungsteniteConn<S> {
    shared: Arc<Shared<S>>,
    inbound: Mutex<Inbound<S>>,
    socket: SocketInfo,
}

struct Shared<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    read_deadline: StdMutex<Option<Instant>>,
    write_deadline: StdMutex<Option<Instant>>,
    closed: AtomicBool,
}

struct Inbound<S> {
    stream: SplitStream<WebSocketStream<S>>,
    peer_close: Option<CloseFrame>,
}

impl<S> TungsteniteConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an established stream.
    pub fn new(stream: WebSocketStream<S>) -> Self {
        let (sink, stream) = stream.split();
        Self {
            shared: Arc::new(Shared {
                sink: Mutex::new(sink),
                read_deadline: StdMutex::new(None),
                write_deadline: StdMutex::new(None),
                closed: AtomicBool::new(false),
            }),
            inbound: Mutex::new(Inbound {
                stream,
                peer_close: None,
            }),
            socket: SocketInfo::default(),
        }
    }

    /// Attach the transport's addresses.
    pub fn with_socket_info(mut self, socket: SocketInfo) -> Self {
        self.socket = socket;
        self
    }
}

impl<S> MessageConn for TungsteniteConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Reader = TungsteniteReader;
    type Writer = TungsteniteWriter<S>;

    async fn next_reader(&self) -> Result<(MessageKind, Self::Reader)> {
        let mut inbound = self.inbound.lock().await;
        loop {
            if let Some(frame) = &inbound.peer_close {
                return Err(Error::ConnectionClosed(Some(frame.clone())));
            }
            let deadline = *lock(&self.shared.read_deadline);
            let next = match deadline {
                Some(at) => tokio::time::timeout_at(at, inbound.stream.next())
                    .await
                    .map_err(|_| Error::DeadlineExceeded)?,
                None => inbound.stream.next().await,
            };

            let (kind, payload) = match next {
                Some(Ok(Message::Text(text))) => (MessageKind::Text, Bytes::from(text)),
                Some(Ok(Message::Binary(data))) => (MessageKind::Binary, Bytes::from(data)),
                Some(Ok(Message::Close(frame))) => {
                    let frame = match frame {
                        Some(frame) => CloseFrame::new(u16::from(frame.code), frame.reason),
                        None => CloseFrame::new(CloseFrame::NO_STATUS, ""),
                    };
                    debug!(code = frame.code, reason = %frame.reason, "close frame received");
                    inbound.peer_close = Some(frame.clone());
                    return Err(Error::ConnectionClosed(Some(frame)));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed))
                | None => return Err(Error::ConnectionClosed(None)),
                Some(Err(err)) => return Err(map_error(err)),
            };
            trace!(?kind, len = payload.len(), "inbound message");
            return Ok((kind, TungsteniteReader { payload }));
        }
    }

    async fn next_writer(&self, kind: MessageKind) -> Result<Self::Writer> {
        self.shared.check_open()?;
        Ok(TungsteniteWriter {
            shared: Arc::clone(&self.shared),
            kind,
            payload: BytesMut::new(),
        })
    }

    async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyClosed);
        }
        debug!("closing tungstenite connection");
        let frame = WsCloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        self.shared.send(Message::Close(Some(frame))).await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.socket.remote
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.shared.check_open()?;
        *lock(&self.shared.read_deadline) = deadline;
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.shared.check_open()?;
        *lock(&self.shared.write_deadline) = deadline;
        Ok(())
    }
}

impl<S> Shared<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::AlreadyClosed)
        } else {
            Ok(())
        }
    }

    async fn send(&self, message: Message) -> Result<()> {
        let deadline = *lock(&self.write_deadline);
        let mut sink = self.sink.lock().await;
        with_deadline(deadline, sink.send(message)).await
    }
}

/// Payload of one inbound tungstenite message.
#[derive(Debug)]
pub struct TungsteniteReader {
    payload: Bytes,
}

impl MessageReader for TungsteniteReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.payload.is_empty() {
            return Err(Error::EndOfMessage);
        }
        let n = buf.len().min(self.payload.len());
        buf[..n].copy_from_slice(&self.payload.split_to(n));
        Ok(n)
    }
}

/// Buffers one outbound message until [`close`](MessageWriter::close).
pub struct TungsteniteWriter<S> {
    shared: Arc<Shared<S>>,
    kind: MessageKind,
    payload: BytesMut,
}

impl<S> MessageWriter for TungsteniteWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.payload.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn close(self) -> Result<()> {
        self.shared.check_open()?;
        let message = match self.kind {
            MessageKind::Text => Message::Text(
                String::from_utf8(self.payload.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)?,
            ),
            MessageKind::Binary => Message::Binary(self.payload.to_vec()),
        };
        self.shared.send(message).await
    }
}

async fn with_deadline<F>(deadline: Option<Instant>, fut: F) -> Result<()>
where
    F: Future<Output = std::result::Result<(), tungstenite::Error>>,
{
    let output = match deadline {
        Some(at) => tokio::time::timeout_at(at, fut)
            .await
            .map_err(|_| Error::DeadlineExceeded)?,
        None => fut.await,
    };
    output.map_err(map_error)
}

fn map_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Io(err) => Error::Io(err),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            Error::AlreadyClosed
        }
        other => Error::Io(io::Error::new(io::ErrorKind::InvalidData, other)),
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WsConn;
    use crate::websocket::{Role as SessionRole, WebSocket};
    use tokio::io::{DuplexStream, duplex};
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn tungstenite_pair() -> (TungsteniteConn<DuplexStream>, TungsteniteConn<DuplexStream>) {
        let (client, server) = duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        (TungsteniteConn::new(client), TungsteniteConn::new(server))
    }

    async fn read_exact<C: MessageConn>(conn: &WsConn<C>, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        while out.len() < len {
            let n = conn.read(&mut buf).await.unwrap();
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[tokio::test]
    async fn test_byte_stream_round_trip() {
        let (client, server) = tungstenite_pair().await;
        let client = WsConn::new(client);
        let server = WsConn::new(server);

        assert_eq!(client.write(b"hello ").await.unwrap(), 6);
        assert_eq!(client.write(b"world").await.unwrap(), 5);
        assert_eq!(read_exact(&server, 11).await, b"hello world");

        server.write(b"pong").await.unwrap();
        assert_eq!(read_exact(&client, 4).await, b"pong");
    }

    #[tokio::test]
    async fn test_close_is_normal_closure() {
        let (client, server) = tungstenite_pair().await;
        let client = WsConn::new(client);
        let server = WsConn::new(server);

        client.write(b"last").await.unwrap();
        client.close().await.unwrap();
        assert!(matches!(client.close().await, Err(Error::AlreadyClosed)));
        assert!(matches!(
            client.write(b"more").await,
            Err(Error::AlreadyClosed)
        ));

        assert_eq!(read_exact(&server, 4).await, b"last");
        let mut buf = [0u8; 4];
        let err = server.read(&mut buf).await.unwrap_err();
        assert!(err.is_normal_closure(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_interoperates_with_session() {
        let (client, server) = duplex(64 * 1024);
        let client = WsConn::new(WebSocket::new(client, SessionRole::Client));
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let server = WsConn::new(TungsteniteConn::new(server));

        client.write(b"from session").await.unwrap();
        assert_eq!(read_exact(&server, 12).await, b"from session");

        server.write(b"from tungstenite").await.unwrap();
        assert_eq!(read_exact(&client, 16).await, b"from tungstenite");
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let (_client, server) = tungstenite_pair().await;
        server.set_read_deadline(Some(Instant::now())).unwrap();
        assert!(matches!(
            server.next_reader().await,
            Err(Error::DeadlineExceeded)
        ));
    }
}
