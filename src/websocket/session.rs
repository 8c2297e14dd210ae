//! Established WebSocket session over a tokio transport.
//!
//! The transport is split into an inbound half, which decodes frames with
//! [`FrameCodec`] and streams message payloads, and an outbound half, which
//! encodes whole messages. Each half sits behind its own lock so reads and
//! writes proceed independently; control replies (pong, close echo) take the
//! outbound lock briefly from the read path.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use super::codec::{FrameCodec, FrameEvent, OutFrame};
use super::config::{Config, Role};
use super::frame::{CloseFrame, MAX_CONTROL_PAYLOAD, Opcode};
use super::socket::SocketInfo;
use crate::conn::{MessageConn, MessageKind, MessageReader, MessageWriter};
use crate::error::{Error, ProtocolError, Result};

impl From<MessageKind> for Opcode {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Text => Opcode::Text,
            MessageKind::Binary => Opcode::Binary,
        }
    }
}

/// A post-handshake WebSocket connection.
///
/// Implements [`MessageConn`], so it can be wrapped in a
/// [`WsConn`](crate::WsConn) to be used as a byte stream.
///
/// Read failures are permanent: once a read fails, including by reaching
/// the read deadline, every later read returns the same error. The rest of
/// an interrupted message is never skipped silently.
pub struct WebSocket<S> {
    inbound: Arc<Mutex<Inbound<S>>>,
    shared: Arc<Shared<S>>,
    socket: SocketInfo,
}

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap an upgraded transport with the default configuration.
    pub fn new(io: S, role: Role) -> Self {
        Self::with_config(io, role, Config::default())
    }

    /// Wrap an upgraded transport.
    pub fn with_config(io: S, role: Role, config: Config) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        let inbound = Inbound {
            io: read_half,
            codec: FrameCodec::new(role),
            buffer: BytesMut::with_capacity(config.read_buffer_size),
            eof: false,
            peer_close: None,
            seq: 0,
            message: None,
            failure: None,
        };
        let outbound = Outbound {
            io: write_half,
            codec: FrameCodec::new(role),
            buffer: BytesMut::new(),
            close_sent: false,
            failed: false,
        };
        Self {
            inbound: Arc::new(Mutex::new(inbound)),
            shared: Arc::new(Shared {
                outbound: Mutex::new(outbound),
                config,
                read_deadline: StdMutex::new(None),
                write_deadline: StdMutex::new(None),
                closed: AtomicBool::new(false),
            }),
            socket: SocketInfo::default(),
        }
    }

    /// Attach the transport's addresses.
    pub fn with_socket_info(mut self, socket: SocketInfo) -> Self {
        self.socket = socket;
        self
    }

    /// Session configuration.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Send a ping with up to 125 bytes of payload.
    pub async fn ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::ControlFrameTooLarge.into());
        }
        self.shared
            .send(vec![OutFrame::control(Opcode::Ping, payload)])
            .await
    }
}

impl WebSocket<TcpStream> {
    /// Wrap an upgraded TCP stream, recording its addresses.
    pub fn from_tcp(stream: TcpStream, role: Role, config: Config) -> Self {
        let socket = SocketInfo::from_tcp(&stream);
        Self::with_config(stream, role, config).with_socket_info(socket)
    }
}

impl<S> MessageConn for WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    type Reader = WsMessageReader<S>;
    type Writer = WsMessageWriter<S>;

    async fn next_reader(&self) -> Result<(MessageKind, Self::Reader)> {
        let mut inbound = self.inbound.lock().await;
        inbound.check_failure()?;
        let result = inbound.next_message(&self.shared).await;
        let kind = inbound.record(result)?;

        let reader = WsMessageReader {
            inbound: Arc::clone(&self.inbound),
            shared: Arc::clone(&self.shared),
            seq: inbound.seq,
        };
        Ok((kind, reader))
    }

    async fn next_writer(&self, kind: MessageKind) -> Result<Self::Writer> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }
        Ok(WsMessageWriter {
            shared: Arc::clone(&self.shared),
            kind,
            payload: BytesMut::new(),
        })
    }

    async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyClosed);
        }
        debug!("closing websocket session");

        let sent = self
            .shared
            .send_close(&CloseFrame::new(CloseFrame::NORMAL, ""))
            .await;
        let deadline = self.shared.write_deadline();
        let mut outbound = self.shared.outbound.lock().await;
        let shutdown = with_deadline(deadline, outbound.io.shutdown()).await;
        sent.and(shutdown)
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

/// Payload reader for one inbound message of a [`WebSocket`].
///
/// A reader whose message was superseded by a later
/// [`next_reader`](MessageConn::next_reader) call reports end of message.
pub struct WsMessageReader<S> {
    inbound: Arc<Mutex<Inbound<S>>>,
    shared: Arc<Shared<S>>,
    seq: u64,
}

impl<S> MessageReader for WsMessageReader<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut inbound = self.inbound.lock().await;
        inbound.check_failure()?;
        if inbound.seq != self.seq {
            return Err(Error::EndOfMessage);
        }
        let result = inbound.read_payload(buf, &self.shared).await;
        inbound.record(result)
    }
}

/// Payload writer for one outbound message of a [`WebSocket`].
///
/// Bytes are buffered until [`close`](MessageWriter::close), which sends the
/// message and flushes the transport.
pub struct WsMessageWriter<S> {
    shared: Arc<Shared<S>>,
    kind: MessageKind,
    payload: BytesMut,
}

impl<S> MessageWriter for WsMessageWriter<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.payload.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn close(self) -> Result<()> {
        let len = self.payload.len();
        let frames = fragment(
            self.kind,
            self.payload.freeze(),
            self.shared.config.max_frame_size,
        );
        trace!(kind = ?self.kind, len, frames = frames.len(), "sending message");
        self.shared.send(frames).await
    }
}

/// Split a message payload into frames of at most `max_frame_size` bytes.
fn fragment(kind: MessageKind, mut payload: Bytes, max_frame_size: usize) -> Vec<OutFrame> {
    let max_frame_size = max_frame_size.max(1);
    let mut frames = Vec::with_capacity(payload.len() / max_frame_size + 1);
    let mut opcode = Opcode::from(kind);
    loop {
        let chunk = payload.split_to(payload.len().min(max_frame_size));
        let fin = payload.is_empty();
        frames.push(OutFrame {
            opcode,
            fin,
            payload: chunk,
        });
        if fin {
            return frames;
        }
        opcode = Opcode::Continuation;
    }
}

async fn with_deadline<T, F>(deadline: Option<Instant>, fut: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    let output = match deadline {
        Some(at) => tokio::time::timeout_at(at, fut)
            .await
            .map_err(|_| Error::DeadlineExceeded)?,
        None => fut.await,
    };
    Ok(output?)
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared<S> {
    outbound: Mutex<Outbound<S>>,
    config: Config,
    read_deadline: StdMutex<Option<Instant>>,
    write_deadline: StdMutex<Option<Instant>>,
    closed: AtomicBool,
}

impl<S> Shared<S>
where
    S: AsyncWrite,
{
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::AlreadyClosed)
        } else {
            Ok(())
        }
    }

    fn read_deadline(&self) -> Option<Instant> {
        *lock(&self.read_deadline)
    }

    fn write_deadline(&self) -> Option<Instant> {
        *lock(&self.write_deadline)
    }

    async fn send(&self, frames: Vec<OutFrame>) -> Result<()> {
        let deadline = self.write_deadline();
        let mut outbound = self.outbound.lock().await;
        if outbound.close_sent {
            return Err(Error::AlreadyClosed);
        }
        outbound.write_frames(frames, deadline).await
    }

    /// Send a close frame unless one was already sent.
    async fn send_close(&self, frame: &CloseFrame) -> Result<()> {
        let deadline = self.write_deadline();
        let mut outbound = self.outbound.lock().await;
        if outbound.close_sent {
            return Ok(());
        }
        outbound.close_sent = true;
        trace!(code = frame.code, "sending close frame");
        outbound
            .write_frames(vec![OutFrame::control(Opcode::Close, frame.encode())], deadline)
            .await
    }
}

struct Outbound<S> {
    io: WriteHalf<S>,
    codec: FrameCodec,
    buffer: BytesMut,
    close_sent: bool,
    failed: bool,
}

impl<S> Outbound<S>
where
    S: AsyncWrite,
{
    async fn write_frames(&mut self, frames: Vec<OutFrame>, deadline: Option<Instant>) -> Result<()> {
        if self.failed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "previous write failed").into());
        }
        for frame in frames {
            self.codec.encode(frame, &mut self.buffer)?;
        }

        let Self { io, buffer, .. } = self;
        let result = with_deadline(deadline, async {
            io.write_all(&buffer[..]).await?;
            io.flush().await
        })
        .await;
        // A partially written frame leaves the stream unusable.
        self.buffer.clear();
        if result.is_err() {
            self.failed = true;
        }
        result
    }
}

/// Progress through the current inbound message.
#[derive(Debug, Default)]
struct Progress {
    fin: bool,
    frame_left: u64,
    announced: u64,
    pending: Bytes,
}

struct Inbound<S> {
    io: ReadHalf<S>,
    codec: FrameCodec,
    buffer: BytesMut,
    eof: bool,
    peer_close: Option<CloseFrame>,
    seq: u64,
    message: Option<Progress>,
    // First read failure; every later read reports it again.
    failure: Option<Error>,
}

impl<S> Inbound<S>
where
    S: AsyncRead + AsyncWrite,
{
    fn check_failure(&self) -> Result<()> {
        match &self.failure {
            Some(err) => Err(err.replay()),
            None => Ok(()),
        }
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) | Err(Error::EndOfMessage) => {}
            Err(err) if self.failure.is_none() => {
                debug!(error = %err, "inbound stream failed");
                self.failure = Some(err.replay());
            }
            Err(_) => {}
        }
        result
    }

    /// Skip the rest of any current message and start the next data message.
    async fn next_message(&mut self, shared: &Shared<S>) -> Result<MessageKind> {
        if self.message.is_some() {
            self.discard_message(shared).await?;
        }

        loop {
            match self.next_event(shared).await? {
                FrameEvent::FrameStart { opcode, fin, len } => {
                    let kind = match opcode {
                        Opcode::Text => MessageKind::Text,
                        Opcode::Binary => MessageKind::Binary,
                        _ => {
                            let err = ProtocolError::UnexpectedContinuation;
                            return Err(self.fail(shared, err).await);
                        }
                    };
                    self.seq += 1;
                    self.message = Some(Progress::default());
                    self.start_frame(fin, len, shared).await?;
                    trace!(?kind, len, fin, "inbound message started");
                    return Ok(kind);
                }
                // Tail of a frame whose message was abandoned.
                FrameEvent::Payload(_) => continue,
                FrameEvent::Control { opcode, payload } => {
                    self.handle_control(opcode, payload, shared).await?;
                }
            }
        }
    }

    async fn next_event(&mut self, shared: &Shared<S>) -> Result<FrameEvent> {
        loop {
            if let Some(frame) = &self.peer_close {
                return Err(Error::ConnectionClosed(Some(frame.clone())));
            }
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(event)) => return Ok(event),
                Ok(None) => {}
                Err(Error::Protocol(err)) => return Err(self.fail(shared, err).await),
                Err(err) => return Err(err),
            }
            if self.eof {
                return Err(Error::ConnectionClosed(None));
            }

            self.buffer.reserve(shared.config.read_buffer_size);
            let n = with_deadline(shared.read_deadline(), self.io.read_buf(&mut self.buffer)).await?;
            if n == 0 {
                trace!(buffered = self.buffer.len(), "transport reached eof");
                self.eof = true;
            }
        }
    }

    async fn read_payload(&mut self, buf: &mut [u8], shared: &Shared<S>) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let Some(progress) = self.message.as_mut() else {
                return Err(Error::EndOfMessage);
            };
            if !progress.pending.is_empty() {
                let n = buf.len().min(progress.pending.len());
                buf[..n].copy_from_slice(&progress.pending.split_to(n));
                return Ok(n);
            }
            if progress.fin && progress.frame_left == 0 {
                self.message = None;
                return Err(Error::EndOfMessage);
            }

            match self.next_event(shared).await? {
                FrameEvent::Payload(chunk) => {
                    if let Some(progress) = self.message.as_mut() {
                        progress.frame_left -= chunk.len() as u64;
                        progress.pending = chunk;
                    }
                }
                FrameEvent::FrameStart {
                    opcode: Opcode::Continuation,
                    fin,
                    len,
                } => self.start_frame(fin, len, shared).await?,
                FrameEvent::FrameStart { .. } => {
                    return Err(self.fail(shared, ProtocolError::ExpectedContinuation).await);
                }
                FrameEvent::Control { opcode, payload } => {
                    self.handle_control(opcode, payload, shared).await?;
                }
            }
        }
    }

    async fn discard_message(&mut self, shared: &Shared<S>) -> Result<()> {
        let mut scratch = [0u8; 1024];
        loop {
            match self.read_payload(&mut scratch, shared).await {
                Ok(_) => {}
                Err(Error::EndOfMessage) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Account for a new data frame of the current message.
    async fn start_frame(&mut self, fin: bool, len: u64, shared: &Shared<S>) -> Result<()> {
        let Some(progress) = self.message.as_mut() else {
            return Ok(());
        };
        progress.fin = fin;
        progress.frame_left = len;
        progress.announced += len;

        match shared.config.max_message_size {
            Some(limit) if progress.announced > limit as u64 => {
                debug!(limit, announced = progress.announced, "inbound message too large");
                self.message = None;
                let frame = CloseFrame::new(CloseFrame::MESSAGE_TOO_BIG, "");
                if let Err(err) = shared.send_close(&frame).await {
                    trace!(error = %err, "close reply failed");
                }
                Err(Error::MessageTooLarge { limit })
            }
            _ => Ok(()),
        }
    }

    async fn handle_control(
        &mut self,
        opcode: Opcode,
        payload: Bytes,
        shared: &Shared<S>,
    ) -> Result<()> {
        match opcode {
            Opcode::Ping => {
                trace!(len = payload.len(), "ping received");
                match shared
                    .send(vec![OutFrame::control(Opcode::Pong, payload)])
                    .await
                {
                    Ok(()) | Err(Error::AlreadyClosed) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            Opcode::Pong => {
                trace!(len = payload.len(), "pong received");
                Ok(())
            }
            _ => {
                let frame = match CloseFrame::parse(&payload) {
                    Ok(frame) => frame,
                    Err(err) => return Err(self.fail(shared, err).await),
                };
                debug!(code = frame.code, reason = %frame.reason, "close frame received");

                let reply = CloseFrame::new(frame.code, "");
                if let Err(err) = shared.send_close(&reply).await {
                    trace!(error = %err, "close reply failed");
                }
                self.message = None;
                self.peer_close = Some(frame.clone());
                Err(Error::ConnectionClosed(Some(frame)))
            }
        }
    }

    /// Stop reading after a protocol violation and tell the peer why.
    async fn fail(&mut self, shared: &Shared<S>, err: ProtocolError) -> Error {
        debug!(error = %err, "protocol violation");
        self.eof = true;
        self.buffer.clear();
        self.message = None;

        let frame = CloseFrame::new(CloseFrame::PROTOCOL_ERROR, err.to_string());
        if let Err(close_err) = shared.send_close(&frame).await {
            trace!(error = %close_err, "close reply failed");
        }
        Error::Protocol(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WsConn;
    use std::time::Duration;
    use tokio::io::{DuplexStream, duplex};

    fn pair(config: Config) -> (WebSocket<DuplexStream>, WebSocket<DuplexStream>) {
        let (client, server) = duplex(64 * 1024);
        (
            WebSocket::with_config(client, Role::Client, config.clone()),
            WebSocket::with_config(server, Role::Server, config),
        )
    }

    /// Speaks raw frames to a session under test.
    struct RawPeer {
        io: DuplexStream,
        codec: FrameCodec,
        buffer: BytesMut,
    }

    impl RawPeer {
        fn new(io: DuplexStream, role: Role) -> Self {
            Self {
                io,
                codec: FrameCodec::new(role),
                buffer: BytesMut::new(),
            }
        }

        async fn send(&mut self, opcode: Opcode, fin: bool, payload: &'static [u8]) {
            let frame = OutFrame {
                opcode,
                fin,
                payload: Bytes::from_static(payload),
            };
            let mut encoded = BytesMut::new();
            self.codec.encode(frame, &mut encoded).unwrap();
            self.io.write_all(&encoded).await.unwrap();
        }

        async fn recv(&mut self) -> FrameEvent {
            loop {
                if let Some(event) = self.codec.decode(&mut self.buffer).unwrap() {
                    return event;
                }
                let n = self.io.read_buf(&mut self.buffer).await.unwrap();
                assert!(n > 0, "transport closed");
            }
        }
    }

    fn server_with_raw_client(config: Config) -> (WebSocket<DuplexStream>, RawPeer) {
        let (client, server) = duplex(64 * 1024);
        (
            WebSocket::with_config(server, Role::Server, config),
            RawPeer::new(client, Role::Client),
        )
    }

    async fn read_message<R: MessageReader>(reader: &mut R) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            match reader.read(&mut buf).await {
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(Error::EndOfMessage) => return out,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
    }

    async fn send_message<C: MessageConn>(conn: &C, kind: MessageKind, payload: &[u8]) {
        let mut writer = conn.next_writer(kind).await.unwrap();
        writer.write(payload).await.unwrap();
        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_message_round_trip() {
        let (client, server) = pair(Config::default());

        send_message(&client, MessageKind::Text, b"Hello WebSocket!").await;
        send_message(&client, MessageKind::Binary, &[1, 2, 3]).await;

        let (kind, mut reader) = server.next_reader().await.unwrap();
        assert_eq!(kind, MessageKind::Text);
        assert_eq!(read_message(&mut reader).await, b"Hello WebSocket!");

        let (kind, mut reader) = server.next_reader().await.unwrap();
        assert_eq!(kind, MessageKind::Binary);
        assert_eq!(read_message(&mut reader).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_fragmented_message_with_interleaved_ping() {
        let (server, mut raw) = server_with_raw_client(Config::default());

        raw.send(Opcode::Text, false, b"Hel").await;
        raw.send(Opcode::Ping, true, b"p").await;
        raw.send(Opcode::Continuation, true, b"lo").await;

        let (kind, mut reader) = server.next_reader().await.unwrap();
        assert_eq!(kind, MessageKind::Text);
        assert_eq!(read_message(&mut reader).await, b"Hello");

        assert_eq!(
            raw.recv().await,
            FrameEvent::Control {
                opcode: Opcode::Pong,
                payload: Bytes::from_static(b"p")
            }
        );
    }

    #[tokio::test]
    async fn test_empty_message() {
        let (client, server) = pair(Config::default());
        send_message(&client, MessageKind::Binary, b"").await;

        let (_, mut reader) = server.next_reader().await.unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            reader.read(&mut buf).await,
            Err(Error::EndOfMessage)
        ));
    }

    #[tokio::test]
    async fn test_close_frame_is_echoed() {
        let (server, mut raw) = server_with_raw_client(Config::default());
        raw.send(Opcode::Close, true, b"\x03\xe8bye").await;

        match server.next_reader().await {
            Err(Error::ConnectionClosed(Some(frame))) => {
                assert_eq!(frame, CloseFrame::new(1000, "bye"));
            }
            other => panic!("expected close, got {:?}", other.map(|(kind, _)| kind)),
        }
        assert!(matches!(
            server.next_reader().await,
            Err(Error::ConnectionClosed(Some(_)))
        ));

        match raw.recv().await {
            FrameEvent::Control {
                opcode: Opcode::Close,
                payload,
            } => assert_eq!(CloseFrame::parse(&payload).unwrap().code, 1000),
            other => panic!("expected close frame, got {other:?}"),
        }

        // The echo counts as our close frame; writes are refused afterwards.
        let writer = server.next_writer(MessageKind::Binary).await.unwrap();
        assert!(matches!(writer.close().await, Err(Error::AlreadyClosed)));
    }

    #[tokio::test]
    async fn test_transport_eof_is_abnormal_closure() {
        let (server, raw) = server_with_raw_client(Config::default());
        drop(raw);

        assert!(matches!(
            server.next_reader().await,
            Err(Error::ConnectionClosed(None))
        ));
    }

    #[tokio::test]
    async fn test_unmasked_client_frame_is_rejected() {
        let (server, mut raw) = server_with_raw_client(Config::default());
        raw.io.write_all(&[0x81, 0x02, b'h', b'i']).await.unwrap();

        assert!(matches!(
            server.next_reader().await,
            Err(Error::Protocol(ProtocolError::UnmaskedFrame))
        ));
        match raw.recv().await {
            FrameEvent::Control {
                opcode: Opcode::Close,
                payload,
            } => assert_eq!(
                CloseFrame::parse(&payload).unwrap().code,
                CloseFrame::PROTOCOL_ERROR
            ),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_continuation_without_message() {
        let (server, mut raw) = server_with_raw_client(Config::default());
        raw.send(Opcode::Continuation, true, b"x").await;

        assert!(matches!(
            server.next_reader().await,
            Err(Error::Protocol(ProtocolError::UnexpectedContinuation))
        ));
    }

    #[tokio::test]
    async fn test_message_too_large() {
        let config = Config::new().with_max_message_size(Some(4));
        let (server, mut raw) = server_with_raw_client(config);
        raw.send(Opcode::Binary, true, b"0123456789").await;

        assert!(matches!(
            server.next_reader().await,
            Err(Error::MessageTooLarge { limit: 4 })
        ));
        match raw.recv().await {
            FrameEvent::Control {
                opcode: Opcode::Close,
                payload,
            } => assert_eq!(
                CloseFrame::parse(&payload).unwrap().code,
                CloseFrame::MESSAGE_TOO_BIG
            ),
            other => panic!("expected close frame, got {other:?}"),
        }

        raw.send(Opcode::Binary, true, b"ok").await;
        assert!(matches!(
            server.next_reader().await,
            Err(Error::MessageTooLarge { limit: 4 })
        ));
    }

    #[tokio::test]
    async fn test_fragmented_message_too_large() {
        let config = Config::new().with_max_message_size(Some(4));
        let (server, mut raw) = server_with_raw_client(config);
        raw.send(Opcode::Binary, false, b"abc").await;
        raw.send(Opcode::Continuation, true, b"def").await;

        let (_, mut reader) = server.next_reader().await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 3);
        assert!(matches!(
            reader.read(&mut buf).await,
            Err(Error::MessageTooLarge { limit: 4 })
        ));
    }

    #[tokio::test]
    async fn test_read_deadline_is_permanent() {
        let (server, mut raw) = server_with_raw_client(Config::default());

        server.set_read_deadline(Some(Instant::now())).unwrap();
        assert!(matches!(
            server.next_reader().await,
            Err(Error::DeadlineExceeded)
        ));

        server.set_read_deadline(None).unwrap();
        raw.send(Opcode::Binary, true, b"late").await;
        assert!(matches!(
            server.next_reader().await,
            Err(Error::DeadlineExceeded)
        ));
    }

    #[tokio::test]
    async fn test_deadline_mid_message_does_not_skip_bytes() {
        let (server, mut raw) = server_with_raw_client(Config::default());
        let conn = WsConn::new(server);
        let mut buf = [0u8; 16];

        raw.send(Opcode::Binary, false, b"abc").await;
        assert_eq!(conn.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");

        conn.set_read_deadline(Some(Instant::now())).unwrap();
        assert!(matches!(
            conn.read(&mut buf).await,
            Err(Error::DeadlineExceeded)
        ));

        conn.set_read_deadline(None).unwrap();
        raw.send(Opcode::Continuation, true, b"def").await;
        raw.send(Opcode::Binary, true, b"ghi").await;
        // "def" was never delivered, so nothing after it may be either.
        for _ in 0..2 {
            assert!(matches!(
                conn.read(&mut buf).await,
                Err(Error::DeadlineExceeded)
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_deadline_breaks_outbound_stream() {
        // The peer never reads, so the transport buffer fills up.
        let (_client, server) = duplex(64);
        let conn = WsConn::new(WebSocket::new(server, Role::Server));

        conn.set_write_deadline(Some(Instant::now() + Duration::from_secs(5)))
            .unwrap();
        let started = Instant::now();
        assert!(matches!(
            conn.write(&[7u8; 1024]).await,
            Err(Error::DeadlineExceeded)
        ));
        assert!(started.elapsed() >= Duration::from_secs(5));

        // Part of a frame may be on the wire; later writes are refused.
        conn.set_write_deadline(None).unwrap();
        match conn.write(b"x").await {
            Err(Error::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("expected broken pipe, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_large_message_is_fragmented() {
        let config = Config::new().with_max_frame_size(4);
        let (server, mut raw) = server_with_raw_client(config);
        send_message(&server, MessageKind::Binary, b"abcdefghij").await;

        let mut starts = Vec::new();
        let mut payload = Vec::new();
        while payload.len() < 10 {
            match raw.recv().await {
                FrameEvent::FrameStart { opcode, fin, len } => starts.push((opcode, fin, len)),
                FrameEvent::Payload(chunk) => payload.extend_from_slice(&chunk),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(
            starts,
            vec![
                (Opcode::Binary, false, 4),
                (Opcode::Continuation, false, 4),
                (Opcode::Continuation, true, 2),
            ]
        );
        assert_eq!(payload, b"abcdefghij");
    }

    #[tokio::test]
    async fn test_superseded_reader_reports_end_of_message() {
        let (client, server) = pair(Config::default());
        send_message(&client, MessageKind::Binary, b"first").await;
        send_message(&client, MessageKind::Binary, b"second").await;

        let (_, mut stale) = server.next_reader().await.unwrap();
        let (_, mut current) = server.next_reader().await.unwrap();

        let mut buf = [0u8; 8];
        assert!(matches!(
            stale.read(&mut buf).await,
            Err(Error::EndOfMessage)
        ));
        assert_eq!(read_message(&mut current).await, b"second");
    }

    #[tokio::test]
    async fn test_close_twice_and_use_after_close() {
        let (client, server) = pair(Config::default());

        client.close().await.unwrap();
        assert!(matches!(client.close().await, Err(Error::AlreadyClosed)));
        assert!(matches!(
            client.next_writer(MessageKind::Binary).await,
            Err(Error::AlreadyClosed)
        ));
        assert!(matches!(
            client.set_read_deadline(None),
            Err(Error::AlreadyClosed)
        ));

        let err = server.next_reader().await.err().unwrap();
        assert!(err.is_normal_closure());
    }

    #[tokio::test]
    async fn test_ping() {
        let (server, mut raw) = server_with_raw_client(Config::default());

        server.ping("hi").await.unwrap();
        assert_eq!(
            raw.recv().await,
            FrameEvent::Control {
                opcode: Opcode::Ping,
                payload: Bytes::from_static(b"hi")
            }
        );

        let too_big = vec![0u8; MAX_CONTROL_PAYLOAD + 1];
        assert!(matches!(
            server.ping(too_big).await,
            Err(Error::Protocol(ProtocolError::ControlFrameTooLarge))
        ));
    }

    #[tokio::test]
    async fn test_addresses() {
        let (client, _) = duplex(64);
        let local: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:2000".parse().unwrap();

        let ws = WebSocket::new(client, Role::Client)
            .with_socket_info(SocketInfo::new(Some(local), Some(remote)));
        assert_eq!(ws.local_addr(), Some(local));
        assert_eq!(ws.remote_addr(), Some(remote));
    }

    #[test]
    fn test_fragment_sizes() {
        let frames = fragment(MessageKind::Text, Bytes::new(), 4);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].fin);
        assert_eq!(frames[0].opcode, Opcode::Text);

        let frames = fragment(MessageKind::Binary, Bytes::from_static(b"abcdefgh"), 4);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].opcode, Opcode::Continuation);
        assert!(frames[1].fin);
    }
}
