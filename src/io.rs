//! tokio `AsyncRead` / `AsyncWrite` for [`WsConn`].

use std::{
    fmt,
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::adapter::WsConn;
use crate::conn::MessageConn;
use crate::error::{Error, Result};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Byte-stream I/O handle over a shared [`WsConn`].
///
/// Reading past a clean close handshake (normal closure, going away or no
/// status) reports end of stream; every other failure becomes an
/// `io::Error`. `poll_flush` has nothing to do. `poll_shutdown` closes the
/// connection and treats an already closed connection as success.
///
/// Each `poll_write` sends one message. A write that returned `Pending`
/// keeps sending the buffer it was first given; a retry with a shorter
/// buffer is told at most that buffer's length.
pub struct WsIo<C: MessageConn> {
    conn: Arc<WsConn<C>>,
    // Bytes read past the end of the caller's last buffer
    leftover: Bytes,
    read: Option<BoxFuture<Result<Bytes>>>,
    write: Option<BoxFuture<Result<usize>>>,
    shutdown: Option<BoxFuture<Result<()>>>,
}

impl<C: MessageConn> WsIo<C> {
    /// Create an I/O handle. The connection may be shared with other
    /// handles; reads and writes stay serialized by the connection's locks.
    pub fn new(conn: Arc<WsConn<C>>) -> Self {
        Self {
            conn,
            leftover: Bytes::new(),
            read: None,
            write: None,
            shutdown: None,
        }
    }

    /// The shared connection.
    pub fn conn(&self) -> &Arc<WsConn<C>> {
        &self.conn
    }
}

impl<C: MessageConn> fmt::Debug for WsIo<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsIo")
            .field("leftover", &self.leftover.len())
            .field("reading", &self.read.is_some())
            .field("writing", &self.write.is_some())
            .finish()
    }
}

impl<C: MessageConn> AsyncRead for WsIo<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if !this.leftover.is_empty() {
            let n = buf.remaining().min(this.leftover.len());
            buf.put_slice(&this.leftover.split_to(n));
            return Poll::Ready(Ok(()));
        }

        let capacity = buf.remaining();
        let fut = this.read.get_or_insert_with(|| {
            let conn = Arc::clone(&this.conn);
            Box::pin(async move {
                let mut chunk = BytesMut::zeroed(capacity);
                let n = conn.read(&mut chunk).await?;
                chunk.truncate(n);
                Ok(chunk.freeze())
            })
        });
        let result = ready!(fut.as_mut().poll(cx));
        this.read = None;

        match result {
            Ok(mut chunk) => {
                let n = buf.remaining().min(chunk.len());
                buf.put_slice(&chunk.split_to(n));
                this.leftover = chunk;
                Poll::Ready(Ok(()))
            }
            Err(err) if err.is_normal_closure() => Poll::Ready(Ok(())),
            Err(err) => Poll::Ready(Err(err.into())),
        }
    }
}

impl<C: MessageConn> AsyncWrite for WsIo<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let fut = this.write.get_or_insert_with(|| {
            let conn = Arc::clone(&this.conn);
            let data = Bytes::copy_from_slice(buf);
            Box::pin(async move { conn.write(&data).await })
        });
        let result = ready!(fut.as_mut().poll(cx));
        this.write = None;
        match result {
            Ok(n) => Poll::Ready(Ok(n.min(buf.len()))),
            Err(err) => Poll::Ready(Err(err.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let fut = this.shutdown.get_or_insert_with(|| {
            let conn = Arc::clone(&this.conn);
            Box::pin(async move { conn.close().await })
        });
        let result = ready!(fut.as_mut().poll(cx));
        this.shutdown = None;

        match result {
            Ok(()) | Err(Error::AlreadyClosed) => Poll::Ready(Ok(())),
            Err(err) => Poll::Ready(Err(err.into())),
        }
    }
}
