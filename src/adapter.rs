//! Byte-stream view of a message-oriented WebSocket connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::conn::{MessageConn, MessageKind, MessageReader, MessageWriter};
use crate::error::{Error, Result};
use crate::io::WsIo;

/// Exposes a [`MessageConn`] as a continuous byte stream.
///
/// Inbound message boundaries are hidden: consecutive reads return the
/// concatenated payloads of every message in arrival order. Each
/// [`write`](WsConn::write) becomes exactly one binary message.
///
/// Reads are serialized against each other, as are writes, but a read and a
/// write may run at the same time.
pub struct WsConn<C: MessageConn> {
    conn: C,
    // Read lock; holds the reader of a partially drained message.
    reader: Mutex<Option<C::Reader>>,
    write_lock: Mutex<()>,
}

impl<C: MessageConn> WsConn<C> {
    /// Wrap an established connection. Performs no I/O.
    pub fn new(conn: C) -> Self {
        Self {
            conn,
            reader: Mutex::new(None),
            write_lock: Mutex::new(()),
        }
    }

    /// Read bytes from the stream into `buf`.
    ///
    /// Waits until at least one byte is available from the current or the
    /// next inbound message. Returns `Ok(0)` only when `buf` is empty; the
    /// end of the connection is reported as an error.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut current = self.reader.lock().await;
        loop {
            let reader = match &mut *current {
                Some(reader) => reader,
                slot => {
                    let (kind, reader) = self.conn.next_reader().await?;
                    trace!(?kind, "reading next inbound message");
                    slot.insert(reader)
                }
            };

            match reader.read(buf).await {
                Ok(n) => return Ok(n),
                Err(Error::EndOfMessage) => {
                    // Not an end of stream; move on to the next message.
                    *current = None;
                }
                Err(err) => {
                    *current = None;
                    return Err(err);
                }
            }
        }
    }

    /// Send `buf` as a single binary message.
    ///
    /// If both the payload write and the message finalization fail, the
    /// write error is returned.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let _guard = self.write_lock.lock().await;

        let mut writer = self.conn.next_writer(MessageKind::Binary).await?;
        let written = writer.write(buf).await;
        let finished = writer.close().await;

        let n = written?;
        finished?;
        Ok(n)
    }

    /// Close the underlying connection.
    pub async fn close(&self) -> Result<()> {
        self.conn.close().await
    }

    /// Local address of the underlying connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.conn.local_addr()
    }

    /// Remote address of the underlying connection.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.conn.remote_addr()
    }

    /// Set both deadlines, read first.
    ///
    /// If the read deadline cannot be set the write deadline is left alone.
    pub fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.set_read_deadline(deadline)?;
        self.set_write_deadline(deadline)
    }

    /// Bound reads started after this call by `deadline`.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.conn.set_read_deadline(deadline)
    }

    /// Bound writes started after this call by `deadline`.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.conn.set_write_deadline(deadline)
    }

    /// The wrapped connection.
    pub fn get_ref(&self) -> &C {
        &self.conn
    }

    /// Unwrap the connection, dropping any partially read message.
    pub fn into_inner(self) -> C {
        self.conn
    }

    /// Convert into a [`WsIo`] implementing tokio's `AsyncRead` and
    /// `AsyncWrite`.
    pub fn into_io(self) -> WsIo<C> {
        WsIo::new(Arc::new(self))
    }
}
