//! Streaming frame codec for use with `tokio_util::codec`.
//!
//! Data frame payloads are yielded in slices as they arrive, so a message
//! never has to be buffered whole before the reader sees its first byte.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::config::Role;
use super::frame::{FrameHeader, Opcode, apply_mask};
use crate::error::{Error, ProtocolError};

/// Inbound unit produced by [`FrameCodec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// Header of a data frame. Its payload follows as [`FrameEvent::Payload`]
    /// slices totalling `len` bytes.
    FrameStart {
        /// Text, Binary or Continuation.
        opcode: Opcode,
        /// Final fragment of the message.
        fin: bool,
        /// Payload length of this frame.
        len: u64,
    },
    /// Unmasked slice of the current data frame's payload.
    Payload(Bytes),
    /// A complete control frame.
    Control {
        /// Close, Ping or Pong.
        opcode: Opcode,
        /// Unmasked payload, at most 125 bytes.
        payload: Bytes,
    },
}

/// Outbound frame accepted by [`FrameCodec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutFrame {
    /// Frame type.
    pub opcode: Opcode,
    /// Final fragment of the message.
    pub fin: bool,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl OutFrame {
    /// A single-frame control message.
    pub fn control(opcode: Opcode, payload: Bytes) -> Self {
        debug_assert!(opcode.is_control());
        Self {
            opcode,
            fin: true,
            payload,
        }
    }
}

#[derive(Debug)]
enum DecodeState {
    Header,
    Payload {
        remaining: u64,
        mask: Option<[u8; 4]>,
        offset: usize,
    },
}

/// Frame codec for one end of a connection.
///
/// Decoding enforces the masking rule for the peer's role; encoding masks
/// with a fresh random key when acting as a client.
#[derive(Debug)]
pub struct FrameCodec {
    role: Role,
    state: DecodeState,
}

impl FrameCodec {
    /// Create a codec for the given end of the connection.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: DecodeState::Header,
        }
    }

    fn check_mask(&self, header: &FrameHeader) -> Result<(), ProtocolError> {
        match (self.role, header.mask) {
            (Role::Server, None) => Err(ProtocolError::UnmaskedFrame),
            (Role::Client, Some(_)) => Err(ProtocolError::MaskedFrame),
            _ => Ok(()),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = FrameEvent;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let DecodeState::Payload {
            remaining,
            mask,
            offset,
        } = &mut self.state
        {
            if src.is_empty() {
                return Ok(None);
            }
            let n = (src.len() as u64).min(*remaining) as usize;
            let mut chunk = src.split_to(n);
            if let Some(mask) = mask {
                apply_mask(&mut chunk, *mask, *offset);
            }
            *remaining -= n as u64;
            *offset += n;
            if *remaining == 0 {
                self.state = DecodeState::Header;
            }
            return Ok(Some(FrameEvent::Payload(chunk.freeze())));
        }

        let Some((header, header_len)) = FrameHeader::parse(src)? else {
            return Ok(None);
        };
        self.check_mask(&header)?;

        if header.opcode.is_control() {
            // Control payloads are tiny; hand them out whole.
            let total = header_len + header.payload_len as usize;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }
            src.advance(header_len);
            let mut payload = src.split_to(header.payload_len as usize);
            if let Some(mask) = header.mask {
                apply_mask(&mut payload, mask, 0);
            }
            return Ok(Some(FrameEvent::Control {
                opcode: header.opcode,
                payload: payload.freeze(),
            }));
        }

        src.advance(header_len);
        if header.payload_len > 0 {
            self.state = DecodeState::Payload {
                remaining: header.payload_len,
                mask: header.mask,
                offset: 0,
            };
        }
        Ok(Some(FrameEvent::FrameStart {
            opcode: header.opcode,
            fin: header.fin,
            len: header.payload_len,
        }))
    }
}

impl Encoder<OutFrame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: OutFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mask = match self.role {
            Role::Client => Some(rand::random::<[u8; 4]>()),
            Role::Server => None,
        };
        let header = FrameHeader {
            fin: frame.fin,
            opcode: frame.opcode,
            mask,
            payload_len: frame.payload.len() as u64,
        };
        dst.reserve(14 + frame.payload.len());
        header.encode(dst);

        let start = dst.len();
        dst.extend_from_slice(&frame.payload);
        if let Some(mask) = mask {
            apply_mask(&mut dst[start..], mask, 0);
        }
        Ok(())
    }
}
