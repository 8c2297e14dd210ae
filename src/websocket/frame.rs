//! WebSocket frame headers, masking and close payloads per RFC 6455.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// WebSocket opcodes as defined in RFC 6455 Section 5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation frame (0x0)
    Continuation = 0x0,
    /// Text data frame (0x1)
    Text = 0x1,
    /// Binary data frame (0x2)
    Binary = 0x2,
    /// Connection close frame (0x8)
    Close = 0x8,
    /// Ping frame (0x9)
    Ping = 0x9,
    /// Pong frame (0xA)
    Pong = 0xA,
}

impl Opcode {
    fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            _ => Err(ProtocolError::InvalidOpcode(value)),
        }
    }

    /// Check if this is a control frame opcode.
    pub fn is_control(&self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Header of a single frame, without its payload.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
/// |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
/// |N|V|V|V|       |S|             |   (if payload len==126/127)   |
/// | |1|2|3|       |K|             |                               |
/// +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
/// |     Extended payload length continued, if payload len == 127  |
/// + - - - - - - - - - - - - - - - +-------------------------------+
/// |                               |Masking-key, if MASK set to 1  |
/// +-------------------------------+-------------------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment of a message.
    pub fin: bool,
    /// Frame type.
    pub opcode: Opcode,
    /// Masking key, present on client-to-server frames.
    pub mask: Option<[u8; 4]>,
    /// Payload length in bytes.
    pub payload_len: u64,
}

impl FrameHeader {
    /// Parse a header from the front of `data`.
    ///
    /// Returns the header and the number of bytes it occupies, or `Ok(None)`
    /// if `data` does not yet hold a complete header.
    pub fn parse(data: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        if data.len() < 2 {
            return Ok(None);
        }

        let byte1 = data[0];
        let fin = (byte1 & 0b1000_0000) != 0;
        if byte1 & 0b0111_0000 != 0 {
            return Err(ProtocolError::ReservedBitsSet);
        }
        let opcode = Opcode::from_u8(byte1 & 0b0000_1111)?;

        let byte2 = data[1];
        let masked = (byte2 & 0b1000_0000) != 0;
        let mut payload_len = (byte2 & 0b0111_1111) as u64;
        let mut offset = 2;

        if payload_len == 126 {
            let Some(ext) = data.get(offset..offset + 2) else {
                return Ok(None);
            };
            payload_len = u16::from_be_bytes([ext[0], ext[1]]) as u64;
            offset += 2;
        } else if payload_len == 127 {
            let Some(ext) = data.get(offset..offset + 8) else {
                return Ok(None);
            };
            let mut raw = [0u8; 8];
            raw.copy_from_slice(ext);
            payload_len = u64::from_be_bytes(raw);
            offset += 8;
            if payload_len >> 63 != 0 {
                return Err(ProtocolError::FrameTooLarge);
            }
        }

        if opcode.is_control() {
            if payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(ProtocolError::ControlFrameTooLarge);
            }
            if !fin {
                return Err(ProtocolError::ControlFrameFragmented);
            }
        }

        let mask = if masked {
            let Some(key) = data.get(offset..offset + 4) else {
                return Ok(None);
            };
            offset += 4;
            Some([key[0], key[1], key[2], key[3]])
        } else {
            None
        };

        Ok(Some((
            FrameHeader {
                fin,
                opcode,
                mask,
                payload_len,
            },
            offset,
        )))
    }

    /// Append the encoded header to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        let mut byte1 = self.opcode as u8;
        if self.fin {
            byte1 |= 0b1000_0000;
        }
        dst.put_u8(byte1);

        let mask_bit = if self.mask.is_some() { 0b1000_0000 } else { 0 };
        if self.payload_len < 126 {
            dst.put_u8(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= u16::MAX as u64 {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(self.payload_len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(self.payload_len);
        }

        if let Some(key) = self.mask {
            dst.put_slice(&key);
        }
    }
}

/// XOR `payload` with `mask` per RFC 6455 Section 5.3.
///
/// `offset` is the position of `payload[0]` within the whole frame payload,
/// so a payload can be unmasked in consecutive slices.
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[(offset + i) % 4];
    }
}

/// Status code and reason carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// Close status code.
    pub code: u16,
    /// Human readable reason, possibly empty.
    pub reason: String,
}

impl CloseFrame {
    /// 1000, normal closure.
    pub const NORMAL: u16 = 1000;
    /// 1001, endpoint going away.
    pub const GOING_AWAY: u16 = 1001;
    /// 1002, protocol error.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// 1005, close frame carried no status code. Never sent on the wire.
    pub const NO_STATUS: u16 = 1005;
    /// 1009, message too big.
    pub const MESSAGE_TOO_BIG: u16 = 1009;

    /// Create a close frame with a status code and reason.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Parse a close frame payload. An empty payload yields
    /// [`CloseFrame::NO_STATUS`].
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        match payload {
            [] => Ok(Self::new(Self::NO_STATUS, "")),
            [_] => Err(ProtocolError::InvalidClosePayload),
            [hi, lo, reason @ ..] => {
                let code = u16::from_be_bytes([*hi, *lo]);
                if !is_valid_close_code(code) {
                    return Err(ProtocolError::InvalidCloseCode(code));
                }
                let reason = std::str::from_utf8(reason).map_err(|_| ProtocolError::InvalidUtf8)?;
                Ok(Self::new(code, reason))
            }
        }
    }

    /// Encode as a close frame payload.
    pub fn encode(&self) -> Bytes {
        if self.code == Self::NO_STATUS {
            return Bytes::new();
        }
        let mut end = self.reason.len().min(MAX_CONTROL_PAYLOAD - 2);
        while !self.reason.is_char_boundary(end) {
            end -= 1;
        }
        let mut payload = BytesMut::with_capacity(2 + end);
        payload.put_u16(self.code);
        payload.put_slice(&self.reason.as_bytes()[..end]);
        payload.freeze()
    }

    /// Normal closure, going away, or no status.
    pub fn is_normal(&self) -> bool {
        matches!(self.code, Self::NORMAL | Self::GOING_AWAY | Self::NO_STATUS)
    }
}

impl fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

// RFC 6455 Section 7.4: 1004-1006 and 1015 are reserved and must not be sent.
fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_header() {
        let data = [0b1000_0001, 5, b'H', b'e', b'l', b'l', b'o'];

        let (header, consumed) = FrameHeader::parse(&data).unwrap().unwrap();
        assert_eq!(consumed, 2);
        assert!(header.fin);
        assert_eq!(header.opcode, Opcode::Text);
        assert_eq!(header.mask, None);
        assert_eq!(header.payload_len, 5);
    }

    #[test]
    fn test_parse_masked_header() {
        let data = [0b0000_0010, 0b1000_0011, 0x12, 0x34, 0x56, 0x78];

        let (header, consumed) = FrameHeader::parse(&data).unwrap().unwrap();
        assert_eq!(consumed, 6);
        assert!(!header.fin);
        assert_eq!(header.opcode, Opcode::Binary);
        assert_eq!(header.mask, Some([0x12, 0x34, 0x56, 0x78]));
        assert_eq!(header.payload_len, 3);
    }

    #[test]
    fn test_incomplete_header() {
        assert_eq!(FrameHeader::parse(&[0b1000_0001]).unwrap(), None);
        // 16-bit extended length missing its second byte
        assert_eq!(FrameHeader::parse(&[0b1000_0010, 126, 0x00]).unwrap(), None);
        // Masking key cut short
        assert_eq!(
            FrameHeader::parse(&[0b1000_0010, 0b1000_0001, 1, 2]).unwrap(),
            None
        );
    }

    #[test]
    fn test_extended_lengths() {
        let (header, consumed) = FrameHeader::parse(&[0b1000_0010, 126, 0x00, 0xC8])
            .unwrap()
            .unwrap();
        assert_eq!(consumed, 4);
        assert_eq!(header.payload_len, 200);

        let mut data = vec![0b1000_0010, 127];
        data.extend_from_slice(&70_000u64.to_be_bytes());
        let (header, consumed) = FrameHeader::parse(&data).unwrap().unwrap();
        assert_eq!(consumed, 10);
        assert_eq!(header.payload_len, 70_000);
    }

    #[test]
    fn test_encode_matches_parse() {
        for len in [0u64, 125, 126, 65_535, 65_536] {
            let header = FrameHeader {
                fin: true,
                opcode: Opcode::Binary,
                mask: Some([1, 2, 3, 4]),
                payload_len: len,
            };
            let mut dst = BytesMut::new();
            header.encode(&mut dst);

            let (parsed, consumed) = FrameHeader::parse(&dst).unwrap().unwrap();
            assert_eq!(parsed, header);
            assert_eq!(consumed, dst.len());
        }
    }

    #[test]
    fn test_control_frame_too_large() {
        let data = [0b1000_1000, 126, 0x00, 0x7F];
        assert_eq!(
            FrameHeader::parse(&data),
            Err(ProtocolError::ControlFrameTooLarge)
        );
    }

    #[test]
    fn test_control_frame_fragmented() {
        let data = [0b0000_1001, 0];
        assert_eq!(
            FrameHeader::parse(&data),
            Err(ProtocolError::ControlFrameFragmented)
        );
    }

    #[test]
    fn test_reserved_bits_and_opcode() {
        assert_eq!(
            FrameHeader::parse(&[0b1100_0001, 0]),
            Err(ProtocolError::ReservedBitsSet)
        );
        assert_eq!(
            FrameHeader::parse(&[0b1000_0011, 0]),
            Err(ProtocolError::InvalidOpcode(0x3))
        );
    }

    #[test]
    fn test_mask_in_slices() {
        let mask = [0x12, 0x34, 0x56, 0x78];
        let mut whole = b"Hello, WebSocket".to_vec();
        apply_mask(&mut whole, mask, 0);

        let mut sliced = b"Hello, WebSocket".to_vec();
        let (head, tail) = sliced.split_at_mut(5);
        apply_mask(head, mask, 0);
        apply_mask(tail, mask, 5);
        assert_eq!(sliced, whole);

        apply_mask(&mut whole, mask, 0);
        assert_eq!(whole, b"Hello, WebSocket");
    }

    #[test]
    fn test_close_payload() {
        let frame = CloseFrame::new(CloseFrame::NORMAL, "Normal closure");
        let parsed = CloseFrame::parse(&frame.encode()).unwrap();
        assert_eq!(parsed, frame);

        let empty = CloseFrame::parse(&[]).unwrap();
        assert_eq!(empty.code, CloseFrame::NO_STATUS);
        assert!(empty.encode().is_empty());
        assert!(empty.is_normal());
    }

    #[test]
    fn test_invalid_close_payloads() {
        assert_eq!(
            CloseFrame::parse(&[0x03]),
            Err(ProtocolError::InvalidClosePayload)
        );
        assert_eq!(
            CloseFrame::parse(&1005u16.to_be_bytes()),
            Err(ProtocolError::InvalidCloseCode(1005))
        );
        assert_eq!(
            CloseFrame::parse(&[0x03, 0xE8, 0xFF]),
            Err(ProtocolError::InvalidUtf8)
        );
    }
}
