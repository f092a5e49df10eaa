//! WebSocket frame header codec
//!
//! This module implements the RFC 6455 frame header:
//! - Minimal-width length encoding on the way out
//! - Incremental decoding that tolerates headers split across reads
//! - Rejection of every header-level protocol violation before any payload
//!   byte is looked at
//!
//! Payload is never buffered here. The read engine streams it after the
//! header has been returned.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{CloseReason, Error, ProtocolError, Result};
use crate::mask::mask_inplace;
use crate::utf8::validate_utf8;
use crate::{MAX_CONTROL_PAYLOAD, MAX_FRAME_HEADER_SIZE, MEDIUM_MESSAGE_THRESHOLD};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of the first header byte
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A WebSocket frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1, set on the first frame of a compressed message
    pub rsv1: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Payload length
    pub payload_len: u64,
    /// Masking key; present iff the mask bit is set
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Header for a frame carrying `payload_len` bytes
    pub fn new(opcode: OpCode, fin: bool, payload_len: u64) -> Self {
        Self {
            fin,
            rsv1: false,
            opcode,
            payload_len,
            mask: None,
        }
    }

    /// Whether the mask bit is set
    #[inline]
    pub fn masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Get the total header size in bytes
    #[inline]
    pub fn header_size(&self) -> usize {
        let ext = if self.payload_len > MEDIUM_MESSAGE_THRESHOLD as u64 {
            8
        } else if self.payload_len > MAX_CONTROL_PAYLOAD as u64 {
            2
        } else {
            0
        };
        2 + ext + if self.masked() { 4 } else { 0 }
    }

    /// Encode the header into a buffer using the narrowest length field
    #[inline]
    pub fn encode(&self, buf: &mut impl BufMut) {
        let mut b0 = self.opcode as u8;
        if self.fin {
            b0 |= 0x80;
        }
        if self.rsv1 {
            b0 |= 0x40;
        }
        buf.put_u8(b0);

        let mask_bit = if self.masked() { 0x80 } else { 0x00 };

        if self.payload_len <= MAX_CONTROL_PAYLOAD as u64 {
            buf.put_u8(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(self.payload_len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(self.payload_len);
        }

        if let Some(mask) = self.mask {
            buf.put_slice(&mask);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Waiting for the two base bytes
    Base,
    /// Base bytes validated; waiting for extended length and mask key
    Extended,
}

/// Incremental frame header decoder
///
/// Bytes are consumed from the input buffer as they arrive and kept in a
/// 14-byte scratch area, so a header split across any number of reads
/// decodes the same as one delivered whole.
#[derive(Debug, Clone)]
pub struct FrameParser {
    state: ParseState,
    header_buf: [u8; MAX_FRAME_HEADER_SIZE],
    header_len: usize,
    need: usize,
    /// Whether to expect masked frames (server mode)
    expect_masked: bool,
    /// Whether RSV1 is allowed (permessage-deflate negotiated)
    allow_rsv1: bool,
}

impl FrameParser {
    /// Create a new header decoder
    pub fn new(expect_masked: bool) -> Self {
        Self {
            state: ParseState::Base,
            header_buf: [0; MAX_FRAME_HEADER_SIZE],
            header_len: 0,
            need: 2,
            expect_masked,
            allow_rsv1: false,
        }
    }

    /// Enable or disable RSV1 (compression) support
    pub fn set_compression(&mut self, enabled: bool) {
        self.allow_rsv1 = enabled;
    }

    /// Whether part of a header has been consumed
    pub fn is_partial(&self) -> bool {
        self.header_len > 0
    }

    #[inline]
    fn reset(&mut self) {
        self.state = ParseState::Base;
        self.header_len = 0;
        self.need = 2;
    }

    /// Decode one header from the front of `buf`.
    ///
    /// Returns:
    /// - Ok(Some(header)) once the header is complete; its bytes are consumed
    /// - Ok(None) if more data is needed; available bytes are consumed
    /// - Err(e) on a protocol violation
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<FrameHeader>> {
        loop {
            let take = (self.need - self.header_len).min(buf.len());
            self.header_buf[self.header_len..self.header_len + take].copy_from_slice(&buf[..take]);
            self.header_len += take;
            buf.advance(take);

            if self.header_len < self.need {
                return Ok(None);
            }

            match self.state {
                ParseState::Base => {
                    let extra = match self.check_base() {
                        Ok(extra) => extra,
                        Err(e) => {
                            self.reset();
                            return Err(e);
                        }
                    };
                    self.state = ParseState::Extended;
                    self.need = 2 + extra;
                }
                ParseState::Extended => {
                    let header = self.finish();
                    self.reset();
                    return header.map(Some);
                }
            }
        }
    }

    /// Validate the two base bytes and return how many more header bytes follow
    fn check_base(&self) -> Result<usize> {
        let b0 = self.header_buf[0];
        let b1 = self.header_buf[1];

        let fin = b0 & 0x80 != 0;
        let rsv1 = b0 & 0x40 != 0;
        let raw_opcode = b0 & 0x0F;

        let opcode = OpCode::from_u8(raw_opcode)
            .ok_or(Error::Protocol(ProtocolError::ReservedOpcode(raw_opcode)))?;

        if b0 & 0x30 != 0 {
            return Err(ProtocolError::ReservedBits.into());
        }
        // Only the first frame of a data message may carry RSV1
        if rsv1 && !(self.allow_rsv1 && matches!(opcode, OpCode::Text | OpCode::Binary)) {
            return Err(ProtocolError::ReservedBits.into());
        }

        let masked = b1 & 0x80 != 0;
        let len_byte = b1 & 0x7F;

        if opcode.is_control() {
            if !fin {
                return Err(ProtocolError::FragmentedControl.into());
            }
            if len_byte as usize > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::ControlTooLarge.into());
            }
        }

        if self.expect_masked && !masked {
            return Err(ProtocolError::UnmaskedFrame.into());
        }
        if !self.expect_masked && masked {
            return Err(ProtocolError::MaskedFrame.into());
        }

        let ext = match len_byte {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        Ok(ext + if masked { 4 } else { 0 })
    }

    fn finish(&self) -> Result<FrameHeader> {
        let b0 = self.header_buf[0];
        let b1 = self.header_buf[1];
        let h = &self.header_buf;

        let (payload_len, pos) = match b1 & 0x7F {
            126 => {
                let len = u16::from_be_bytes([h[2], h[3]]) as u64;
                if len <= MAX_CONTROL_PAYLOAD as u64 {
                    return Err(ProtocolError::NonMinimalLength.into());
                }
                (len, 4)
            }
            127 => {
                let len = u64::from_be_bytes([h[2], h[3], h[4], h[5], h[6], h[7], h[8], h[9]]);
                if len >> 63 != 0 {
                    return Err(ProtocolError::LengthOverflow.into());
                }
                if len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
                    return Err(ProtocolError::NonMinimalLength.into());
                }
                (len, 10)
            }
            n => (n as u64, 2),
        };

        let mask = if b1 & 0x80 != 0 {
            Some([h[pos], h[pos + 1], h[pos + 2], h[pos + 3]])
        } else {
            None
        };

        Ok(FrameHeader {
            fin: b0 & 0x80 != 0,
            rsv1: b0 & 0x40 != 0,
            opcode: OpCode::from_u8(b0 & 0x0F).ok_or(ProtocolError::ReservedOpcode(b0 & 0x0F))?,
            payload_len,
            mask,
        })
    }
}

/// Encode a complete frame (header plus payload, masked when `mask` is set)
/// into `buf`.
#[inline]
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    encode_frame_with_rsv(buf, opcode, payload, fin, false, mask);
}

/// Encode a complete frame with explicit RSV1 (compressed messages)
#[inline]
pub fn encode_frame_with_rsv(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    rsv1: bool,
    mask: Option<[u8; 4]>,
) {
    let header = FrameHeader {
        fin,
        rsv1,
        opcode,
        payload_len: payload.len() as u64,
        mask,
    };
    buf.reserve(header.header_size() + payload.len());
    header.encode(buf);

    let start = buf.len();
    buf.put_slice(payload);
    if let Some(key) = mask {
        mask_inplace(&mut buf[start..], key, 0);
    }
}

/// Parse a close frame payload.
///
/// An empty payload carries no reason. Otherwise the first two bytes are a
/// big-endian code that a peer may legally send, followed by UTF-8.
pub fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseReason>> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(ProtocolError::BadClosePayload.into()),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !CloseReason::is_valid_code(code) {
                return Err(ProtocolError::BadCloseCode(code).into());
            }
            let reason = &payload[2..];
            if !validate_utf8(reason) {
                return Err(Error::InvalidUtf8);
            }
            Ok(Some(CloseReason {
                code,
                reason: String::from_utf8_lossy(reason).into_owned(),
            }))
        }
    }
}

/// Encode a close payload: code then reason
pub fn encode_close_payload(reason: &CloseReason, buf: &mut BytesMut) {
    buf.reserve(2 + reason.reason.len());
    buf.put_u16(reason.code);
    buf.put_slice(reason.reason.as_bytes());
}
