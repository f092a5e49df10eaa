//! WebSocket protocol state, independent of any transport
//!
//! This module holds the parts of the engines that only move bytes between
//! buffers:
//! - [`ReadState`] turns raw transport bytes into control frames and
//!   complete messages (continuation rules, unmasking, inflating, UTF-8
//!   and size checks)
//! - [`WriteState`] turns outgoing payloads into encoded frames (message
//!   opcode/continuation bookkeeping, masking, compression)
//!
//! The async engines in [`crate::stream`] own the I/O and the locking.

use bytes::{Bytes, BytesMut};

use crate::deflate::{Deflater, Inflater};
use crate::error::{CloseReason, Error, ProtocolError, Result};
use crate::frame::{
    FrameHeader, FrameParser, OpCode, encode_close_payload, encode_frame_with_rsv,
    parse_close_payload,
};
use crate::mask::{generate_mask, mask_inplace};
use crate::utf8::Utf8Validator;

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client (must mask frames)
    Client,
    /// Server (must not mask frames)
    Server,
}

/// Kind of a data message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    /// UTF-8 text
    Text,
    /// Arbitrary bytes
    #[default]
    Binary,
}

impl MessageType {
    fn opcode(self) -> OpCode {
        match self {
            MessageType::Text => OpCode::Text,
            MessageType::Binary => OpCode::Binary,
        }
    }
}

/// Kind of control frame passed to the control callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Ping,
    Pong,
    Close,
}

/// Callback invoked for every received ping, pong and close frame
pub type ControlCallback = Box<dyn FnMut(ControlKind, &[u8]) + Send>;

/// WebSocket message (complete, possibly assembled from fragments)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text message (UTF-8 validated)
    Text(Bytes),
    /// Binary message
    Binary(Bytes),
    /// Ping message
    Ping(Bytes),
    /// Pong message
    Pong(Bytes),
    /// Close message
    Close(Option<CloseReason>),
}

impl Message {
    /// Create a text message from a string
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Message::Text(Bytes::from(s.into()))
    }

    /// Create a binary message
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(data.into())
    }

    /// Check if this is a close message
    #[inline]
    pub fn is_close(&self) -> bool {
        matches!(self, Message::Close(_))
    }

    /// Check if this is a text message
    #[inline]
    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    /// Check if this is a binary message
    #[inline]
    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }

    /// Get message as text (returns None for non-text messages)
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get message as bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(b) | Message::Binary(b) | Message::Ping(b) | Message::Pong(b) => b,
            Message::Close(_) => &[],
        }
    }

    /// Convert to binary data
    pub fn into_bytes(self) -> Bytes {
        match self {
            Message::Text(b) | Message::Binary(b) | Message::Ping(b) | Message::Pong(b) => b,
            Message::Close(_) => Bytes::new(),
        }
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Text(Bytes::from(s))
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Text(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(v))
    }
}

impl From<Bytes> for Message {
    fn from(b: Bytes) -> Self {
        Message::Binary(b)
    }
}

// ============================================================================
// Read side
// ============================================================================

/// A complete control frame pulled out of the byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ControlFrame {
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseReason>),
}

/// Result of [`ReadState::advance`]
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadEvent {
    /// Buffered bytes are exhausted; read more from the transport
    NeedMore,
    /// A control frame arrived
    Control(ControlFrame),
    /// A message is complete; its payload waits in [`ReadState::take_message`]
    /// or [`ReadState::deliver`]
    Message(MessageType),
}

/// Read-direction protocol state of a session
pub(crate) struct ReadState {
    /// Raw bytes read from the transport, not yet decoded
    pub buf: BytesMut,
    parser: FrameParser,
    /// Header of the frame whose payload is being consumed
    frame: Option<FrameHeader>,
    remain: u64,
    key_offset: usize,
    /// A data message is in progress; the next data frame must continue it
    cont: bool,
    kind: MessageType,
    compressed: bool,
    msg: BytesMut,
    /// Payload bytes of the current message already handed out
    delivered: usize,
    /// The current message is complete; whatever is left in `msg` is its tail
    ready: bool,
    validated: usize,
    utf8: Utf8Validator,
    inflater: Option<Inflater>,
    pub max_message_size: usize,
    /// Drop data payloads instead of assembling them (closing)
    pub discard: bool,
}

impl ReadState {
    pub fn new(role: Role, max_message_size: usize, inflater: Option<Inflater>) -> Self {
        let mut parser = FrameParser::new(role == Role::Server);
        parser.set_compression(inflater.is_some());
        Self {
            buf: BytesMut::with_capacity(crate::RECV_BUFFER_SIZE),
            parser,
            frame: None,
            remain: 0,
            key_offset: 0,
            cont: false,
            kind: MessageType::Binary,
            compressed: false,
            msg: BytesMut::new(),
            delivered: 0,
            ready: false,
            validated: 0,
            utf8: Utf8Validator::new(),
            inflater,
            max_message_size,
            discard: false,
        }
    }

    /// Whether part of a message has been assembled
    pub fn in_message(&self) -> bool {
        self.cont
    }

    /// Kind of the current (or last) message
    pub fn kind(&self) -> MessageType {
        self.kind
    }

    /// Whether assembled payload or a finished message waits to be handed out
    pub fn has_pending(&self) -> bool {
        self.ready || !self.msg.is_empty()
    }

    /// Whether a finished message waits to be handed out
    pub fn is_complete(&self) -> bool {
        self.ready
    }

    /// Whether the last message was completely handed out
    pub fn is_message_done(&self) -> bool {
        !self.cont && !self.ready
    }

    /// Hand out the message completed by the last `ReadEvent::Message`
    pub fn take_message(&mut self) -> BytesMut {
        self.validated = 0;
        self.delivered = 0;
        self.ready = false;
        self.msg.split()
    }

    /// Move up to `limit` assembled payload bytes to `out`. Returns true
    /// when that finished a complete message.
    pub fn deliver(&mut self, out: &mut BytesMut, limit: usize) -> bool {
        let n = limit.min(self.msg.len());
        out.unsplit(self.msg.split_to(n));
        self.validated = self.validated.saturating_sub(n);
        self.delivered += n;

        if self.ready && self.msg.is_empty() {
            self.ready = false;
            self.delivered = 0;
            return true;
        }
        false
    }

    /// Decode as much of `buf` as possible.
    pub fn advance(&mut self) -> Result<ReadEvent> {
        loop {
            let header = match self.frame {
                Some(header) => header,
                None => match self.parser.decode(&mut self.buf)? {
                    None => return Ok(ReadEvent::NeedMore),
                    Some(header) => {
                        if header.opcode.is_data() {
                            self.begin_frame(&header)?;
                        }
                        self.frame = Some(header);
                        header
                    }
                },
            };

            if header.opcode.is_control() {
                let len = header.payload_len as usize;
                if self.buf.len() < len {
                    return Ok(ReadEvent::NeedMore);
                }
                let mut payload = self.buf.split_to(len);
                if let Some(key) = header.mask {
                    mask_inplace(&mut payload, key, 0);
                }
                self.frame = None;
                return Self::control(header.opcode, payload.freeze()).map(ReadEvent::Control);
            }

            while self.remain > 0 {
                if self.buf.is_empty() {
                    return Ok(ReadEvent::NeedMore);
                }
                let n = self.remain.min(self.buf.len() as u64) as usize;
                let mut chunk = self.buf.split_to(n);
                if let Some(key) = header.mask {
                    self.key_offset = mask_inplace(&mut chunk, key, self.key_offset);
                }
                self.remain -= n as u64;
                self.consume(&chunk)?;
            }

            self.frame = None;
            if header.fin {
                return self.finish_message().map(ReadEvent::Message);
            }
        }
    }

    fn begin_frame(&mut self, header: &FrameHeader) -> Result<()> {
        match header.opcode {
            OpCode::Continuation => {
                if !self.cont {
                    return Err(ProtocolError::UnexpectedContinuation.into());
                }
            }
            op => {
                if self.cont {
                    return Err(ProtocolError::ExpectedContinuation.into());
                }
                self.cont = true;
                self.kind = if op == OpCode::Text {
                    MessageType::Text
                } else {
                    MessageType::Binary
                };
                self.compressed = header.rsv1;
                self.msg.clear();
                self.delivered = 0;
                self.validated = 0;
                self.utf8.reset();
            }
        }

        // Compressed sizes are checked while inflating
        if !self.discard
            && !self.compressed
            && (self.delivered + self.msg.len()) as u64 + header.payload_len
                > self.max_message_size as u64
        {
            return Err(Error::MessageTooLarge);
        }

        self.remain = header.payload_len;
        self.key_offset = 0;
        Ok(())
    }

    fn consume(&mut self, chunk: &[u8]) -> Result<()> {
        if self.discard {
            return Ok(());
        }
        if self.compressed {
            let inflater = self
                .inflater
                .as_mut()
                .ok_or(Error::Protocol(ProtocolError::ReservedBits))?;
            let max = self.max_message_size.saturating_sub(self.delivered);
            inflater.inflate(chunk, &mut self.msg, max)?;
        } else {
            self.msg.extend_from_slice(chunk);
        }
        self.check_utf8()
    }

    fn check_utf8(&mut self) -> Result<()> {
        if self.kind == MessageType::Text {
            if !self.utf8.write(&self.msg[self.validated..]) {
                return Err(Error::InvalidUtf8);
            }
            self.validated = self.msg.len();
        }
        Ok(())
    }

    fn finish_message(&mut self) -> Result<MessageType> {
        self.cont = false;
        if self.discard {
            self.msg.clear();
            return Ok(self.kind);
        }
        if self.compressed {
            let max = self.max_message_size.saturating_sub(self.delivered);
            if let Some(inflater) = self.inflater.as_mut() {
                inflater.finish(&mut self.msg, max)?;
            }
            self.check_utf8()?;
        }
        if self.kind == MessageType::Text && !self.utf8.finish() {
            return Err(Error::InvalidUtf8);
        }
        self.ready = true;
        Ok(self.kind)
    }

    fn control(opcode: OpCode, payload: Bytes) -> Result<ControlFrame> {
        match opcode {
            OpCode::Ping => Ok(ControlFrame::Ping(payload)),
            OpCode::Pong => Ok(ControlFrame::Pong(payload)),
            _ => parse_close_payload(&payload).map(ControlFrame::Close),
        }
    }
}

// ============================================================================
// Write side
// ============================================================================

/// How the payload of one write call becomes frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FramePlan {
    /// One frame carrying the whole payload
    Single,
    /// Frames of at most the write buffer size
    Fragmented,
    /// Compressed, one frame per compressor output chunk
    Deflate,
}

/// Write-direction protocol state of a session
pub(crate) struct WriteState {
    /// Encoded frame ready for the transport
    pub frame: BytesMut,
    mask: bool,
    /// A message is in progress; its next frame is a continuation
    cont: bool,
    /// At least one frame of the current message was encoded
    started: bool,
    opcode: OpCode,
    compress: bool,
    frag: bool,
    deflater: Option<Deflater>,
    deflated: BytesMut,
    pub message_type: MessageType,
    pub compress_enabled: bool,
    pub auto_fragment: bool,
    pub buffer_size: usize,
}

impl WriteState {
    pub fn new(
        role: Role,
        buffer_size: usize,
        auto_fragment: bool,
        deflater: Option<Deflater>,
    ) -> Self {
        Self {
            frame: BytesMut::with_capacity(buffer_size + crate::MAX_FRAME_HEADER_SIZE),
            mask: role == Role::Client,
            cont: false,
            started: false,
            opcode: OpCode::Binary,
            compress: false,
            frag: false,
            deflater,
            deflated: BytesMut::new(),
            message_type: MessageType::Binary,
            compress_enabled: true,
            auto_fragment,
            buffer_size,
        }
    }

    /// Whether a message was started with a non-final write
    pub fn in_message(&self) -> bool {
        self.cont
    }

    /// Plan the frames for one write call. Starts a message if none is in
    /// progress.
    pub fn plan(&mut self, fin: bool, len: usize) -> FramePlan {
        self.plan_as(self.message_type, fin, len)
    }

    /// Like [`plan`](Self::plan), starting a message of type `kind`
    pub fn plan_as(&mut self, kind: MessageType, fin: bool, len: usize) -> FramePlan {
        if !self.cont {
            self.opcode = kind.opcode();
            self.started = false;
            self.frag = self.auto_fragment;
            self.compress = match &self.deflater {
                Some(d) => self.compress_enabled && !(fin && len < d.threshold()),
                None => false,
            };
        }
        if self.compress {
            FramePlan::Deflate
        } else if self.frag && len > self.buffer_size {
            FramePlan::Fragmented
        } else {
            FramePlan::Single
        }
    }

    /// Record the end of a write call
    pub fn finish_call(&mut self, fin: bool) {
        self.cont = !fin;
        if fin {
            self.started = false;
        }
    }

    fn mask_key(&self) -> Option<[u8; 4]> {
        if self.mask { Some(generate_mask()) } else { None }
    }

    /// Encode the next data frame of the current message into `frame`
    pub fn encode_data(&mut self, payload: &[u8], fin: bool) {
        let opcode = if self.started {
            OpCode::Continuation
        } else {
            self.opcode
        };
        let rsv1 = self.compress && !self.started;
        let mask = self.mask_key();
        self.frame.clear();
        encode_frame_with_rsv(&mut self.frame, opcode, payload, fin, rsv1, mask);
        self.started = true;
    }

    /// Run the compressor once over `input`. Returns the input consumed,
    /// whether more output is pending, and whether `frame` now holds a frame
    /// to send.
    pub fn deflate_step(&mut self, input: &[u8], fin: bool) -> Result<(usize, bool, bool)> {
        let limit = self.buffer_size;
        let Some(deflater) = self.deflater.as_mut() else {
            return Err(Error::Compression("compression not negotiated".into()));
        };
        self.deflated.clear();
        let (consumed, more) = deflater.deflate(input, limit, fin, &mut self.deflated)?;
        // The final frame goes out even when empty
        if self.deflated.is_empty() && !(fin && !more) {
            return Ok((consumed, more, false));
        }
        let payload = self.deflated.split();
        self.encode_data(&payload, fin && !more);
        Ok((consumed, more, true))
    }

    /// Encode a control frame into `frame`
    pub fn encode_control(&mut self, opcode: OpCode, payload: &[u8]) {
        let mask = self.mask_key();
        self.frame.clear();
        encode_frame_with_rsv(&mut self.frame, opcode, payload, true, false, mask);
    }

    /// Encode a close frame into `frame`
    pub fn encode_close(&mut self, reason: Option<&CloseReason>) {
        let mut payload = BytesMut::new();
        if let Some(reason) = reason {
            encode_close_payload(reason, &mut payload);
        }
        self.encode_control(OpCode::Close, &payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deflate::DeflateConfig;
    use crate::frame::encode_frame;

    const KEY: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

    fn server_state() -> ReadState {
        ReadState::new(Role::Server, 1024, None)
    }

    fn push(state: &mut ReadState, opcode: OpCode, payload: &[u8], fin: bool) {
        encode_frame(&mut state.buf, opcode, payload, fin, Some(KEY));
    }

    #[test]
    fn test_single_frame_message() {
        let mut state = server_state();
        push(&mut state, OpCode::Text, b"Hello, world!", true);
        assert_eq!(state.advance().unwrap(), ReadEvent::Message(MessageType::Text));
        assert_eq!(&state.take_message()[..], b"Hello, world!");
        assert_eq!(state.advance().unwrap(), ReadEvent::NeedMore);
    }

    #[test]
    fn test_fragmented_message() {
        let mut state = server_state();
        push(&mut state, OpCode::Text, b"*", false);
        push(&mut state, OpCode::Continuation, b"*", true);
        assert_eq!(state.advance().unwrap(), ReadEvent::Message(MessageType::Text));
        assert_eq!(&state.take_message()[..], b"**");
    }

    #[test]
    fn test_payload_split_across_reads() {
        let mut wire = BytesMut::new();
        encode_frame(&mut wire, OpCode::Binary, b"abcdefghij", true, Some(KEY));

        let mut state = server_state();
        for byte in &wire[..wire.len() - 1] {
            state.buf.extend_from_slice(&[*byte]);
            assert_eq!(state.advance().unwrap(), ReadEvent::NeedMore);
        }
        state.buf.extend_from_slice(&wire[wire.len() - 1..]);
        assert_eq!(state.advance().unwrap(), ReadEvent::Message(MessageType::Binary));
        assert_eq!(&state.take_message()[..], b"abcdefghij");
    }

    #[test]
    fn test_control_between_fragments() {
        let mut state = server_state();
        push(&mut state, OpCode::Binary, b"ab", false);
        push(&mut state, OpCode::Ping, b"p", true);
        push(&mut state, OpCode::Continuation, b"cd", true);

        assert_eq!(
            state.advance().unwrap(),
            ReadEvent::Control(ControlFrame::Ping(Bytes::from_static(b"p")))
        );
        assert!(state.in_message());
        assert_eq!(state.advance().unwrap(), ReadEvent::Message(MessageType::Binary));
        assert_eq!(&state.take_message()[..], b"abcd");
    }

    #[test]
    fn test_empty_non_final_frames_skipped() {
        let mut state = server_state();
        push(&mut state, OpCode::Text, b"", false);
        push(&mut state, OpCode::Continuation, b"", false);
        push(&mut state, OpCode::Continuation, b"x", true);
        assert_eq!(state.advance().unwrap(), ReadEvent::Message(MessageType::Text));
        assert_eq!(&state.take_message()[..], b"x");
    }

    #[test]
    fn test_continuation_rules() {
        let mut state = server_state();
        push(&mut state, OpCode::Continuation, b"x", true);
        assert!(matches!(
            state.advance(),
            Err(Error::Protocol(ProtocolError::UnexpectedContinuation))
        ));

        let mut state = server_state();
        push(&mut state, OpCode::Text, b"x", false);
        push(&mut state, OpCode::Binary, b"y", true);
        assert!(matches!(
            state.advance(),
            Err(Error::Protocol(ProtocolError::ExpectedContinuation))
        ));
    }

    #[test]
    fn test_size_limit_exactly_at_boundary() {
        let mut state = ReadState::new(Role::Server, 4, None);
        push(&mut state, OpCode::Binary, b"ab", false);
        push(&mut state, OpCode::Continuation, b"cd", true);
        assert_eq!(state.advance().unwrap(), ReadEvent::Message(MessageType::Binary));
        assert_eq!(&state.take_message()[..], b"abcd");
    }

    #[test]
    fn test_size_limit_hit_by_later_frame() {
        let mut state = ReadState::new(Role::Server, 4, None);
        push(&mut state, OpCode::Binary, b"abc", false);
        push(&mut state, OpCode::Continuation, b"de", true);
        assert!(matches!(state.advance(), Err(Error::MessageTooLarge)));
    }

    #[test]
    fn test_size_limit_checked_before_payload() {
        let mut state = ReadState::new(Role::Server, 4, None);
        // Header only; the payload never arrives
        FrameHeader {
            fin: true,
            rsv1: false,
            opcode: OpCode::Binary,
            payload_len: 5,
            mask: Some(KEY),
        }
        .encode(&mut state.buf);
        assert!(matches!(state.advance(), Err(Error::MessageTooLarge)));
    }

    #[test]
    fn test_invalid_utf8_across_fragments() {
        let mut state = server_state();
        push(&mut state, OpCode::Text, &[0xE2, 0x82], false);
        push(&mut state, OpCode::Continuation, &[0xAC], true);
        assert_eq!(state.advance().unwrap(), ReadEvent::Message(MessageType::Text));
        assert_eq!(&state.take_message()[..], "€".as_bytes());

        push(&mut state, OpCode::Text, &[0xE2, 0x82], false);
        push(&mut state, OpCode::Continuation, &[0x41], true);
        assert!(matches!(state.advance(), Err(Error::InvalidUtf8)));
    }

    #[test]
    fn test_deliver_in_pieces() {
        let mut state = server_state();
        push(&mut state, OpCode::Binary, b"abcde", false);
        assert_eq!(state.advance().unwrap(), ReadEvent::NeedMore);
        assert!(state.has_pending());

        let mut out = BytesMut::new();
        assert!(!state.deliver(&mut out, 3));
        assert!(!state.deliver(&mut out, 3));
        assert_eq!(&out[..], b"abcde");
        assert!(!state.has_pending());
        assert!(!state.is_message_done());

        push(&mut state, OpCode::Continuation, b"fg", true);
        assert_eq!(state.advance().unwrap(), ReadEvent::Message(MessageType::Binary));
        assert!(!state.is_message_done());
        assert!(state.deliver(&mut out, 10));
        assert_eq!(&out[..], b"abcdefg");
        assert!(state.is_message_done());
    }

    #[test]
    fn test_delivered_bytes_count_toward_limit() {
        let mut state = ReadState::new(Role::Server, 4, None);
        push(&mut state, OpCode::Binary, b"abc", false);
        assert_eq!(state.advance().unwrap(), ReadEvent::NeedMore);
        state.deliver(&mut BytesMut::new(), 3);

        push(&mut state, OpCode::Continuation, b"de", true);
        assert!(matches!(state.advance(), Err(Error::MessageTooLarge)));
    }

    #[test]
    fn test_empty_message_delivers_done() {
        let mut state = server_state();
        push(&mut state, OpCode::Text, b"", true);
        assert_eq!(state.advance().unwrap(), ReadEvent::Message(MessageType::Text));
        let mut out = BytesMut::new();
        assert!(state.deliver(&mut out, 1));
        assert!(out.is_empty());
    }

    #[test]
    fn test_close_frame() {
        let mut state = server_state();
        push(&mut state, OpCode::Close, &[0x03, 0xE8, b'o', b'k'], true);
        assert_eq!(
            state.advance().unwrap(),
            ReadEvent::Control(ControlFrame::Close(Some(CloseReason::new(1000, "ok"))))
        );
    }

    #[test]
    fn test_discard_mode() {
        let mut state = ReadState::new(Role::Server, 4, None);
        state.discard = true;
        push(&mut state, OpCode::Binary, b"way too large", true);
        push(&mut state, OpCode::Close, &[], true);
        assert_eq!(state.advance().unwrap(), ReadEvent::Message(MessageType::Binary));
        assert!(state.take_message().is_empty());
        assert_eq!(
            state.advance().unwrap(),
            ReadEvent::Control(ControlFrame::Close(None))
        );
    }

    #[test]
    fn test_write_plan() {
        let mut w = WriteState::new(Role::Server, 8, true, None);
        assert_eq!(w.plan(true, 8), FramePlan::Single);
        assert_eq!(w.plan(true, 9), FramePlan::Fragmented);
        w.auto_fragment = false;
        assert_eq!(w.plan(true, 9), FramePlan::Single);
    }

    #[test]
    fn test_write_continuation_opcodes() {
        let mut w = WriteState::new(Role::Server, 4096, true, None);
        w.message_type = MessageType::Text;

        w.plan(false, 3);
        w.encode_data(b"abc", false);
        w.finish_call(false);
        assert_eq!(&w.frame[..2], &[0x01, 0x03]);

        w.plan(true, 3);
        w.encode_data(b"def", true);
        w.finish_call(true);
        assert_eq!(&w.frame[..2], &[0x80, 0x03]);
        assert!(!w.in_message());
    }

    #[test]
    fn test_client_frames_masked() {
        let mut w = WriteState::new(Role::Client, 4096, true, None);
        w.encode_control(OpCode::Ping, b"hi");
        assert_eq!(w.frame[1], 0x82);
        assert_eq!(w.frame.len(), 2 + 4 + 2);
    }

    #[test]
    fn test_compressed_round_trip() {
        let agreed = DeflateConfig {
            compression_threshold: 0,
            ..Default::default()
        };
        let mut w = WriteState::new(Role::Client, 16, true, Some(agreed.deflater(Role::Client)));
        let mut r = ReadState::new(Role::Server, 1 << 20, Some(agreed.inflater(Role::Server)));

        let message: Vec<u8> = b"compress me please, compress me please, ".repeat(20);
        assert_eq!(w.plan(true, message.len()), FramePlan::Deflate);
        let mut offset = 0;
        let mut frames = 0;
        loop {
            let (n, more, ready) = w.deflate_step(&message[offset..], true).unwrap();
            offset += n;
            if ready {
                frames += 1;
                r.buf.extend_from_slice(&w.frame);
            }
            if !more {
                break;
            }
        }
        w.finish_call(true);
        assert!(frames > 1);
        // first frame carries rsv1
        assert_eq!(r.buf[0] & 0x40, 0x40);

        assert_eq!(r.advance().unwrap(), ReadEvent::Message(MessageType::Binary));
        assert_eq!(&r.take_message()[..], &message[..]);
    }
}
