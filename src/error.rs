//! Error types for the WebSocket engine

use std::fmt;
use std::io;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying transport
    Io(io::Error),
    /// Malformed frame or frame sequence. Permanently fails the session.
    Protocol(ProtocolError),
    /// Invalid UTF-8 in a text message or close reason
    InvalidUtf8,
    /// Incoming message exceeded the configured limit
    MessageTooLarge,
    /// A caller-supplied value does not fit the wire format
    Capacity(&'static str),
    /// Malformed HTTP during the opening handshake
    InvalidHttp(&'static str),
    /// The upgrade exchange was rejected
    HandshakeFailed(&'static str),
    /// Compression/decompression error
    Compression(String),
    /// A handshake, idle or close deadline expired
    Timeout,
    /// The close handshake completed. Terminal, not a failure.
    ConnectionClosed,
    /// The operation was abandoned before it could finish
    Aborted,
}

/// Frame-level protocol violations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Opcode 0x3-0x7 or 0xB-0xF
    ReservedOpcode(u8),
    /// rsv bits set without a negotiated extension, or on the wrong frame
    ReservedBits,
    /// Control frame with fin=0
    FragmentedControl,
    /// Control frame payload over 125 bytes
    ControlTooLarge,
    /// Extended length that a shorter form could have carried
    NonMinimalLength,
    /// 64-bit length with the most significant bit set
    LengthOverflow,
    /// Client frame without a mask
    UnmaskedFrame,
    /// Server frame with a mask
    MaskedFrame,
    /// Continuation frame with no message in progress
    UnexpectedContinuation,
    /// New data frame while a message is still in progress
    ExpectedContinuation,
    /// Close payload of one byte
    BadClosePayload,
    /// Close code outside the ranges a peer may send
    BadCloseCode(u16),
}

impl ProtocolError {
    /// Close status sent to the peer for this violation
    pub fn close_code(self) -> u16 {
        match self {
            ProtocolError::LengthOverflow => CloseReason::TOO_BIG,
            _ => CloseReason::PROTOCOL_ERROR,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::ReservedOpcode(op) => write!(f, "reserved opcode {:#x}", op),
            ProtocolError::ReservedBits => write!(f, "reserved bits set"),
            ProtocolError::FragmentedControl => write!(f, "fragmented control frame"),
            ProtocolError::ControlTooLarge => write!(f, "control frame payload too large"),
            ProtocolError::NonMinimalLength => write!(f, "non-minimal payload length"),
            ProtocolError::LengthOverflow => write!(f, "payload length overflow"),
            ProtocolError::UnmaskedFrame => write!(f, "unmasked client frame"),
            ProtocolError::MaskedFrame => write!(f, "masked server frame"),
            ProtocolError::UnexpectedContinuation => write!(f, "unexpected continuation frame"),
            ProtocolError::ExpectedContinuation => write!(f, "expected continuation frame"),
            ProtocolError::BadClosePayload => write!(f, "bad close payload"),
            ProtocolError::BadCloseCode(code) => write!(f, "invalid close code {}", code),
        }
    }
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Largest reason that fits a control frame next to the code
    pub const MAX_REASON_LEN: usize = 123;

    /// Create a new close reason. Reasons longer than 123 bytes are cut at a
    /// char boundary.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > Self::MAX_REASON_LEN {
            let mut end = Self::MAX_REASON_LEN;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }
        Self { code, reason }
    }

    /// Check if a received close code is valid per RFC 6455
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl Default for CloseReason {
    fn default() -> Self {
        Self::new(Self::NORMAL, "")
    }
}

impl Error {
    /// Close status the engine sends when this error fails a session.
    /// `None` means the transport is unusable and no close frame is attempted.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Error::Protocol(e) => Some(e.close_code()),
            Error::InvalidUtf8 | Error::Compression(_) => Some(CloseReason::INVALID_PAYLOAD),
            Error::MessageTooLarge => Some(CloseReason::TOO_BIG),
            _ => None,
        }
    }

    /// Copy of this error handed to every later operation on a failed session.
    pub(crate) fn replicate(&self) -> Error {
        match self {
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
            Error::Protocol(e) => Error::Protocol(*e),
            Error::InvalidUtf8 => Error::InvalidUtf8,
            Error::MessageTooLarge => Error::MessageTooLarge,
            Error::Capacity(msg) => Error::Capacity(msg),
            Error::InvalidHttp(msg) => Error::InvalidHttp(msg),
            Error::HandshakeFailed(msg) => Error::HandshakeFailed(msg),
            Error::Compression(msg) => Error::Compression(msg.clone()),
            Error::Timeout => Error::Timeout,
            Error::ConnectionClosed => Error::ConnectionClosed,
            Error::Aborted => Error::Aborted,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::InvalidUtf8 => write!(f, "Invalid UTF-8 in text message"),
            Error::MessageTooLarge => write!(f, "Message too large"),
            Error::Capacity(msg) => write!(f, "Capacity exceeded: {}", msg),
            Error::InvalidHttp(msg) => write!(f, "Invalid HTTP: {}", msg),
            Error::HandshakeFailed(msg) => write!(f, "Handshake failed: {}", msg),
            Error::Compression(msg) => write!(f, "Compression error: {}", msg),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::Aborted => write!(f, "Operation aborted"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Io(e),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, "timed out"),
            Error::ConnectionClosed => {
                io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
            }
            other => io::Error::other(other.to_string()),
        }
    }
}
