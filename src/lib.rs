//! # tidews: an async RFC 6455 WebSocket engine for Tokio
//!
//! `tidews` turns any `AsyncRead + AsyncWrite` byte stream into a WebSocket
//! session: framed, masked and optionally compressed messages, with ping,
//! pong and close frames multiplexed alongside the data.
//!
//! ## Features
//!
//! - **Incremental codec**: frame headers and payloads are decoded across
//!   arbitrary read boundaries
//! - **Full-duplex sessions**: one read and one write may run at the same
//!   time; control replies cut in between the fragments of a large write
//! - **permessage-deflate** (RFC 7692) with context takeover negotiation
//! - **Graceful close** with echo, draining and per-role teardown under a
//!   timeout
//! - **Split halves** for reading and writing from different tasks
//!
//! ## Example
//!
//! ```ignore
//! use tidews::{Config, WebSocketServer};
//! use tokio::net::TcpListener;
//!
//! let listener = TcpListener::bind("127.0.0.1:9001").await?;
//! let server = WebSocketServer::new(Config::default());
//! let (tcp, _) = listener.accept().await?;
//! let (mut ws, _handshake) = server.accept(tcp).await?;
//!
//! let mut buf = bytes::BytesMut::new();
//! while let Ok(kind) = ws.read(&mut buf).await {
//!     ws.set_message_type(kind);
//!     ws.write(&buf).await?;
//!     buf.clear();
//! }
//! ```

use std::time::Duration;

mod block;

pub mod client;
pub mod deflate;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod protocol;
pub mod server;
pub mod stream;
pub mod utf8;

pub use client::WebSocketClient;
pub use deflate::DeflateConfig;
pub use error::{CloseReason, Error, ProtocolError, Result};
pub use frame::{FrameHeader, OpCode};
pub use handshake::HandshakeResult;
pub use protocol::{ControlKind, Message, MessageType, Role};
pub use server::WebSocketServer;
pub use stream::{ReuniteError, WebSocketReader, WebSocketStream, WebSocketWriter, reunite};

/// Initial capacity of the receive buffer
pub const RECV_BUFFER_SIZE: usize = 16 * 1024;

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload of a control frame
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Medium message threshold (< 64KB uses 4-byte header)
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the size of a handshake request or response head
pub const MAX_HANDSHAKE_SIZE: usize = 8192;

/// Smallest accepted write buffer size
pub const MIN_WRITE_BUFFER_SIZE: usize = 8;

/// WebSocket session configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum size of a received message, after decompression (default: 16MB)
    pub max_message_size: usize,
    /// Size of outgoing frames when auto-fragmenting, and the compressor's
    /// output step (default: 4KB, minimum 8)
    pub write_buffer_size: usize,
    /// Split large outgoing messages into frames (default: true)
    pub auto_fragment: bool,
    /// permessage-deflate preferences; `None` disables the extension
    pub compression: Option<DeflateConfig>,
    /// Bound on the opening handshake (default: 30s)
    pub handshake_timeout: Option<Duration>,
    /// Fail the session when nothing is received for this long (default: off)
    pub idle_timeout: Option<Duration>,
    /// Send a ping after half the idle timeout (default: false)
    pub keep_alive_pings: bool,
    /// Bound on the closing handshake (default: 5s)
    pub close_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: 16 * 1024 * 1024,
            write_buffer_size: 4096,
            auto_fragment: true,
            compression: None,
            handshake_timeout: Some(Duration::from_secs(30)),
            idle_timeout: None,
            keep_alive_pings: false,
            close_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Config with no timeouts at all
    pub fn untimed() -> Self {
        Self {
            handshake_timeout: None,
            close_timeout: None,
            ..Self::default()
        }
    }

    pub(crate) fn write_buffer_size(&self) -> usize {
        self.write_buffer_size.max(MIN_WRITE_BUFFER_SIZE)
    }
}

/// Builder for [`Config`]
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set the write buffer size (clamped to at least 8 bytes)
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size.max(MIN_WRITE_BUFFER_SIZE);
        self
    }

    /// Enable or disable auto-fragmentation of outgoing messages
    pub fn auto_fragment(mut self, enabled: bool) -> Self {
        self.config.auto_fragment = enabled;
        self
    }

    /// Offer (client) or accept (server) permessage-deflate
    pub fn compression(mut self, deflate: DeflateConfig) -> Self {
        self.config.compression = Some(deflate);
        self
    }

    /// Set the handshake timeout; `None` waits forever
    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the idle timeout; `None` disables it
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Send keep-alive pings when the connection is idle
    pub fn keep_alive_pings(mut self, enabled: bool) -> Self {
        self.config.keep_alive_pings = enabled;
        self
    }

    /// Set the close handshake timeout; `None` waits forever
    pub fn close_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Build the config
    pub fn build(self) -> Config {
        self.config
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::client::WebSocketClient;
    pub use crate::deflate::DeflateConfig;
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::protocol::{Message, MessageType, Role};
    pub use crate::server::WebSocketServer;
    pub use crate::stream::{WebSocketReader, WebSocketStream, WebSocketWriter};
}
