//! Async WebSocket sessions
//!
//! This module provides the main [`WebSocketStream`] type and the engines
//! behind it. A session owns two operation blocks, one per direction, so a
//! read and a write can be in flight at the same time:
//!
//! - `read` assembles messages and answers control frames
//! - `write` frames, masks and compresses outgoing data
//! - `close` runs the close handshake and tears the transport down
//!
//! # Split Streams
//!
//! For concurrent send/receive, use the `split()` method:
//!
//! ```ignore
//! let (mut reader, mut writer) = ws.split();
//!
//! // Spawn a task for reading
//! let read_task = tokio::spawn(async move {
//!     while let Some(msg) = reader.next().await {
//!         println!("Received: {:?}", msg);
//!     }
//! });
//!
//! // Send messages from another task
//! writer.send(Message::text("Hello")).await?;
//! ```

mod close;
mod read;
mod session;
mod timeout;
mod websocket;
mod write;


pub use timeout::TimeoutStream;
pub use websocket::*;
