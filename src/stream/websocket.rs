//! WebSocket stream handles

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_sink::Sink;
use futures_util::{sink, stream};
use tokio::io::{AsyncRead, AsyncWrite};

use super::session::{Session, Status};
use crate::Config;
use crate::deflate::DeflateConfig;
use crate::error::{CloseReason, Error, Result};
use crate::frame::OpCode;
use crate::protocol::{ControlKind, Message, MessageType, Role};

/// A WebSocket session over an async transport
///
/// All operations take `&mut self`, so at most one read and one write run at
/// a time per handle. To read and write from different tasks, [`split`] the
/// stream.
///
/// # Example
///
/// ```ignore
/// use tidews::{CloseReason, WebSocketStream};
///
/// async fn echo(mut ws: WebSocketStream<TcpStream>) -> tidews::Result<()> {
///     let mut buf = bytes::BytesMut::new();
///     loop {
///         match ws.read(&mut buf).await {
///             Ok(kind) => {
///                 ws.set_message_type(kind);
///                 ws.write(&buf).await?;
///                 buf.clear();
///             }
///             Err(tidews::Error::ConnectionClosed) => return Ok(()),
///             Err(e) => return Err(e),
///         }
///     }
/// }
/// ```
///
/// [`split`]: WebSocketStream::split
pub struct WebSocketStream<S> {
    session: Arc<Session<S>>,
}

impl<S> WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a session over an already-upgraded connection
    pub fn from_raw(inner: S, role: Role, config: Config) -> Self {
        Self::from_parts(inner, role, config, BytesMut::new(), None)
    }

    /// Create a session with bytes already read past the handshake and the
    /// agreed compression parameters
    pub fn from_parts(
        inner: S,
        role: Role,
        config: Config,
        leftover: BytesMut,
        deflate: Option<DeflateConfig>,
    ) -> Self {
        Self {
            session: Arc::new(Session::new(inner, role, config, leftover, deflate)),
        }
    }

    /// Create a server-side session
    pub fn server(inner: S, config: Config) -> Self {
        Self::from_raw(inner, Role::Server, config)
    }

    /// Create a client-side session
    pub fn client(inner: S, config: Config) -> Self {
        Self::from_raw(inner, Role::Client, config)
    }

    /// Read one complete message, appending its payload to `buf`.
    ///
    /// Pings, pongs and close frames arriving meanwhile are handled
    /// internally. When the peer closes, the echo is sent and the read fails
    /// with [`Error::ConnectionClosed`]; the peer's reason is then available
    /// from [`close_reason`](Self::close_reason).
    ///
    /// Cancelling the returned future keeps a partly received message; the
    /// next call continues it. After [`read_some`](Self::read_some) returned
    /// part of a message, `read` appends the remainder only.
    pub async fn read(&mut self, buf: &mut BytesMut) -> Result<MessageType> {
        self.session.read(buf).await
    }

    /// Read part of a message, appending at most `limit` payload bytes to
    /// `buf` (no limit when `limit` is zero).
    ///
    /// Returns as soon as some payload is available. Use
    /// [`is_message_done`](Self::is_message_done) to learn whether the
    /// message ended with this call. An empty message completes with no
    /// bytes appended.
    pub async fn read_some(&mut self, buf: &mut BytesMut, limit: usize) -> Result<usize> {
        read_some(&self.session, buf, limit).await
    }

    /// Read one complete message
    pub async fn read_message(&mut self) -> Result<Message> {
        read_message(&self.session).await
    }

    /// Send `payload` as a complete message of the configured type
    pub async fn write(&mut self, payload: &[u8]) -> Result<()> {
        self.session.write(None, payload, true).await
    }

    /// Send `payload` as part of a message. The message ends with the first
    /// call passing `fin == true`.
    pub async fn write_frame(&mut self, fin: bool, payload: &[u8]) -> Result<()> {
        self.session.write(None, payload, fin).await
    }

    /// Send a message
    pub async fn send(&mut self, msg: Message) -> Result<()> {
        send_message(&self.session, msg).await
    }

    /// Send a ping
    pub async fn ping(&mut self, payload: &[u8]) -> Result<()> {
        self.session.send_control(OpCode::Ping, payload).await
    }

    /// Send an unsolicited pong
    pub async fn pong(&mut self, payload: &[u8]) -> Result<()> {
        self.session.send_control(OpCode::Pong, payload).await
    }

    /// Perform the close handshake. Does nothing if a close frame was
    /// already sent.
    pub async fn close(&mut self, reason: CloseReason) -> Result<()> {
        self.session.close(reason).await
    }

    /// Split into halves that can be used from different tasks
    pub fn split(self) -> (WebSocketReader<S>, WebSocketWriter<S>) {
        (
            WebSocketReader {
                session: self.session.clone(),
            },
            WebSocketWriter {
                session: self.session,
            },
        )
    }

    /// Recover the transport. Bytes received but not yet decoded are lost.
    pub fn into_inner(self) -> Option<S> {
        Arc::try_unwrap(self.session).ok()?.into_inner()
    }

    /// Turn into a [`Stream`] of received messages. The stream ends after
    /// the close handshake or the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Message>> {
        message_stream(self.session)
    }

    /// Turn into a [`Sink`] of outgoing messages
    pub fn into_sink(self) -> impl Sink<Message, Error = Error> {
        message_sink(self.session)
    }
}

impl<S> WebSocketStream<S> {
    /// Endpoint role of this session
    pub fn role(&self) -> Role {
        self.session.role
    }

    /// Agreed permessage-deflate parameters, if compression is active
    pub fn compression(&self) -> Option<&DeflateConfig> {
        self.session.deflate.as_ref()
    }

    /// Whether no close frame has been sent or received and no failure occurred
    pub fn is_open(&self) -> bool {
        self.session.status() == Status::Open
    }

    /// Whether the close handshake finished or the session failed
    pub fn is_closed(&self) -> bool {
        matches!(self.session.status(), Status::Closed | Status::Failed)
    }

    /// Close reason sent by the peer
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.session.close_reason()
    }

    /// Whether the last read reached the end of its message
    pub fn is_message_done(&self) -> bool {
        self.session.message_progress().1
    }

    /// Whether the message last read from is text
    pub fn got_text(&self) -> bool {
        self.session.message_progress().0 == MessageType::Text
    }

    /// Whether the message last read from is binary
    pub fn got_binary(&self) -> bool {
        self.session.message_progress().0 == MessageType::Binary
    }

    /// Type of the next message started by `write`
    pub fn set_message_type(&mut self, kind: MessageType) {
        self.session.update_settings(|s| s.message_type = kind);
    }

    /// Compress outgoing messages (when permessage-deflate was agreed)
    pub fn set_compress(&mut self, enabled: bool) {
        self.session.update_settings(|s| s.compress = enabled);
    }

    /// Split large outgoing messages into frames
    pub fn set_auto_fragment(&mut self, enabled: bool) {
        self.session.update_settings(|s| s.auto_fragment = enabled);
    }

    /// Limit the size of received messages
    pub fn set_max_message_size(&mut self, size: usize) {
        self.session.update_settings(|s| s.max_message_size = size);
    }

    /// Install a callback run for every received ping, pong and close frame.
    ///
    /// The callback runs inside read operations and must not call back into
    /// the session.
    pub fn set_control_callback<F>(&mut self, callback: F)
    where
        F: FnMut(ControlKind, &[u8]) + Send + 'static,
    {
        self.session.set_callback(Some(Box::new(callback)));
    }

    /// Remove the control callback
    pub fn clear_control_callback(&mut self) {
        self.session.set_callback(None);
    }
}

impl<S> fmt::Debug for WebSocketStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketStream")
            .field("role", &self.session.role)
            .field("status", &self.session.status())
            .finish()
    }
}

async fn read_message<S>(session: &Session<S>) -> Result<Message>
where
    S: AsyncRead + AsyncWrite,
{
    let mut buf = BytesMut::new();
    let kind = session.read(&mut buf).await?;
    let payload = buf.freeze();
    Ok(match kind {
        MessageType::Text => Message::Text(payload),
        MessageType::Binary => Message::Binary(payload),
    })
}

async fn read_some<S>(session: &Session<S>, buf: &mut BytesMut, limit: usize) -> Result<usize>
where
    S: AsyncRead + AsyncWrite,
{
    let before = buf.len();
    session.read_partial(buf, limit).await?;
    Ok(buf.len() - before)
}

async fn send_message<S>(session: &Session<S>, msg: Message) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    match msg {
        Message::Text(data) => session.write(Some(MessageType::Text), &data, true).await,
        Message::Binary(data) => session.write(Some(MessageType::Binary), &data, true).await,
        Message::Ping(data) => session.send_control(OpCode::Ping, &data).await,
        Message::Pong(data) => session.send_control(OpCode::Pong, &data).await,
        Message::Close(reason) => session.close(reason.unwrap_or_default()).await,
    }
}

fn message_stream<S>(session: Arc<Session<S>>) -> impl Stream<Item = Result<Message>>
where
    S: AsyncRead + AsyncWrite,
{
    stream::unfold(Some(session), |state| async move {
        let session = state?;
        match read_message(&session).await {
            Ok(msg) => Some((Ok(msg), Some(session))),
            Err(Error::ConnectionClosed) => None,
            Err(e) => Some((Err(e), None)),
        }
    })
}

fn message_sink<S>(session: Arc<Session<S>>) -> impl Sink<Message, Error = Error>
where
    S: AsyncRead + AsyncWrite,
{
    sink::unfold(session, |session, msg: Message| async move {
        send_message(&session, msg).await?;
        Ok::<_, Error>(session)
    })
}

// ============================================================================
// Split halves
// ============================================================================

/// The read half of a split [`WebSocketStream`]
pub struct WebSocketReader<S> {
    session: Arc<Session<S>>,
}

/// The write half of a split [`WebSocketStream`]
pub struct WebSocketWriter<S> {
    session: Arc<Session<S>>,
}

impl<S> WebSocketReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// See [`WebSocketStream::read`]
    pub async fn read(&mut self, buf: &mut BytesMut) -> Result<MessageType> {
        self.session.read(buf).await
    }

    /// See [`WebSocketStream::read_some`]
    pub async fn read_some(&mut self, buf: &mut BytesMut, limit: usize) -> Result<usize> {
        read_some(&self.session, buf, limit).await
    }

    /// Read one complete message
    pub async fn read_message(&mut self) -> Result<Message> {
        read_message(&self.session).await
    }

    /// Receive the next message; `None` once the session closed
    pub async fn next(&mut self) -> Option<Result<Message>> {
        match read_message(&self.session).await {
            Err(Error::ConnectionClosed) => None,
            other => Some(other),
        }
    }

    /// Turn into a [`Stream`] of received messages
    pub fn into_stream(self) -> impl Stream<Item = Result<Message>> {
        message_stream(self.session)
    }

    /// Put the halves back together
    pub fn reunite(
        self,
        writer: WebSocketWriter<S>,
    ) -> std::result::Result<WebSocketStream<S>, ReuniteError<S>> {
        reunite(self, writer)
    }
}

impl<S> WebSocketReader<S> {
    /// See [`WebSocketStream::is_open`]
    pub fn is_open(&self) -> bool {
        self.session.status() == Status::Open
    }

    /// See [`WebSocketStream::close_reason`]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.session.close_reason()
    }

    /// See [`WebSocketStream::is_message_done`]
    pub fn is_message_done(&self) -> bool {
        self.session.message_progress().1
    }

    /// See [`WebSocketStream::got_text`]
    pub fn got_text(&self) -> bool {
        self.session.message_progress().0 == MessageType::Text
    }

    /// See [`WebSocketStream::got_binary`]
    pub fn got_binary(&self) -> bool {
        self.session.message_progress().0 == MessageType::Binary
    }

    /// See [`WebSocketStream::set_max_message_size`]
    pub fn set_max_message_size(&mut self, size: usize) {
        self.session.update_settings(|s| s.max_message_size = size);
    }

    /// See [`WebSocketStream::set_control_callback`]
    pub fn set_control_callback<F>(&mut self, callback: F)
    where
        F: FnMut(ControlKind, &[u8]) + Send + 'static,
    {
        self.session.set_callback(Some(Box::new(callback)));
    }
}

impl<S> WebSocketWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// See [`WebSocketStream::write`]
    pub async fn write(&mut self, payload: &[u8]) -> Result<()> {
        self.session.write(None, payload, true).await
    }

    /// See [`WebSocketStream::write_frame`]
    pub async fn write_frame(&mut self, fin: bool, payload: &[u8]) -> Result<()> {
        self.session.write(None, payload, fin).await
    }

    /// Send a message
    pub async fn send(&mut self, msg: Message) -> Result<()> {
        send_message(&self.session, msg).await
    }

    /// Send a text message
    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.send(Message::text(text)).await
    }

    /// Send a binary message
    pub async fn send_binary(&mut self, data: Bytes) -> Result<()> {
        self.send(Message::Binary(data)).await
    }

    /// See [`WebSocketStream::ping`]
    pub async fn ping(&mut self, payload: &[u8]) -> Result<()> {
        self.session.send_control(OpCode::Ping, payload).await
    }

    /// See [`WebSocketStream::pong`]
    pub async fn pong(&mut self, payload: &[u8]) -> Result<()> {
        self.session.send_control(OpCode::Pong, payload).await
    }

    /// See [`WebSocketStream::close`]
    pub async fn close(&mut self, reason: CloseReason) -> Result<()> {
        self.session.close(reason).await
    }

    /// Turn into a [`Sink`] of outgoing messages
    pub fn into_sink(self) -> impl Sink<Message, Error = Error> {
        message_sink(self.session)
    }
}

impl<S> WebSocketWriter<S> {
    /// See [`WebSocketStream::is_open`]
    pub fn is_open(&self) -> bool {
        self.session.status() == Status::Open
    }

    /// See [`WebSocketStream::set_message_type`]
    pub fn set_message_type(&mut self, kind: MessageType) {
        self.session.update_settings(|s| s.message_type = kind);
    }

    /// See [`WebSocketStream::set_compress`]
    pub fn set_compress(&mut self, enabled: bool) {
        self.session.update_settings(|s| s.compress = enabled);
    }

    /// See [`WebSocketStream::set_auto_fragment`]
    pub fn set_auto_fragment(&mut self, enabled: bool) {
        self.session.update_settings(|s| s.auto_fragment = enabled);
    }
}

/// Reunite split reader and writer back into a WebSocketStream
///
/// Returns `Err` if the reader and writer are from different streams.
pub fn reunite<S>(
    reader: WebSocketReader<S>,
    writer: WebSocketWriter<S>,
) -> std::result::Result<WebSocketStream<S>, ReuniteError<S>> {
    if !Arc::ptr_eq(&reader.session, &writer.session) {
        return Err(ReuniteError { reader, writer });
    }
    drop(reader);
    Ok(WebSocketStream {
        session: writer.session,
    })
}

/// Error returned when trying to reunite halves from different streams
pub struct ReuniteError<S> {
    /// The reader half
    pub reader: WebSocketReader<S>,
    /// The writer half
    pub writer: WebSocketWriter<S>,
}

impl<S> fmt::Debug for ReuniteError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReuniteError")
            .field("reader", &"WebSocketReader { .. }")
            .field("writer", &"WebSocketWriter { .. }")
            .finish()
    }
}

impl<S> fmt::Display for ReuniteError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tried to reunite halves from different WebSocketStreams")
    }
}

impl<S> std::error::Error for ReuniteError<S> {}
