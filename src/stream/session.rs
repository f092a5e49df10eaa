//! Shared session state
//!
//! A [`Session`] is reference counted by every handle (the stream itself or
//! its split halves). It owns the two direction blocks and a small amount of
//! state guarded by a mutex that is never held across an await point.

use std::io;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::warn;

use crate::Config;
use crate::block::Block;
use crate::deflate::DeflateConfig;
use crate::error::{CloseReason, Error, Result};
use crate::protocol::{ControlCallback, ControlKind, MessageType, ReadState, Role, WriteState};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Open,
    /// A close frame was sent or received
    Closing,
    /// The close handshake finished
    Closed,
    /// A failure ended the session; see `SessionState::failure`
    Failed,
}

pub(crate) struct SessionState {
    pub status: Status,
    /// Our close frame was sent (or is being sent)
    pub wr_close: bool,
    /// The peer's close frame was received
    pub rd_close: bool,
    pub close_reason: Option<CloseReason>,
    pub failure: Option<Error>,
    /// Kind of the message last read from
    pub message_kind: MessageType,
    /// The last read finished its message
    pub message_done: bool,
}

/// Runtime settings changeable through the stream handles
#[derive(Debug, Clone, Copy)]
pub(crate) struct Settings {
    pub message_type: MessageType,
    pub compress: bool,
    pub auto_fragment: bool,
    pub max_message_size: usize,
}

/// Resources of the read direction
pub(crate) struct ReadSide<S> {
    pub io: ReadHalf<S>,
    pub state: ReadState,
}

impl<S: AsyncRead> ReadSide<S> {
    /// Append whatever the transport has to the receive buffer
    pub async fn read_more(&mut self) -> io::Result<usize> {
        if self.state.buf.capacity() - self.state.buf.len() < 4096 {
            self.state.buf.reserve(crate::RECV_BUFFER_SIZE);
        }
        self.io.read_buf(&mut self.state.buf).await
    }
}

/// Resources of the write direction
pub(crate) struct WriteSide<S> {
    pub io: WriteHalf<S>,
    pub state: WriteState,
}

impl<S: AsyncWrite> WriteSide<S> {
    /// Write the encoded frame in one go
    pub async fn send(&mut self) -> io::Result<()> {
        self.io.write_all(&self.state.frame).await?;
        self.io.flush().await
    }
}

pub(crate) struct Session<S> {
    pub role: Role,
    pub config: Config,
    pub deflate: Option<DeflateConfig>,
    state: Mutex<SessionState>,
    settings: Mutex<Settings>,
    callback: Mutex<Option<ControlCallback>>,
    pub read: Block<ReadSide<S>>,
    pub write: Block<WriteSide<S>>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Build an open session over an upgraded transport. `leftover` holds
    /// bytes already read past the handshake; `deflate` is the agreed
    /// permessage-deflate configuration, if any.
    pub fn new(
        stream: S,
        role: Role,
        config: Config,
        leftover: BytesMut,
        deflate: Option<DeflateConfig>,
    ) -> Self {
        let (rd, wr) = tokio::io::split(stream);

        let mut read_state = ReadState::new(
            role,
            config.max_message_size,
            deflate.as_ref().map(|d| d.inflater(role)),
        );
        read_state.buf.extend_from_slice(&leftover);

        let write_state = WriteState::new(
            role,
            config.write_buffer_size(),
            config.auto_fragment,
            deflate.as_ref().map(|d| d.deflater(role)),
        );

        let settings = Settings {
            message_type: MessageType::Binary,
            compress: true,
            auto_fragment: config.auto_fragment,
            max_message_size: config.max_message_size,
        };

        Self {
            role,
            config,
            deflate,
            state: Mutex::new(SessionState {
                status: Status::Open,
                wr_close: false,
                rd_close: false,
                close_reason: None,
                failure: None,
                message_kind: MessageType::Binary,
                message_done: true,
            }),
            settings: Mutex::new(settings),
            callback: Mutex::new(None),
            read: Block::new(ReadSide {
                io: rd,
                state: read_state,
            }),
            write: Block::new(WriteSide {
                io: wr,
                state: write_state,
            }),
        }
    }

    /// Recover the transport. Fails if an operation still holds a block.
    pub fn into_inner(self) -> Option<S>
    where
        S: Unpin,
    {
        let rd = self.read.into_inner()?;
        let wr = self.write.into_inner()?;
        Some(rd.io.unsplit(wr.io))
    }
}

impl<S> Session<S> {
    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.lock().close_reason.clone()
    }

    /// Kind of the message last read from, and whether it was read to the end
    pub fn message_progress(&self) -> (MessageType, bool) {
        let st = self.state.lock();
        (st.message_kind, st.message_done)
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn settings(&self) -> Settings {
        *self.settings.lock()
    }

    pub fn update_settings(&self, f: impl FnOnce(&mut Settings)) {
        f(&mut self.settings.lock())
    }

    pub fn set_callback(&self, cb: Option<ControlCallback>) {
        *self.callback.lock() = cb;
    }

    /// Run the control callback, if any
    pub fn notify(&self, kind: ControlKind, payload: &[u8]) {
        if let Some(cb) = self.callback.lock().as_mut() {
            cb(kind, payload);
        }
    }

    /// Whether a close frame went out or came in
    pub fn is_closing(&self) -> bool {
        let st = self.state.lock();
        st.wr_close || st.rd_close
    }

    /// Gate for read operations
    pub fn check_readable(&self) -> Result<()> {
        let st = self.state.lock();
        match st.status {
            Status::Failed => Err(stored_failure(&st)),
            Status::Closed => Err(Error::ConnectionClosed),
            _ if st.rd_close => Err(Error::ConnectionClosed),
            _ => Ok(()),
        }
    }

    /// Gate for write operations
    pub fn check_writable(&self) -> Result<()> {
        let st = self.state.lock();
        match st.status {
            Status::Failed => Err(stored_failure(&st)),
            Status::Closed => Err(Error::ConnectionClosed),
            _ if st.wr_close => Err(Error::ConnectionClosed),
            _ => Ok(()),
        }
    }

    /// Fails with the stored failure, if any
    pub fn check_failed(&self) -> Result<()> {
        let st = self.state.lock();
        if st.status == Status::Failed {
            return Err(stored_failure(&st));
        }
        Ok(())
    }

    /// Claim the right to send our close frame. False if it was already
    /// claimed.
    pub fn begin_close(&self) -> bool {
        let mut st = self.state.lock();
        if st.wr_close {
            return false;
        }
        st.wr_close = true;
        if st.status == Status::Open {
            st.status = Status::Closing;
        }
        true
    }

    /// Record a failure. The first failure wins and is what every later
    /// operation reports.
    pub fn mark_failed(&self, err: Error) -> Error {
        let mut st = self.state.lock();
        match st.status {
            Status::Failed => stored_failure(&st),
            Status::Closed => err,
            _ => {
                warn!(error = %err, "websocket session failed");
                st.status = Status::Failed;
                st.failure = Some(err.replicate());
                err
            }
        }
    }

    pub fn mark_closed(&self) {
        let mut st = self.state.lock();
        if st.status != Status::Failed {
            st.status = Status::Closed;
        }
    }
}

fn stored_failure(st: &SessionState) -> Error {
    st.failure
        .as_ref()
        .map_or(Error::ConnectionClosed, Error::replicate)
}

/// Fails the session with `Aborted` if dropped while armed: a frame was
/// partly handed to the transport and the byte stream can no longer be
/// trusted.
pub(crate) struct InFlight<'a, S> {
    session: &'a Session<S>,
    armed: bool,
}

impl<'a, S> InFlight<'a, S> {
    pub fn new(session: &'a Session<S>) -> Self {
        Self {
            session,
            armed: true,
        }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl<S> Drop for InFlight<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.session.mark_failed(Error::Aborted);
        }
    }
}
