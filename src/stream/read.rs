//! Read engine
//!
//! Reads assemble one message per call. Control frames met on the way are
//! handled in place: pings are answered, pongs reported, and a close frame
//! ends the read with [`Error::ConnectionClosed`] after the echo went out.
//!
//! The read block is never held while waiting for the write block. Whenever
//! the engine has to send something it lets go of the read side first and
//! takes it back afterwards.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::session::{InFlight, ReadSide, Session, Status, WriteSide};
use crate::block::{BlockGuard, OpKind};
use crate::error::{CloseReason, Error, Result};
use crate::frame::OpCode;
use crate::protocol::{ControlFrame, ControlKind, MessageType, ReadEvent};

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Read the rest of the current message, appending its payload to `out`.
    pub(crate) async fn read(&self, out: &mut BytesMut) -> Result<MessageType> {
        self.read_until(out, None).await.map(|(kind, _)| kind)
    }

    /// Append at most `limit` payload bytes of the current message to `out`,
    /// returning as soon as any are available. The flag tells whether the
    /// message is now complete.
    pub(crate) async fn read_partial(
        &self,
        out: &mut BytesMut,
        limit: usize,
    ) -> Result<(MessageType, bool)> {
        let limit = if limit == 0 { usize::MAX } else { limit };
        self.read_until(out, Some(limit)).await
    }

    async fn read_until(
        &self,
        out: &mut BytesMut,
        limit: Option<usize>,
    ) -> Result<(MessageType, bool)> {
        match self.read_inner(out, limit).await {
            Err(Error::ConnectionClosed) => Err(Error::ConnectionClosed),
            Err(e) => Err(self.fail(e).await),
            ok => ok,
        }
    }

    async fn read_inner(
        &self,
        out: &mut BytesMut,
        limit: Option<usize>,
    ) -> Result<(MessageType, bool)> {
        self.check_readable()?;
        let mut rd = self.read.lock(OpKind::Read).await?;
        self.check_readable()?;
        rd.state.max_message_size = self.settings().max_message_size;

        loop {
            let ready = match limit {
                Some(_) => rd.state.has_pending(),
                None => rd.state.is_complete(),
            };
            if ready {
                let before = out.len();
                let done = rd.state.deliver(out, limit.unwrap_or(usize::MAX));
                let kind = rd.state.kind();
                trace!(len = out.len() - before, ?kind, done, "payload delivered");
                self.with_state(|st| {
                    st.message_kind = kind;
                    st.message_done = done;
                });
                return Ok((kind, done));
            }

            match rd.state.advance()? {
                ReadEvent::Message(kind) => trace!(?kind, "message complete"),
                ReadEvent::NeedMore => rd = self.fill(rd).await?,
                ReadEvent::Control(ControlFrame::Ping(payload)) => {
                    if self.is_closing() {
                        trace!("ignoring ping while closing");
                        continue;
                    }
                    self.notify(ControlKind::Ping, &payload);
                    drop(rd);
                    self.reply_pong(&payload).await?;
                    rd = self.read.lock(OpKind::Read).await?;
                    self.check_readable()?;
                }
                ReadEvent::Control(ControlFrame::Pong(payload)) => {
                    if !self.with_state(|st| st.wr_close) {
                        self.notify(ControlKind::Pong, &payload);
                    }
                }
                ReadEvent::Control(ControlFrame::Close(reason)) => {
                    let text = reason.as_ref().map_or("", |r| r.reason.as_str());
                    self.notify(ControlKind::Close, text.as_bytes());
                    return self.on_peer_close(rd, reason).await;
                }
            }
        }
    }

    /// Read more bytes, then give a queued close handshake the chance to
    /// take over the transport.
    async fn fill<'a>(
        &'a self,
        mut rd: BlockGuard<'a, ReadSide<S>>,
    ) -> Result<BlockGuard<'a, ReadSide<S>>> {
        let n = self.read_some(&mut rd).await?;
        if n == 0 {
            debug!("transport closed without a close frame");
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        let rd = rd.yield_to(|kind| kind == OpKind::Close).await?;
        self.check_readable()?;
        Ok(rd)
    }

    /// One transport read, subject to the idle timeout
    async fn read_some(&self, rd: &mut ReadSide<S>) -> Result<usize> {
        let Some(idle) = self.config.idle_timeout else {
            return Ok(rd.read_more().await?);
        };

        let half = idle / 2;
        let mut quiet = false;
        loop {
            match tokio::time::timeout(half, rd.read_more()).await {
                Ok(n) => return Ok(n?),
                Err(_) if !quiet => {
                    quiet = true;
                    if self.config.keep_alive_pings {
                        self.keep_alive_ping().await?;
                    }
                }
                Err(_) => {
                    debug!(?idle, "idle timeout");
                    return Err(Error::Timeout);
                }
            }
        }
    }

    /// Ping the peer if the write side happens to be free
    async fn keep_alive_ping(&self) -> Result<()> {
        let Some(mut wr) = self.write.try_lock(OpKind::Ping) else {
            return Ok(());
        };
        if self.check_writable().is_err() {
            return Ok(());
        }
        trace!("sending keep-alive ping");
        wr.state.encode_control(OpCode::Ping, &[]);
        if let Err(e) = self.send_frame(&mut wr).await {
            debug!(error = %e, "keep-alive ping failed");
            return Err(e.into());
        }
        Ok(())
    }

    async fn reply_pong(&self, payload: &[u8]) -> Result<()> {
        let mut wr = self.write.lock(OpKind::Reply).await?;
        if self.check_writable().is_err() {
            return Ok(());
        }
        wr.state.encode_control(OpCode::Pong, payload);
        self.send_frame(&mut wr).await?;
        Ok(())
    }

    /// Send the encoded frame. Dropping the future midway fails the session.
    pub(crate) async fn send_frame(&self, wr: &mut WriteSide<S>) -> io::Result<()> {
        let flight = InFlight::new(self);
        let sent = wr.send().await;
        flight.disarm();
        sent
    }

    /// The peer sent a close frame. Echo it unless our own close already went
    /// out, then tear the connection down.
    async fn on_peer_close(
        &self,
        rd: BlockGuard<'_, ReadSide<S>>,
        reason: Option<CloseReason>,
    ) -> Result<(MessageType, bool)> {
        let code = reason.as_ref().map_or(CloseReason::NORMAL, |r| r.code);
        debug!(code, "close frame received");

        let closer_running = self.with_state(|st| {
            st.rd_close = true;
            st.close_reason = reason;
            if st.status == Status::Open {
                st.status = Status::Closing;
            }
            st.wr_close
        });
        // The close handshake we started finishes the job
        if closer_running {
            return Err(Error::ConnectionClosed);
        }
        drop(rd);

        let mut wr = self.write.lock(OpKind::Reply).await?;
        if !self.begin_close() {
            return Err(Error::ConnectionClosed);
        }
        wr.state.encode_close(Some(&CloseReason::new(code, "")));
        if let Err(e) = self.send_frame(&mut wr).await {
            let _ = wr.io.shutdown().await;
            return Err(self.mark_failed(e.into()));
        }
        debug!(code, "close frame echoed");

        let mut rd = self.read.lock(OpKind::Close).await?;
        self.teardown(&mut wr, &mut rd).await;
        self.mark_closed();
        Err(Error::ConnectionClosed)
    }
}
