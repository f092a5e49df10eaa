//! Close handshake, failure handling and control frames sent by the user

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::session::{ReadSide, Session, Status, WriteSide};
use crate::MAX_CONTROL_PAYLOAD;
use crate::block::OpKind;
use crate::error::{CloseReason, Error, Result};
use crate::frame::OpCode;
use crate::protocol::{ControlFrame, ControlKind, ReadEvent, Role};

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Start the close handshake and wait for it to finish. A no-op once our
    /// close frame was sent.
    pub(crate) async fn close(&self, reason: CloseReason) -> Result<()> {
        self.check_failed()?;
        if self.with_state(|st| st.wr_close) {
            return Ok(());
        }

        let result = match self.config.close_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.close_inner(&reason)).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(?limit, "close handshake timed out");
                    Err(Error::Timeout)
                }
            },
            None => self.close_inner(&reason).await,
        };

        match result {
            Err(e) => {
                let e = self.mark_failed(e);
                self.abort().await;
                Err(e)
            }
            ok => ok,
        }
    }

    async fn close_inner(&self, reason: &CloseReason) -> Result<()> {
        let mut wr = self.write.lock(OpKind::Close).await?;
        self.check_failed()?;
        if !self.begin_close() {
            return Ok(());
        }
        debug!(code = reason.code, "sending close frame");
        wr.state.encode_close(Some(reason));
        self.send_frame(&mut wr).await?;

        let mut rd = self.read.lock(OpKind::Close).await?;
        self.check_failed()?;
        if !self.with_state(|st| st.rd_close) {
            rd.state.discard = true;
            self.drain(&mut rd).await?;
        }
        self.teardown(&mut wr, &mut rd).await;
        self.mark_closed();
        debug!("websocket closed");
        Ok(())
    }

    /// Discard everything up to the peer's close frame or end of stream
    async fn drain(&self, rd: &mut ReadSide<S>) -> Result<()> {
        loop {
            match rd.state.advance()? {
                ReadEvent::NeedMore => {
                    if rd.read_more().await? == 0 {
                        debug!("transport closed before the close reply");
                        return Ok(());
                    }
                }
                ReadEvent::Message(_) => {
                    rd.state.take_message();
                }
                ReadEvent::Control(ControlFrame::Close(reason)) => {
                    let text = reason.as_ref().map_or("", |r| r.reason.as_str());
                    self.notify(ControlKind::Close, text.as_bytes());
                    debug!(code = ?reason.as_ref().map(|r| r.code), "close reply received");
                    self.with_state(|st| {
                        st.rd_close = true;
                        st.close_reason = reason;
                    });
                    return Ok(());
                }
                ReadEvent::Control(_) => trace!("discarding control frame while closing"),
            }
        }
    }

    /// Shut down our send side. A client then waits for the server to close
    /// the connection; a server closes first and does not wait.
    pub(crate) async fn teardown(&self, wr: &mut WriteSide<S>, rd: &mut ReadSide<S>) {
        if let Err(e) = wr.io.shutdown().await {
            trace!(error = %e, "shutdown failed");
        }
        if self.role == Role::Server {
            return;
        }

        let wait_eof = async {
            loop {
                rd.state.buf.clear();
                match rd.read_more().await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        match self.config.close_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, wait_eof).await.is_err() {
                    debug!("server did not close the connection");
                }
            }
            None => wait_eof.await,
        }
    }

    /// Best-effort shutdown of the send side, skipped if a write is running
    pub(crate) async fn abort(&self) {
        if let Some(mut wr) = self.write.try_lock(OpKind::Close) {
            let _ = wr.io.shutdown().await;
        }
    }

    /// Fail the session with `err`. Sends a close frame carrying the matching
    /// status code when the error has one, then tears down. Returns the error
    /// the caller should report.
    pub(crate) async fn fail(&self, err: Error) -> Error {
        let pending = self.with_state(|st| match st.status {
            Status::Failed | Status::Closed => None,
            _ => Some(st.wr_close),
        });
        let err = self.mark_failed(err);
        let Some(closer_running) = pending else {
            return err;
        };
        if closer_running {
            self.abort().await;
            return err;
        }

        let Ok(mut wr) = self.write.lock(OpKind::Close).await else {
            return err;
        };
        if !self.begin_close() {
            return err;
        }
        let Some(code) = err.close_code() else {
            let _ = wr.io.shutdown().await;
            return err;
        };

        debug!(code, "sending close frame after failure");
        wr.state.encode_close(Some(&CloseReason::new(code, "")));
        if self.send_frame(&mut wr).await.is_err() {
            let _ = wr.io.shutdown().await;
            return err;
        }
        if let Ok(mut rd) = self.read.lock(OpKind::Close).await {
            self.teardown(&mut wr, &mut rd).await;
        }
        err
    }

    /// Send a ping or pong on behalf of the user
    pub(crate) async fn send_control(&self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::Capacity("control frame payload exceeds 125 bytes"));
        }

        let result: Result<()> = async {
            self.check_writable()?;
            let mut wr = self.write.lock(OpKind::Ping).await?;
            self.check_writable()?;
            wr.state.encode_control(opcode, payload);
            Ok(self.send_frame(&mut wr).await?)
        }
        .await;

        match result {
            Err(Error::ConnectionClosed) => Err(Error::ConnectionClosed),
            Err(e) => Err(self.fail(e).await),
            ok => ok,
        }
    }
}
