//! Write engine

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use super::session::{InFlight, Session, WriteSide};
use crate::block::{BlockGuard, OpKind};
use crate::error::{Error, Result};
use crate::protocol::{FramePlan, MessageType};

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Send `payload` as (part of) a message. A message started with
    /// `fin == false` is continued by the next call. `kind` overrides the
    /// configured message type for a new message.
    pub(crate) async fn write(
        &self,
        kind: Option<MessageType>,
        payload: &[u8],
        fin: bool,
    ) -> Result<()> {
        match self.write_inner(kind, payload, fin).await {
            Err(Error::ConnectionClosed) => Err(Error::ConnectionClosed),
            Err(e) => Err(self.fail(e).await),
            ok => ok,
        }
    }

    async fn write_inner(
        &self,
        kind: Option<MessageType>,
        payload: &[u8],
        fin: bool,
    ) -> Result<()> {
        self.check_writable()?;
        let mut wr = self.write.lock(OpKind::Write).await?;
        self.check_writable()?;

        let settings = self.settings();
        wr.state.compress_enabled = settings.compress;
        wr.state.auto_fragment = settings.auto_fragment;
        let kind = kind.unwrap_or(settings.message_type);
        let plan = wr.state.plan_as(kind, fin, payload.len());
        trace!(len = payload.len(), fin, ?plan, "writing");

        let flight = InFlight::new(self);
        let result = self.emit(wr, plan, payload, fin).await;
        flight.disarm();
        result
    }

    async fn emit(
        &self,
        mut wr: BlockGuard<'_, WriteSide<S>>,
        plan: FramePlan,
        payload: &[u8],
        fin: bool,
    ) -> Result<()> {
        match plan {
            FramePlan::Single => {
                wr.state.encode_data(payload, fin);
                wr.send().await?;
            }
            FramePlan::Fragmented => {
                let size = wr.state.buffer_size;
                let mut chunks = payload.chunks(size).peekable();
                while let Some(chunk) = chunks.next() {
                    let last = chunks.peek().is_none();
                    wr.state.encode_data(chunk, fin && last);
                    wr.send().await?;
                    if !last {
                        wr = self.between_frames(wr).await?;
                    }
                }
            }
            FramePlan::Deflate => {
                let mut input = payload;
                loop {
                    let (consumed, more, ready) = wr.state.deflate_step(input, fin)?;
                    input = &input[consumed..];
                    if ready {
                        wr.send().await?;
                    }
                    if !more {
                        break;
                    }
                    if ready {
                        wr = self.between_frames(wr).await?;
                    }
                }
            }
        }
        wr.state.finish_call(fin);
        Ok(())
    }

    /// Let queued control frames go out between two frames of a message
    async fn between_frames<'a>(
        &'a self,
        wr: BlockGuard<'a, WriteSide<S>>,
    ) -> Result<BlockGuard<'a, WriteSide<S>>> {
        let wr = wr.yield_to(OpKind::is_control).await?;
        self.check_writable()?;
        Ok(wr)
    }
}
