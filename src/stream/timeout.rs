//! Byte stream with per-operation deadlines

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Sleep, sleep};

pin_project! {
    /// Wraps a transport so that a read or write making no progress for the
    /// configured duration fails with [`io::ErrorKind::TimedOut`].
    ///
    /// The deadline restarts whenever an operation completes. Once it fires
    /// the stream is considered dead and every later operation fails the
    /// same way.
    ///
    /// ```ignore
    /// let tcp = TcpStream::connect(addr).await?;
    /// let tcp = TimeoutStream::new(tcp)
    ///     .with_read_timeout(Some(Duration::from_secs(30)))
    ///     .with_write_timeout(Some(Duration::from_secs(10)));
    /// let ws = client.connect(tcp, "localhost", "/").await?;
    /// ```
    pub struct TimeoutStream<S> {
        #[pin]
        inner: S,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
        read_deadline: Option<Pin<Box<Sleep>>>,
        write_deadline: Option<Pin<Box<Sleep>>>,
        expired: bool,
    }
}

impl<S> TimeoutStream<S> {
    /// Wrap `inner` with no deadlines set
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read_timeout: None,
            write_timeout: None,
            read_deadline: None,
            write_deadline: None,
            expired: false,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Whether a deadline has fired
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "operation timed out")
}

/// Poll the deadline for a pending operation, arming it on first use.
/// Ready means it fired.
fn poll_deadline(
    slot: &mut Option<Pin<Box<Sleep>>>,
    timeout: Option<Duration>,
    cx: &mut Context<'_>,
) -> Poll<()> {
    let Some(timeout) = timeout else {
        return Poll::Pending;
    };
    let deadline = slot.get_or_insert_with(|| Box::pin(sleep(timeout)));
    ready!(deadline.as_mut().poll(cx));
    *slot = None;
    Poll::Ready(())
}

impl<S: AsyncRead> AsyncRead for TimeoutStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if *this.expired {
            return Poll::Ready(Err(timed_out()));
        }
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(result) => {
                *this.read_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                ready!(poll_deadline(this.read_deadline, *this.read_timeout, cx));
                tracing::debug!("read deadline expired");
                *this.expired = true;
                Poll::Ready(Err(timed_out()))
            }
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for TimeoutStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        if *this.expired {
            return Poll::Ready(Err(timed_out()));
        }
        match this.inner.poll_write(cx, buf) {
            Poll::Ready(result) => {
                *this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                ready!(poll_deadline(this.write_deadline, *this.write_timeout, cx));
                tracing::debug!("write deadline expired");
                *this.expired = true;
                Poll::Ready(Err(timed_out()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        if *this.expired {
            return Poll::Ready(Err(timed_out()));
        }
        match this.inner.poll_flush(cx) {
            Poll::Ready(result) => {
                *this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                ready!(poll_deadline(this.write_deadline, *this.write_timeout, cx));
                *this.expired = true;
                Poll::Ready(Err(timed_out()))
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
