//! WebSocket server
//!
//! `WebSocketServer` runs the opening handshake on an accepted connection and
//! hands back an open [`WebSocketStream`].
//!
//! # Example
//!
//! ```ignore
//! use tidews::{Config, WebSocketServer};
//! use tokio::net::TcpListener;
//!
//! let listener = TcpListener::bind("0.0.0.0:8080").await?;
//! let server = WebSocketServer::new(Config::default());
//!
//! server.serve(listener, |mut ws, handshake| async move {
//!     println!("Connection to {}", handshake.path);
//!     while let Ok(msg) = ws.read_message().await {
//!         if ws.send(msg).await.is_err() {
//!             break;
//!         }
//!     }
//! }).await?;
//! ```

use std::future::Future;
use std::sync::Arc;

use bytes::BytesMut;
use http::{Request, Response};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::handshake::{self, HandshakeResult, ResponseDecorator};
use crate::protocol::Role;
use crate::{Config, WebSocketStream};

/// Accepts WebSocket upgrades on established connections
#[derive(Clone, Default)]
pub struct WebSocketServer {
    config: Config,
    decorator: Option<ResponseDecorator>,
}

impl WebSocketServer {
    /// Create a new WebSocket server with the given configuration
    pub fn new(config: Config) -> Self {
        Self {
            config,
            decorator: None,
        }
    }

    /// Modify every handshake response before it is sent, both the 101 and
    /// rejections.
    ///
    /// A decorator typically selects a subprotocol:
    ///
    /// ```ignore
    /// let server = WebSocketServer::new(Config::default()).with_decorator(|req, res| {
    ///     if let Some(p) = req.headers().get("sec-websocket-protocol") {
    ///         res.headers_mut().insert("sec-websocket-protocol", p.clone());
    ///     }
    /// });
    /// ```
    pub fn with_decorator<F>(mut self, decorator: F) -> Self
    where
        F: Fn(&Request<()>, &mut Response<()>) + Send + Sync + 'static,
    {
        self.decorator = Some(Arc::new(decorator));
        self
    }

    /// Get the server configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Accept a WebSocket connection on an existing stream
    ///
    /// Reads the upgrade request, validates it and answers it. An invalid
    /// request is answered with `400 Bad Request` (or `426 Upgrade Required`
    /// for a version mismatch) and the call fails with
    /// [`Error::HandshakeFailed`].
    pub async fn accept<S>(&self, mut stream: S) -> Result<(WebSocketStream<S>, HandshakeResult)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let outcome = handshake::with_deadline(
            self.config.handshake_timeout,
            handshake::server_handshake(&mut stream, &self.config, self.decorator.as_ref()),
        )
        .await;

        match outcome {
            Ok((result, leftover)) => Ok(self.open(stream, result, leftover)),
            Err(e) => Err(abandon(&mut stream, e).await),
        }
    }

    /// Accept an upgrade request the caller already read off `stream`.
    ///
    /// `leftover` holds any bytes received after the request head; they are
    /// treated as the start of the WebSocket stream.
    pub async fn accept_request<S>(
        &self,
        mut stream: S,
        request: Request<()>,
        leftover: BytesMut,
    ) -> Result<(WebSocketStream<S>, HandshakeResult)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let outcome = handshake::with_deadline(
            self.config.handshake_timeout,
            handshake::answer(&mut stream, request, &self.config, self.decorator.as_ref()),
        )
        .await;

        match outcome {
            Ok(result) => Ok(self.open(stream, result, leftover)),
            Err(e) => Err(abandon(&mut stream, e).await),
        }
    }

    fn open<S>(
        &self,
        stream: S,
        result: HandshakeResult,
        leftover: BytesMut,
    ) -> (WebSocketStream<S>, HandshakeResult)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ws = WebSocketStream::from_parts(
            stream,
            Role::Server,
            self.config.clone(),
            leftover,
            result.compression.clone(),
        );
        (ws, result)
    }

    /// Serve WebSocket connections from a TCP listener
    ///
    /// Each connection is upgraded on its own task and passed to `handler`.
    /// Failed handshakes are logged and dropped. Returns only when accepting
    /// from the listener fails.
    pub async fn serve<F, Fut>(&self, listener: TcpListener, handler: F) -> Result<()>
    where
        F: Fn(WebSocketStream<tokio::net::TcpStream>, HandshakeResult) -> Fut
            + Clone
            + Send
            + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            let (stream, addr) = listener.accept().await.map_err(Error::Io)?;

            let handler = handler.clone();
            let server = self.clone();

            tokio::spawn(async move {
                match server.accept(stream).await {
                    Ok((ws, handshake)) => handler(ws, handshake).await,
                    Err(e) => warn!(%addr, error = %e, "websocket handshake failed"),
                }
            });
        }
    }
}

/// Shut the connection after a failed handshake
async fn abandon<S: AsyncWrite + Unpin>(stream: &mut S, e: Error) -> Error {
    if matches!(e, Error::Timeout) {
        debug!("handshake timed out");
    }
    let _ = stream.shutdown().await;
    e
}

impl std::fmt::Debug for WebSocketServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("config", &self.config)
            .field("decorated", &self.decorator.is_some())
            .finish()
    }
}
