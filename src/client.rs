//! WebSocket client
//!
//! `WebSocketClient` sends the upgrade request over a connected stream and
//! returns an open [`WebSocketStream`] once the server's 101 checks out.
//!
//! # Example
//!
//! ```ignore
//! use tidews::{Config, Message, WebSocketClient};
//!
//! let client = WebSocketClient::new(Config::default()).with_protocols(["chat"]);
//! let (mut ws, handshake) = client.connect_to_url("ws://127.0.0.1:9001/chat").await?;
//! println!("protocol: {:?}", handshake.protocol);
//!
//! ws.send(Message::text("Hello")).await?;
//! let reply = ws.read_message().await?;
//! ```

use std::sync::Arc;

use http::Request;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Error, Result};
use crate::handshake::{self, HandshakeResult, RequestDecorator};
use crate::protocol::Role;
use crate::{Config, WebSocketStream};

/// Opens WebSocket sessions over established connections
#[derive(Clone, Default)]
pub struct WebSocketClient {
    config: Config,
    protocols: Vec<String>,
    decorator: Option<RequestDecorator>,
}

impl WebSocketClient {
    /// Create a new WebSocket client with the given configuration
    pub fn new(config: Config) -> Self {
        Self {
            config,
            protocols: Vec::new(),
            decorator: None,
        }
    }

    /// Subprotocols to request, in order of preference
    pub fn with_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Modify the upgrade request before it is sent, e.g. to add
    /// authentication headers
    pub fn with_decorator<F>(mut self, decorator: F) -> Self
    where
        F: Fn(&mut Request<()>) + Send + Sync + 'static,
    {
        self.decorator = Some(Arc::new(decorator));
        self
    }

    /// Get the client configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connect to a WebSocket server over an existing stream
    ///
    /// `host` becomes the `Host` header and `path` the request target.
    pub async fn connect<S>(
        &self,
        mut stream: S,
        host: &str,
        path: &str,
    ) -> Result<(WebSocketStream<S>, HandshakeResult)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let outcome = handshake::with_deadline(
            self.config.handshake_timeout,
            handshake::client_handshake(
                &mut stream,
                host,
                path,
                &self.protocols,
                &self.config,
                self.decorator.as_ref(),
            ),
        )
        .await;

        match outcome {
            Ok((result, leftover)) => {
                let ws = WebSocketStream::from_parts(
                    stream,
                    Role::Client,
                    self.config.clone(),
                    leftover,
                    result.compression.clone(),
                );
                Ok((ws, result))
            }
            Err(e) => {
                if matches!(e, Error::Timeout) {
                    debug!(host, "handshake timed out");
                }
                let _ = stream.shutdown().await;
                Err(e)
            }
        }
    }

    /// Connect to a `ws://` URL over plain TCP
    ///
    /// `wss://` needs a TLS stream; establish it yourself and use
    /// [`connect`](Self::connect).
    pub async fn connect_to_url(
        &self,
        url: &str,
    ) -> Result<(WebSocketStream<TcpStream>, HandshakeResult)> {
        let target = parse_url(url)?;
        let stream = TcpStream::connect((target.host, target.port))
            .await
            .map_err(Error::Io)?;
        stream.set_nodelay(true).map_err(Error::Io)?;
        self.connect(stream, target.authority, target.path).await
    }
}

impl std::fmt::Debug for WebSocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketClient")
            .field("config", &self.config)
            .field("protocols", &self.protocols)
            .field("decorated", &self.decorator.is_some())
            .finish()
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Target<'a> {
    /// `host[:port]` as written, for the Host header
    authority: &'a str,
    host: &'a str,
    port: u16,
    path: &'a str,
}

fn parse_url(url: &str) -> Result<Target<'_>> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or(Error::HandshakeFailed("invalid URL: missing scheme"))?;

    match scheme {
        "ws" => {}
        "wss" => return Err(Error::HandshakeFailed("wss URLs need a TLS stream")),
        _ => return Err(Error::HandshakeFailed("invalid URL scheme: expected ws")),
    }

    // Split host:port from path
    let (authority, path) = rest
        .find(['/', '?'])
        .map(|i| (&rest[..i], &rest[i..]))
        .unwrap_or((rest, "/"));

    let (host, port) = match authority.rsplit_once(':') {
        // A bracketed IPv6 literal without a port
        Some((_, tail)) if tail.ends_with(']') => (authority, 80),
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| Error::HandshakeFailed("invalid port"))?;
            (host, port)
        }
        None => (authority, 80),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');

    if host.is_empty() {
        return Err(Error::HandshakeFailed("URL missing host"));
    }

    Ok(Target {
        authority,
        host,
        port,
        path,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::header::AUTHORIZATION;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::handshake::{generate_accept_key, parse_request};
    use crate::protocol::Message;
    use crate::server::WebSocketServer;

    /// Read the upgrade request off `io` and answer it with `response`,
    /// which may reference the accept value as `{accept}`, and `trailing`
    /// in the same write
    async fn answer(
        io: &mut tokio::io::DuplexStream,
        response: &str,
        trailing: &[u8],
    ) -> Request<()> {
        let mut buf = Vec::new();
        let (request, _) = loop {
            let mut chunk = [0u8; 512];
            let n = io.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if let Some(parsed) = parse_request(&buf).unwrap() {
                break parsed;
            }
        };
        let key = request.headers()["sec-websocket-key"].to_str().unwrap();
        let mut out = response
            .replace("{accept}", &generate_accept_key(key))
            .into_bytes();
        out.extend_from_slice(trailing);
        io.write_all(&out).await.unwrap();
        request
    }

    #[test]
    fn test_parse_url() {
        assert_eq!(
            parse_url("ws://example.com/chat?x=1").unwrap(),
            Target {
                authority: "example.com",
                host: "example.com",
                port: 80,
                path: "/chat?x=1",
            }
        );
        assert_eq!(
            parse_url("ws://127.0.0.1:9001").unwrap(),
            Target {
                authority: "127.0.0.1:9001",
                host: "127.0.0.1",
                port: 9001,
                path: "/",
            }
        );
        assert_eq!(parse_url("ws://[::1]:8080/").unwrap().host, "::1");
        assert_eq!(parse_url("ws://[::1]/").unwrap().port, 80);

        assert!(parse_url("example.com").is_err());
        assert!(parse_url("wss://example.com").is_err());
        assert!(parse_url("http://example.com").is_err());
        assert!(parse_url("ws://:80/").is_err());
        assert!(parse_url("ws://host:notaport/").is_err());
    }

    #[tokio::test]
    async fn test_request_is_decorated() {
        let (a, mut b) = tokio::io::duplex(4096);
        let client = WebSocketClient::default().with_decorator(|req| {
            req.headers_mut()
                .insert(AUTHORIZATION, "Bearer token".parse().unwrap());
        });

        let server = async {
            answer(
                &mut b,
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {accept}\r\n\r\n",
                b"",
            )
            .await
        };
        let (connected, request) = tokio::join!(client.connect(a, "example.com", "/ws"), server);

        connected.unwrap();
        assert_eq!(request.uri().path(), "/ws");
        assert_eq!(request.headers()["host"], "example.com");
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer token");
    }

    #[tokio::test]
    async fn test_bad_accept_fails() {
        let (a, mut b) = tokio::io::duplex(4096);
        let client = WebSocketClient::default();
        let server = async {
            answer(
                &mut b,
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: AAAAAAAAAAAAAAAAAAAAAAAAAAA=\r\n\r\n",
                b"",
            )
            .await
        };
        let (connected, _) = tokio::join!(client.connect(a, "example.com", "/"), server);
        assert!(matches!(
            connected.unwrap_err(),
            Error::HandshakeFailed("invalid Sec-WebSocket-Accept")
        ));
    }

    #[tokio::test]
    async fn test_refused_upgrade_fails() {
        let (a, mut b) = tokio::io::duplex(4096);
        let client = WebSocketClient::default();
        let server = async {
            answer(
                &mut b,
                "HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n",
                b"",
            )
            .await
        };
        let (connected, _) = tokio::join!(client.connect(a, "example.com", "/"), server);
        assert!(matches!(
            connected.unwrap_err(),
            Error::HandshakeFailed("expected 101 Switching Protocols")
        ));
    }

    #[tokio::test]
    async fn test_frame_after_response_is_kept() {
        let (a, mut b) = tokio::io::duplex(4096);
        let client = WebSocketClient::default();
        let server = async {
            // Unmasked server frame right behind the head
            answer(
                &mut b,
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {accept}\r\n\r\n",
                b"\x81\x02ok",
            )
            .await
        };
        let (connected, _) = tokio::join!(client.connect(a, "example.com", "/"), server);
        let (mut ws, _) = connected.unwrap();
        assert_eq!(ws.read_message().await.unwrap().as_text(), Some("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let (a, _b) = tokio::io::duplex(4096);
        let config = Config::builder()
            .handshake_timeout(Some(Duration::from_secs(1)))
            .build();
        let err = WebSocketClient::new(config)
            .connect(a, "example.com", "/")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn test_connect_to_url() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let (mut ws, handshake) = WebSocketServer::default().accept(tcp).await.unwrap();
            assert_eq!(handshake.path, "/echo");
            let msg = ws.read_message().await.unwrap();
            ws.send(msg).await.unwrap();
            assert!(matches!(
                ws.read_message().await,
                Err(Error::ConnectionClosed)
            ));
        });

        let url = format!("ws://{addr}/echo");
        let (mut ws, _) = WebSocketClient::default().connect_to_url(&url).await.unwrap();
        ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
        assert_eq!(ws.read_message().await.unwrap().as_bytes(), &[1, 2, 3]);
        ws.close(crate::CloseReason::default()).await.unwrap();
        assert!(ws.is_closed());

        server.await.unwrap();
    }
}
