//! HTTP/1.1 upgrade handshake
//!
//! The opening exchange is parsed with `httparse` into `http::Request<()>` /
//! `http::Response<()>` values so decorators can inspect and modify them
//! with the usual `http` types before they are serialized.
//!
//! Server side: [`validate_request`], [`build_response`], [`rejection`].
//! Client side: [`build_request`], [`validate_response`].

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderMap, HeaderName, HeaderValue,
    SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION, SERVER, UPGRADE, USER_AGENT,
};
use http::{Method, Request, Response, StatusCode, Version};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::deflate::DeflateConfig;
use crate::error::{Error, Result};
use crate::{Config, MAX_HANDSHAKE_SIZE, WS_GUID};

/// Value of the `Server` and `User-Agent` headers
pub const AGENT: &str = concat!("tidews/", env!("CARGO_PKG_VERSION"));

/// Maximum number of headers parsed from a handshake message
const MAX_HEADERS: usize = 64;

/// Hook run on the server's response (101 or rejection) before it is sent
pub type ResponseDecorator = Arc<dyn Fn(&Request<()>, &mut Response<()>) + Send + Sync>;

/// Hook run on the client's upgrade request before it is sent
pub type RequestDecorator = Arc<dyn Fn(&mut Request<()>) + Send + Sync>;

/// Outcome of a completed opening handshake
#[derive(Debug, Clone)]
pub struct HandshakeResult {
    /// Request path, including the query
    pub path: String,
    /// Subprotocols the client asked for, in order of preference
    pub protocols: Vec<String>,
    /// Subprotocol selected in the 101 response
    pub protocol: Option<String>,
    /// Agreed permessage-deflate parameters
    pub compression: Option<DeflateConfig>,
    /// Headers of the peer's message (request on the server, response on
    /// the client)
    pub headers: HeaderMap,
}

/// A request that is not a valid upgrade, with the status to answer it with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub reason: &'static str,
}

impl Rejection {
    fn bad_request(reason: &'static str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            reason,
        }
    }
}

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Generate a random WebSocket key (client-side)
pub fn generate_key() -> String {
    let mut bytes = [0u8; 16];
    crate::mask::fill_random(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// A key must be the base64 encoding of exactly 16 bytes
pub fn is_valid_key(key: &str) -> bool {
    base64::engine::general_purpose::STANDARD
        .decode(key)
        .is_ok_and(|raw| raw.len() == 16)
}

/// Whether any value of the comma-separated header `name` contains `token`,
/// compared case-insensitively
pub fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// All values of a list header, joined back into one
fn joined(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    (!values.is_empty()).then(|| values.join(", "))
}

fn list(headers: &HeaderMap, name: HeaderName) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

fn http_version(minor: Option<u8>) -> Version {
    match minor {
        Some(1) => Version::HTTP_11,
        _ => Version::HTTP_10,
    }
}

/// Parse an HTTP request head.
///
/// Returns `None` while the head is incomplete, otherwise the request and the
/// number of bytes it took.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request<()>, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(Error::InvalidHttp("malformed request")),
    };

    let method = Method::from_bytes(req.method.unwrap_or_default().as_bytes())
        .map_err(|_| Error::InvalidHttp("invalid method"))?;
    let mut builder = Request::builder()
        .method(method)
        .uri(req.path.unwrap_or("/"))
        .version(http_version(req.version));
    for header in req.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    let request = builder
        .body(())
        .map_err(|_| Error::InvalidHttp("malformed request"))?;
    Ok(Some((request, len)))
}

/// Parse an HTTP response head. See [`parse_request`].
pub fn parse_response(buf: &[u8]) -> Result<Option<(Response<()>, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    let len = match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(_) => return Err(Error::InvalidHttp("malformed response")),
    };

    let mut builder = Response::builder()
        .status(res.code.unwrap_or_default())
        .version(http_version(res.version));
    for header in res.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    let response = builder
        .body(())
        .map_err(|_| Error::InvalidHttp("malformed response"))?;
    Ok(Some((response, len)))
}

/// Check that a request is a WebSocket upgrade this server can accept
pub fn validate_request(req: &Request<()>) -> std::result::Result<(), Rejection> {
    let headers = req.headers();

    if req.version() != Version::HTTP_11 {
        return Err(Rejection::bad_request("HTTP/1.1 required"));
    }
    if req.method() != Method::GET {
        return Err(Rejection::bad_request("GET required"));
    }
    if !headers.contains_key(HOST) {
        return Err(Rejection::bad_request("missing Host"));
    }
    if !header_has_token(headers, CONNECTION, "upgrade") {
        return Err(Rejection::bad_request("missing Connection: upgrade"));
    }
    if !header_has_token(headers, UPGRADE, "websocket") {
        return Err(Rejection::bad_request("missing Upgrade: websocket"));
    }
    match header_str(headers, SEC_WEBSOCKET_KEY) {
        None => return Err(Rejection::bad_request("missing Sec-WebSocket-Key")),
        Some(key) if !is_valid_key(key) => {
            return Err(Rejection::bad_request("invalid Sec-WebSocket-Key"));
        }
        Some(_) => {}
    }
    match header_str(headers, SEC_WEBSOCKET_VERSION) {
        None => Err(Rejection::bad_request("missing Sec-WebSocket-Version")),
        Some("13") => Ok(()),
        Some(_) => Err(Rejection {
            status: StatusCode::UPGRADE_REQUIRED,
            reason: "unsupported Sec-WebSocket-Version",
        }),
    }
}

/// Build the response refusing an upgrade
pub fn rejection(refused: Rejection) -> Response<()> {
    let mut res = Response::new(());
    *res.status_mut() = refused.status;
    let headers = res.headers_mut();
    headers.insert(SERVER, HeaderValue::from_static(AGENT));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(refused.reason.len()));
    if refused.status == StatusCode::UPGRADE_REQUIRED {
        headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    }
    res
}

/// Build the 101 response for a validated request
pub fn build_response(
    req: &Request<()>,
    compression: Option<&DeflateConfig>,
) -> Result<Response<()>> {
    let key = header_str(req.headers(), SEC_WEBSOCKET_KEY)
        .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Key"))?;

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "upgrade")
        .header(SEC_WEBSOCKET_ACCEPT, generate_accept_key(key))
        .header(SERVER, AGENT);
    if let Some(deflate) = compression {
        builder = builder.header(SEC_WEBSOCKET_EXTENSIONS, deflate.to_response_header());
    }
    builder
        .body(())
        .map_err(|_| Error::InvalidHttp("invalid response header"))
}

/// Build a client upgrade request
pub fn build_request(
    host: &str,
    path: &str,
    key: &str,
    protocols: &[String],
    compression: Option<&DeflateConfig>,
) -> Result<Request<()>> {
    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(HOST, host)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "upgrade")
        .header(SEC_WEBSOCKET_KEY, key)
        .header(SEC_WEBSOCKET_VERSION, "13")
        .header(USER_AGENT, AGENT);
    if !protocols.is_empty() {
        builder = builder.header(SEC_WEBSOCKET_PROTOCOL, protocols.join(", "));
    }
    if let Some(deflate) = compression {
        builder = builder.header(SEC_WEBSOCKET_EXTENSIONS, deflate.to_offer_header());
    }
    builder
        .body(())
        .map_err(|_| Error::InvalidHttp("invalid request header"))
}

/// Check a server's response to our upgrade request.
///
/// Returns the agreed compression parameters.
pub fn validate_response(
    res: &Response<()>,
    key: &str,
    offered: Option<&DeflateConfig>,
    protocols: &[String],
) -> Result<Option<DeflateConfig>> {
    let headers = res.headers();

    if res.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::HandshakeFailed("expected 101 Switching Protocols"));
    }
    if res.version() != Version::HTTP_11 {
        return Err(Error::HandshakeFailed("HTTP/1.1 required"));
    }
    if !header_has_token(headers, CONNECTION, "upgrade") {
        return Err(Error::HandshakeFailed("missing Connection: upgrade"));
    }
    if !header_has_token(headers, UPGRADE, "websocket") {
        return Err(Error::HandshakeFailed("missing Upgrade: websocket"));
    }
    let accept = header_str(headers, SEC_WEBSOCKET_ACCEPT)
        .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Accept"))?;
    if accept != generate_accept_key(key) {
        return Err(Error::HandshakeFailed("invalid Sec-WebSocket-Accept"));
    }
    if let Some(protocol) = header_str(headers, SEC_WEBSOCKET_PROTOCOL) {
        if !protocols.iter().any(|p| p == protocol) {
            return Err(Error::HandshakeFailed("unexpected subprotocol"));
        }
    }

    match (joined(headers, SEC_WEBSOCKET_EXTENSIONS), offered) {
        (None, _) => Ok(None),
        (Some(_), None) => Err(Error::HandshakeFailed("unexpected extension in response")),
        (Some(value), Some(ours)) => ours.accept_response(&value).map(Some),
    }
}

/// Serialize a request head
pub fn encode_request(req: &Request<()>) -> Bytes {
    let mut buf = BytesMut::with_capacity(512);
    buf.put_slice(req.method().as_str().as_bytes());
    buf.put_u8(b' ');
    let target = req.uri().path_and_query().map_or("/", |p| p.as_str());
    buf.put_slice(target.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    put_headers(&mut buf, req.headers());
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Serialize a response head followed by `body`
pub fn encode_response(res: &Response<()>, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(256 + body.len());
    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(res.status().as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(res.status().canonical_reason().unwrap_or("").as_bytes());
    buf.put_slice(b"\r\n");
    put_headers(&mut buf, res.headers());
    buf.put_slice(b"\r\n");
    buf.put_slice(body);
    buf.freeze()
}

fn put_headers(buf: &mut BytesMut, headers: &HeaderMap) {
    for (name, value) in headers {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
}

/// Read until `parse` recognizes a complete head. Bytes past the head stay
/// in `buf`.
async fn read_head<S, T>(
    stream: &mut S,
    buf: &mut BytesMut,
    parse: fn(&[u8]) -> Result<Option<(T, usize)>>,
) -> Result<T>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some((head, len)) = parse(buf)? {
            buf.advance(len);
            return Ok(head);
        }
        if buf.len() >= MAX_HANDSHAKE_SIZE {
            return Err(Error::InvalidHttp("handshake too large"));
        }
        buf.reserve(1024);
        if stream.read_buf(buf).await? == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
    }
}

/// Run `fut` under an optional deadline
pub(crate) async fn with_deadline<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout)?,
        None => fut.await,
    }
}

/// Server side: read the upgrade request, then answer it.
///
/// Returns the result and the bytes that followed the request.
pub(crate) async fn server_handshake<S>(
    stream: &mut S,
    config: &Config,
    decorator: Option<&ResponseDecorator>,
) -> Result<(HandshakeResult, BytesMut)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    let request = match read_head(stream, &mut buf, parse_request).await {
        Ok(request) => request,
        Err(Error::InvalidHttp(reason)) => {
            let response = rejection(Rejection::bad_request(reason));
            let _ = send(stream, &encode_response(&response, reason.as_bytes())).await;
            return Err(Error::InvalidHttp(reason));
        }
        Err(e) => return Err(e),
    };
    let result = answer(stream, request, config, decorator).await?;
    Ok((result, buf))
}

/// Server side: answer an upgrade request that was already read
pub(crate) async fn answer<S>(
    stream: &mut S,
    request: Request<()>,
    config: &Config,
    decorator: Option<&ResponseDecorator>,
) -> Result<HandshakeResult>
where
    S: AsyncWrite + Unpin,
{
    if let Err(refused) = validate_request(&request) {
        debug!(status = %refused.status, reason = refused.reason, "upgrade rejected");
        let mut response = rejection(refused);
        if let Some(decorate) = decorator {
            decorate(&request, &mut response);
        }
        let _ = send(stream, &encode_response(&response, refused.reason.as_bytes())).await;
        return Err(Error::HandshakeFailed(refused.reason));
    }

    let compression = config.compression.as_ref().and_then(|ours| {
        joined(request.headers(), SEC_WEBSOCKET_EXTENSIONS).and_then(|offer| ours.negotiate(&offer))
    });
    let mut response = build_response(&request, compression.as_ref())?;
    if let Some(decorate) = decorator {
        decorate(&request, &mut response);
    }
    send(stream, &encode_response(&response, b"")).await?;

    let path = request
        .uri()
        .path_and_query()
        .map_or("/", |p| p.as_str())
        .to_string();
    let result = HandshakeResult {
        path,
        protocols: list(request.headers(), SEC_WEBSOCKET_PROTOCOL),
        protocol: header_str(response.headers(), SEC_WEBSOCKET_PROTOCOL).map(String::from),
        compression,
        headers: request.into_parts().0.headers,
    };
    debug!(
        path = %result.path,
        protocol = ?result.protocol,
        compression = result.compression.is_some(),
        "upgrade accepted"
    );
    Ok(result)
}

/// Client side: send the upgrade request and check the response.
///
/// Returns the result and the bytes that followed the response.
pub(crate) async fn client_handshake<S>(
    stream: &mut S,
    host: &str,
    path: &str,
    protocols: &[String],
    config: &Config,
    decorator: Option<&RequestDecorator>,
) -> Result<(HandshakeResult, BytesMut)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let offered = config.compression.as_ref();
    let mut request = build_request(host, path, &key, protocols, offered)?;
    if let Some(decorate) = decorator {
        decorate(&mut request);
    }
    send(stream, &encode_request(&request)).await?;

    let mut buf = BytesMut::with_capacity(1024);
    let response = read_head(stream, &mut buf, parse_response).await?;
    let compression = validate_response(&response, &key, offered, protocols).map_err(|e| {
        debug!(status = %response.status(), error = %e, "upgrade refused");
        e
    })?;

    let result = HandshakeResult {
        path: path.to_string(),
        protocols: protocols.to_vec(),
        protocol: header_str(response.headers(), SEC_WEBSOCKET_PROTOCOL).map(String::from),
        compression,
        headers: response.into_parts().0.headers,
    };
    debug!(
        path,
        protocol = ?result.protocol,
        compression = result.compression.is_some(),
        "upgrade completed"
    );
    Ok((result, buf))
}

async fn send<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> Result<()> {
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}
