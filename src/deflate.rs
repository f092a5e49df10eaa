//! Per-Message Deflate Extension (RFC 7692)
//!
//! Negotiation of the extension parameters during the handshake, plus the
//! streaming compressor/decompressor pair the engines drive frame by frame.
//!
//! Compressed messages are raw DEFLATE ending in a sync flush whose
//! `00 00 ff ff` trailer is stripped on the wire. [`Deflater`] holds back the
//! last four bytes of its output until it knows whether they are that trailer;
//! [`Inflater::finish`] puts the trailer back at the end of each message.

use bytes::BytesMut;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};
use crate::protocol::Role;

/// Trailer bytes that must be removed after compression and added before decompression
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Extension token
pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Default LZ77 window size (32KB = 2^15)
pub const DEFAULT_WINDOW_BITS: u8 = 15;

/// Smallest window we agree to. zlib cannot produce raw streams with 8.
pub const MIN_WINDOW_BITS: u8 = 9;

/// Maximum LZ77 window size (32KB = 2^15)
pub const MAX_WINDOW_BITS: u8 = 15;

/// Inflater output step
const INFLATE_CHUNK: usize = 16 * 1024;

/// Configuration for permessage-deflate extension
///
/// Used both for the local preferences handed to [`Config`](crate::Config)
/// and for the parameters agreed in the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateConfig {
    /// Server's maximum LZ77 window bits (for compression when server, decompression when client)
    pub server_max_window_bits: u8,
    /// Client's maximum LZ77 window bits (for compression when client, decompression when server)
    pub client_max_window_bits: u8,
    /// If true, server must reset compression context after each message
    pub server_no_context_takeover: bool,
    /// If true, client must reset compression context after each message
    pub client_no_context_takeover: bool,
    /// Compression level (0-9, where 0 is no compression, 9 is max)
    pub compression_level: u32,
    /// Whole messages shorter than this are sent uncompressed
    pub compression_threshold: usize,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            server_max_window_bits: DEFAULT_WINDOW_BITS,
            client_max_window_bits: DEFAULT_WINDOW_BITS,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            compression_level: 6,
            compression_threshold: 32,
        }
    }
}

/// Parameters of one extension offer or response, as written on the wire
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeflateParams {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    pub server_max_window_bits: Option<u8>,
    /// `Some(None)` when the parameter is present without a value
    pub client_max_window_bits: Option<Option<u8>>,
}

impl DeflateConfig {
    /// Create config optimized for low memory usage
    pub fn low_memory() -> Self {
        Self {
            server_max_window_bits: 10,
            client_max_window_bits: 10,
            server_no_context_takeover: true,
            client_no_context_takeover: true,
            compression_level: 1,
            compression_threshold: 64,
        }
    }

    /// Create config optimized for best compression
    pub fn best_compression() -> Self {
        Self {
            server_max_window_bits: MAX_WINDOW_BITS,
            client_max_window_bits: MAX_WINDOW_BITS,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            compression_level: 9,
            compression_threshold: 16,
        }
    }

    /// Parse extension parameters from handshake
    pub fn from_params(params: &[(&str, Option<&str>)]) -> Result<DeflateParams> {
        let mut out = DeflateParams::default();
        let mut seen: Vec<&str> = Vec::with_capacity(params.len());

        for (name, value) in params {
            if seen.contains(name) {
                return Err(Error::HandshakeFailed("duplicate permessage-deflate parameter"));
            }
            seen.push(name);

            match *name {
                "server_no_context_takeover" => {
                    if value.is_some() {
                        return Err(Error::HandshakeFailed(
                            "server_no_context_takeover must not have a value",
                        ));
                    }
                    out.server_no_context_takeover = true;
                }
                "client_no_context_takeover" => {
                    if value.is_some() {
                        return Err(Error::HandshakeFailed(
                            "client_no_context_takeover must not have a value",
                        ));
                    }
                    out.client_no_context_takeover = true;
                }
                "server_max_window_bits" => {
                    let v = value.ok_or(Error::HandshakeFailed(
                        "server_max_window_bits requires a value",
                    ))?;
                    out.server_max_window_bits = Some(parse_window_bits(v)?);
                }
                "client_max_window_bits" => {
                    out.client_max_window_bits = Some(match value {
                        Some(v) => Some(parse_window_bits(v)?),
                        None => None,
                    });
                }
                _ => {
                    return Err(Error::HandshakeFailed(
                        "unknown permessage-deflate parameter",
                    ));
                }
            }
        }

        Ok(out)
    }

    /// Client offer header value built from these preferences
    pub fn to_offer_header(&self) -> String {
        let mut parts = vec![EXTENSION_NAME.to_string()];

        if self.server_no_context_takeover {
            parts.push("server_no_context_takeover".to_string());
        }
        if self.client_no_context_takeover {
            parts.push("client_no_context_takeover".to_string());
        }
        if self.server_max_window_bits < MAX_WINDOW_BITS {
            parts.push(format!(
                "server_max_window_bits={}",
                self.server_max_window_bits
            ));
        }
        if self.client_max_window_bits < MAX_WINDOW_BITS {
            parts.push(format!(
                "client_max_window_bits={}",
                self.client_max_window_bits
            ));
        } else {
            parts.push("client_max_window_bits".to_string());
        }

        parts.join("; ")
    }

    /// Generate extension response header value for server
    pub fn to_response_header(&self) -> String {
        let mut parts = vec![EXTENSION_NAME.to_string()];

        if self.server_no_context_takeover {
            parts.push("server_no_context_takeover".to_string());
        }
        if self.client_no_context_takeover {
            parts.push("client_no_context_takeover".to_string());
        }
        if self.server_max_window_bits < MAX_WINDOW_BITS {
            parts.push(format!(
                "server_max_window_bits={}",
                self.server_max_window_bits
            ));
        }
        if self.client_max_window_bits < MAX_WINDOW_BITS {
            parts.push(format!(
                "client_max_window_bits={}",
                self.client_max_window_bits
            ));
        }

        parts.join("; ")
    }

    /// Server side: pick the first acceptable offer in a
    /// `Sec-WebSocket-Extensions` value and return the agreed parameters.
    /// Unacceptable offers are skipped, not errors.
    pub fn negotiate(&self, header: &str) -> Option<DeflateConfig> {
        header
            .split(',')
            .filter_map(parse_deflate_offer)
            .filter_map(|params| Self::from_params(&params).ok())
            .find_map(|offer| self.accept_offer(&offer))
    }

    fn accept_offer(&self, offer: &DeflateParams) -> Option<DeflateConfig> {
        let server_bits = match offer.server_max_window_bits {
            Some(bits) => bits.min(self.server_max_window_bits),
            None => self.server_max_window_bits,
        };
        // A client limit can only be imposed if the client announced support
        let client_bits = match offer.client_max_window_bits {
            Some(Some(bits)) => bits.min(self.client_max_window_bits),
            Some(None) => self.client_max_window_bits,
            None => MAX_WINDOW_BITS,
        };
        if server_bits < MIN_WINDOW_BITS || client_bits < MIN_WINDOW_BITS {
            return None;
        }

        Some(DeflateConfig {
            server_max_window_bits: server_bits,
            client_max_window_bits: client_bits,
            server_no_context_takeover: offer.server_no_context_takeover
                || self.server_no_context_takeover,
            client_no_context_takeover: offer.client_no_context_takeover
                || self.client_no_context_takeover,
            compression_level: self.compression_level,
            compression_threshold: self.compression_threshold,
        })
    }

    /// Client side: check the server's response against what this config
    /// offered and return the agreed parameters.
    pub fn accept_response(&self, header: &str) -> Result<DeflateConfig> {
        let params = parse_deflate_offer(header)
            .ok_or(Error::HandshakeFailed("unexpected extension in response"))?;
        let response = Self::from_params(&params)?;

        let server_bits = response.server_max_window_bits.unwrap_or(MAX_WINDOW_BITS);
        if server_bits > self.server_max_window_bits {
            return Err(Error::HandshakeFailed("server_max_window_bits above offer"));
        }
        let client_bits = match response.client_max_window_bits {
            Some(Some(bits)) => bits.min(self.client_max_window_bits),
            Some(None) => {
                return Err(Error::HandshakeFailed(
                    "client_max_window_bits in response requires a value",
                ));
            }
            None => self.client_max_window_bits,
        };

        Ok(DeflateConfig {
            server_max_window_bits: server_bits,
            client_max_window_bits: client_bits,
            server_no_context_takeover: response.server_no_context_takeover,
            client_no_context_takeover: response.client_no_context_takeover
                || self.client_no_context_takeover,
            compression_level: self.compression_level,
            compression_threshold: self.compression_threshold,
        })
    }

    /// Compressor for messages sent by `role`
    pub fn deflater(&self, role: Role) -> Deflater {
        let (bits, reset) = match role {
            Role::Server => (self.server_max_window_bits, self.server_no_context_takeover),
            Role::Client => (self.client_max_window_bits, self.client_no_context_takeover),
        };
        Deflater::new(bits, self.compression_level, reset, self.compression_threshold)
    }

    /// Decompressor for messages received by `role`
    pub fn inflater(&self, role: Role) -> Inflater {
        let reset = match role {
            Role::Server => self.client_no_context_takeover,
            Role::Client => self.server_no_context_takeover,
        };
        Inflater::new(reset)
    }
}

fn parse_window_bits(v: &str) -> Result<u8> {
    let bits: u8 = v
        .parse()
        .map_err(|_| Error::HandshakeFailed("invalid max_window_bits value"))?;
    if !(8..=MAX_WINDOW_BITS).contains(&bits) {
        return Err(Error::HandshakeFailed("max_window_bits out of range (8-15)"));
    }
    Ok(bits)
}

/// Parse permessage-deflate extension parameters from header value
pub fn parse_deflate_offer(value: &str) -> Option<Vec<(&str, Option<&str>)>> {
    let value = value.trim();
    let rest = value.strip_prefix(EXTENSION_NAME)?.trim_start();

    if rest.is_empty() {
        return Some(Vec::new());
    }

    // Must start with semicolon if there are parameters
    let rest = rest.strip_prefix(';')?;

    let mut params = Vec::new();

    for part in rest.split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some((name, value)) = part.split_once('=') {
            let name = name.trim();
            let value = value.trim().trim_matches('"');
            params.push((name, Some(value)));
        } else {
            params.push((part, None));
        }
    }

    Some(params)
}

/// Streaming compressor for outgoing messages
pub struct Deflater {
    compress: Compress,
    no_context_takeover: bool,
    threshold: usize,
    /// Output held back in case it is the sync-flush trailer
    tail: [u8; 4],
    tail_len: usize,
    scratch: Vec<u8>,
}

impl Deflater {
    /// Create a new compressor
    pub fn new(window_bits: u8, level: u32, no_context_takeover: bool, threshold: usize) -> Self {
        let bits = window_bits.clamp(MIN_WINDOW_BITS, MAX_WINDOW_BITS);
        Self {
            compress: Compress::new_with_window_bits(Compression::new(level), false, bits),
            no_context_takeover,
            threshold,
            tail: [0; 4],
            tail_len: 0,
            scratch: Vec::new(),
        }
    }

    /// Whole messages below this size are not worth compressing
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Compress the next part of a message, appending at most about `limit`
    /// bytes of output to `out`.
    ///
    /// Returns the number of input bytes consumed and whether more output is
    /// pending. A call may consume input without producing output. With
    /// `fin` set the message is complete once `more` comes back false; the
    /// trailer has then been removed.
    pub fn deflate(
        &mut self,
        input: &[u8],
        limit: usize,
        fin: bool,
        out: &mut BytesMut,
    ) -> Result<(usize, bool)> {
        let flush = if fin {
            FlushCompress::Sync
        } else {
            FlushCompress::None
        };

        self.scratch.clear();
        self.scratch.resize(limit.max(8), 0);

        let before_in = self.compress.total_in();
        let before_out = self.compress.total_out();
        self.compress
            .compress(input, &mut self.scratch, flush)
            .map_err(|e| Error::Compression(format!("deflate error: {}", e)))?;
        let consumed = (self.compress.total_in() - before_in) as usize;
        let produced = (self.compress.total_out() - before_out) as usize;

        let drained = consumed == input.len() && produced < self.scratch.len();
        let more = !drained;

        let start = out.len();
        out.extend_from_slice(&self.tail[..self.tail_len]);
        out.extend_from_slice(&self.scratch[..produced]);
        self.tail_len = 0;
        let appended = out.len() - start;

        if fin && drained {
            if appended < 4 || out[out.len() - 4..] != DEFLATE_TRAILER {
                return Err(Error::Compression("missing sync flush trailer".into()));
            }
            out.truncate(out.len() - 4);
            if self.no_context_takeover {
                self.compress.reset();
            }
        } else {
            let keep = appended.min(4);
            self.tail[..keep].copy_from_slice(&out[out.len() - keep..]);
            self.tail_len = keep;
            out.truncate(out.len() - keep);
        }

        Ok((consumed, more))
    }

    /// Drop the compression context
    pub fn reset(&mut self) {
        self.compress.reset();
        self.tail_len = 0;
    }
}

/// Streaming decompressor for incoming messages
pub struct Inflater {
    decompress: Decompress,
    no_context_takeover: bool,
    scratch: Vec<u8>,
}

impl Inflater {
    /// Create a new decompressor. A full window decodes any smaller one.
    pub fn new(no_context_takeover: bool) -> Self {
        Self {
            decompress: Decompress::new(false),
            no_context_takeover,
            scratch: Vec::new(),
        }
    }

    /// Decompress `input`, appending to `out`. Fails with `MessageTooLarge`
    /// as soon as `out` would grow past `max`.
    pub fn inflate(&mut self, input: &[u8], out: &mut BytesMut, max: usize) -> Result<()> {
        self.scratch.resize(INFLATE_CHUNK, 0);
        let mut offset = 0;

        loop {
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress(&input[offset..], &mut self.scratch, FlushDecompress::None)
                .map_err(|e| Error::Compression(format!("inflate error: {}", e)))?;
            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;
            offset += consumed;

            if out.len() + produced > max {
                return Err(Error::MessageTooLarge);
            }
            out.extend_from_slice(&self.scratch[..produced]);

            if status == Status::StreamEnd {
                // Final block; a new stream starts with the next message
                self.decompress.reset(false);
                return Ok(());
            }
            if offset == input.len() && produced < self.scratch.len() {
                return Ok(());
            }
            if consumed == 0 && produced == 0 {
                return Ok(());
            }
        }
    }

    /// End of message: feed the stripped trailer back in.
    pub fn finish(&mut self, out: &mut BytesMut, max: usize) -> Result<()> {
        self.inflate(&DEFLATE_TRAILER, out, max)?;
        if self.no_context_takeover {
            self.reset();
        }
        Ok(())
    }

    /// Drop the decompression context
    pub fn reset(&mut self) {
        self.decompress.reset(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compress_message(d: &mut Deflater, msg: &[u8], limit: usize) -> Vec<BytesMut> {
        let mut chunks = Vec::new();
        let mut offset = 0;
        loop {
            let mut out = BytesMut::new();
            let (n, more) = d.deflate(&msg[offset..], limit, true, &mut out).unwrap();
            offset += n;
            if !out.is_empty() {
                chunks.push(out);
            }
            if !more {
                break;
            }
        }
        chunks
    }

    fn inflate_message(i: &mut Inflater, chunks: &[BytesMut]) -> BytesMut {
        let mut out = BytesMut::new();
        for c in chunks {
            i.inflate(c, &mut out, usize::MAX).unwrap();
        }
        i.finish(&mut out, usize::MAX).unwrap();
        out
    }

    #[test]
    fn test_compress_decompress() {
        let mut d = Deflater::new(15, 6, false, 0);
        let mut i = Inflater::new(false);

        let original = b"Hello, World! This is a test message that should be compressed.";
        let chunks = compress_message(&mut d, original, 4096);
        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].ends_with(&DEFLATE_TRAILER));
        assert_eq!(&inflate_message(&mut i, &chunks)[..], &original[..]);
    }

    #[test]
    fn test_output_bounded_by_limit() {
        let mut d = Deflater::new(15, 6, false, 0);
        let mut i = Inflater::new(false);

        let original: Vec<u8> = (0..20_000u32).map(|x| (x * 7919 % 251) as u8).collect();
        let chunks = compress_message(&mut d, &original, 64);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= 64 + 4));
        assert_eq!(&inflate_message(&mut i, &chunks)[..], &original[..]);
    }

    #[test]
    fn test_partial_writes_then_fin() {
        let mut d = Deflater::new(15, 6, false, 0);
        let mut i = Inflater::new(false);

        let mut chunks = Vec::new();
        for part in [&b"first part, "[..], b"second part, "] {
            let mut out = BytesMut::new();
            let (n, more) = d.deflate(part, 4096, false, &mut out).unwrap();
            assert_eq!(n, part.len());
            assert!(!more);
            chunks.push(out);
        }
        chunks.extend(compress_message(&mut d, b"and the end", 4096));

        assert_eq!(
            &inflate_message(&mut i, &chunks)[..],
            b"first part, second part, and the end"
        );
    }

    #[test]
    fn test_empty_message() {
        let mut d = Deflater::new(15, 6, false, 0);
        let mut i = Inflater::new(false);
        let chunks = compress_message(&mut d, b"", 4096);
        assert_eq!(chunks.len(), 1);
        assert!(inflate_message(&mut i, &chunks).is_empty());
    }

    #[test]
    fn test_context_takeover() {
        let msg = b"Hello, World! Hello, World! Hello, World!";

        let mut d = Deflater::new(15, 6, false, 0);
        let mut i = Inflater::new(false);
        let first = compress_message(&mut d, msg, 4096);
        let second = compress_message(&mut d, msg, 4096);
        assert!(second[0].len() < first[0].len());
        assert_eq!(&inflate_message(&mut i, &first)[..], &msg[..]);
        assert_eq!(&inflate_message(&mut i, &second)[..], &msg[..]);
    }

    #[test]
    fn test_no_context_takeover() {
        let msg = b"Hello, World! Hello, World! Hello, World!";

        let mut d = Deflater::new(15, 6, true, 0);
        let first = compress_message(&mut d, msg, 4096);
        let second = compress_message(&mut d, msg, 4096);
        assert_eq!(first, second);

        // A fresh inflater per message decodes both
        for chunks in [&first, &second] {
            let mut i = Inflater::new(true);
            assert_eq!(&inflate_message(&mut i, chunks)[..], &msg[..]);
        }
    }

    #[test]
    fn test_inflate_limit() {
        let mut d = Deflater::new(15, 6, false, 0);
        let big = vec![b'a'; 100_000];
        let chunks = compress_message(&mut d, &big, 1 << 20);

        let mut i = Inflater::new(false);
        let mut out = BytesMut::new();
        let err = i.inflate(&chunks[0], &mut out, 1000).unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge));
    }

    #[test]
    fn test_parse_deflate_offer() {
        let params = parse_deflate_offer("permessage-deflate").unwrap();
        assert!(params.is_empty());

        let params = parse_deflate_offer(
            "permessage-deflate; server_no_context_takeover; server_max_window_bits=10",
        )
        .unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0], ("server_no_context_takeover", None));
        assert_eq!(params[1], ("server_max_window_bits", Some("10")));

        assert!(parse_deflate_offer("some-other-extension").is_none());
        assert!(parse_deflate_offer("permessage-deflatex").is_none());
    }

    #[test]
    fn test_from_params() {
        let params = vec![
            ("server_no_context_takeover", None),
            ("client_max_window_bits", Some("12")),
        ];

        let offer = DeflateConfig::from_params(&params).unwrap();
        assert!(offer.server_no_context_takeover);
        assert!(!offer.client_no_context_takeover);
        assert_eq!(offer.client_max_window_bits, Some(Some(12)));
        assert_eq!(offer.server_max_window_bits, None);

        assert!(DeflateConfig::from_params(&[("bogus", None)]).is_err());
        assert!(
            DeflateConfig::from_params(&[
                ("client_no_context_takeover", None),
                ("client_no_context_takeover", None)
            ])
            .is_err()
        );
        assert!(DeflateConfig::from_params(&[("server_max_window_bits", Some("16"))]).is_err());
    }

    #[test]
    fn test_server_negotiation() {
        let local = DeflateConfig::default();

        let agreed = local
            .negotiate("x-webkit-deflate-frame, permessage-deflate; client_max_window_bits")
            .unwrap();
        assert_eq!(agreed.server_max_window_bits, 15);
        assert_eq!(agreed.client_max_window_bits, 15);
        assert_eq!(agreed.to_response_header(), "permessage-deflate");

        let agreed = local
            .negotiate("permessage-deflate; server_max_window_bits=10; client_no_context_takeover")
            .unwrap();
        assert_eq!(agreed.server_max_window_bits, 10);
        assert!(agreed.client_no_context_takeover);
        assert_eq!(
            agreed.to_response_header(),
            "permessage-deflate; client_no_context_takeover; server_max_window_bits=10"
        );

        // 8-bit server window cannot be honoured; fall through to the next offer
        let agreed = local
            .negotiate("permessage-deflate; server_max_window_bits=8, permessage-deflate")
            .unwrap();
        assert_eq!(agreed.server_max_window_bits, 15);

        assert!(local.negotiate("permessage-deflate; bogus").is_none());
    }

    #[test]
    fn test_client_accepts_response() {
        let local = DeflateConfig::default();
        assert_eq!(
            local.to_offer_header(),
            "permessage-deflate; client_max_window_bits"
        );

        let agreed = local
            .accept_response("permessage-deflate; server_no_context_takeover; client_max_window_bits=11")
            .unwrap();
        assert!(agreed.server_no_context_takeover);
        assert_eq!(agreed.client_max_window_bits, 11);

        let limited = DeflateConfig {
            server_max_window_bits: 10,
            ..Default::default()
        };
        assert!(limited.accept_response("permessage-deflate").is_err());
        assert!(limited
            .accept_response("permessage-deflate; server_max_window_bits=10")
            .is_ok());
    }

    #[test]
    fn test_role_pairing() {
        let agreed = DeflateConfig {
            server_no_context_takeover: true,
            ..Default::default()
        };
        assert!(agreed.deflater(Role::Server).no_context_takeover);
        assert!(!agreed.deflater(Role::Client).no_context_takeover);
        assert!(agreed.inflater(Role::Client).no_context_takeover);
        assert!(!agreed.inflater(Role::Server).no_context_takeover);
    }
}
