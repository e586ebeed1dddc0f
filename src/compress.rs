use std::io::Write;

use anyhow::{Context, Result};
use flate2::{Compression, GzBuilder, write::GzEncoder};
use http::{HeaderMap, HeaderValue, header};
use rand::Rng;

use crate::cache::response::cache_control_directives;

/// Responses smaller than this are not worth the encoder overhead.
pub const MIN_COMPRESS_SIZE: u64 = 1024;

/// Internal marker an earlier stage (or the upstream itself) sets on a
/// response to veto compression. Stripped before the response is written.
pub const NO_COMPRESSION_HEADER: &str = "x-thrust-no-compression";

const GZIP_LEVEL: u32 = 6;
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
    Zstd,
}

impl Encoding {
    pub fn content_encoding(self) -> Option<&'static str> {
        match self {
            Encoding::Identity => None,
            Encoding::Gzip => Some("gzip"),
            Encoding::Zstd => Some("zstd"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub guard_enabled: bool,
    pub jitter: u32,
}

/// Content-negotiation half of the stage: what the client can take.
/// Prefers zstd when advertised, falls back to gzip.
pub fn negotiate(request_headers: &HeaderMap) -> Encoding {
    let mut gzip = false;
    for value in request_headers.get_all(header::ACCEPT_ENCODING) {
        let Ok(list) = value.to_str() else { continue };
        for item in list.split(',') {
            let token = item.split(';').next().unwrap_or("").trim();
            if token.eq_ignore_ascii_case("zstd") {
                return Encoding::Zstd;
            }
            if token.eq_ignore_ascii_case("gzip") {
                gzip = true;
            }
        }
    }
    if gzip { Encoding::Gzip } else { Encoding::Identity }
}

/// BREACH guard, request side: secret-bearing requests poison the response
/// for compression before the upstream is even consulted.
pub fn request_blocks_compression(request_headers: &HeaderMap) -> bool {
    request_headers.contains_key(header::COOKIE)
        || request_headers.contains_key(header::AUTHORIZATION)
        || request_headers.contains_key("x-csrf-token")
}

/// BREACH guard, response side. Directive matching is on the directive name
/// only, so `my-private-setting=x` stays compressible; the Vary check is a
/// whole-token match, so `Cookie-Name` does not count as `Cookie`.
pub fn response_blocks_compression(response_headers: &HeaderMap) -> bool {
    if response_headers.contains_key(header::SET_COOKIE) {
        return true;
    }

    let directives = cache_control_directives(response_headers);
    if directives
        .iter()
        .any(|(name, _)| name == "private" || name == "no-store")
    {
        return true;
    }

    response_headers.get_all(header::VARY).iter().any(|value| {
        value
            .to_str()
            .map(|list| {
                list.split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("cookie"))
            })
            .unwrap_or(false)
    })
}

/// Applies the guard to a live response: marks it non-compressible via the
/// internal header so the decision travels with the response headers.
pub fn apply_guard(
    config: &CompressionConfig,
    request_headers: &HeaderMap,
    response_headers: &mut HeaderMap,
) {
    if !config.enabled || !config.guard_enabled {
        return;
    }
    if request_blocks_compression(request_headers)
        || response_blocks_compression(response_headers)
    {
        response_headers.insert(
            header::HeaderName::from_static(NO_COMPRESSION_HEADER),
            HeaderValue::from_static("1"),
        );
    }
}

/// Decides the outgoing encoding for a response. `body_len` is `None` when
/// the body size is not yet known (the caller pre-buffers up to the minimum
/// size in that case and re-asks). Mutates the headers: adds
/// `Vary: Accept-Encoding` where compression is in play and strips the
/// internal no-compression marker.
pub fn plan(
    config: &CompressionConfig,
    negotiated: Encoding,
    response_headers: &mut HeaderMap,
    body_len: Option<u64>,
) -> Encoding {
    let vetoed = response_headers.remove(NO_COMPRESSION_HEADER).is_some();

    if !config.enabled || negotiated == Encoding::Identity {
        return Encoding::Identity;
    }
    if vetoed
        || response_headers.contains_key(header::CONTENT_ENCODING)
        || response_headers.contains_key(header::CONTENT_RANGE)
        || !is_compressible_type(response_headers)
    {
        return Encoding::Identity;
    }

    if !vary_has_accept_encoding(response_headers) {
        response_headers.append(header::VARY, HeaderValue::from_static("Accept-Encoding"));
    }

    match body_len {
        Some(len) if len < MIN_COMPRESS_SIZE => Encoding::Identity,
        _ => negotiated,
    }
}

fn is_compressible_type(response_headers: &HeaderMap) -> bool {
    let Some(content_type) = response_headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
    else {
        // No declared type: assume text, like the upstream's 404 pages.
        return true;
    };
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    media_type.starts_with("text/")
        || matches!(
            media_type.as_str(),
            "application/json"
                | "application/javascript"
                | "application/x-javascript"
                | "application/xml"
                | "application/xhtml+xml"
                | "application/rss+xml"
                | "application/atom+xml"
                | "application/x-www-form-urlencoded"
                | "image/svg+xml"
        )
}

fn vary_has_accept_encoding(response_headers: &HeaderMap) -> bool {
    response_headers.get_all(header::VARY).iter().any(|value| {
        value
            .to_str()
            .map(|list| {
                list.split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("accept-encoding"))
            })
            .unwrap_or(false)
    })
}

/// Compresses a fully-buffered body.
pub fn compress_full(encoding: Encoding, body: &[u8], jitter: u32) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Identity => Ok(body.to_vec()),
        Encoding::Gzip => {
            let mut encoder = gzip_encoder(Vec::with_capacity(body.len() / 2), jitter);
            encoder
                .write_all(body)
                .context("failed to gzip response body")?;
            encoder.finish().context("failed to finish gzip stream")
        }
        Encoding::Zstd => {
            zstd::bulk::compress(body, ZSTD_LEVEL).context("failed to zstd response body")
        }
    }
}

/// Incremental encoder for streamed bodies; each `write` returns whatever
/// compressed output the flush produced so it can go on the wire as a chunk.
pub enum StreamingEncoder {
    Gzip(GzEncoder<Vec<u8>>),
    Zstd(zstd::stream::write::Encoder<'static, Vec<u8>>),
}

impl StreamingEncoder {
    pub fn new(encoding: Encoding, jitter: u32) -> Result<Option<Self>> {
        match encoding {
            Encoding::Identity => Ok(None),
            Encoding::Gzip => Ok(Some(Self::Gzip(gzip_encoder(Vec::new(), jitter)))),
            Encoding::Zstd => {
                let encoder = zstd::stream::write::Encoder::new(Vec::new(), ZSTD_LEVEL)
                    .context("failed to create zstd encoder")?;
                Ok(Some(Self::Zstd(encoder)))
            }
        }
    }

    pub fn write(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Gzip(encoder) => {
                encoder.write_all(chunk)?;
                encoder.flush()?;
                Ok(std::mem::take(encoder.get_mut()))
            }
            Self::Zstd(encoder) => {
                encoder.write_all(chunk)?;
                encoder.flush()?;
                Ok(std::mem::take(encoder.get_mut()))
            }
        }
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        match self {
            Self::Gzip(encoder) => encoder.finish().context("failed to finish gzip stream"),
            Self::Zstd(encoder) => encoder.finish().context("failed to finish zstd stream"),
        }
    }
}

/// Gzip writer, optionally with a random-length comment field (FCOMMENT) so
/// the compressed length does not leak plaintext sizes (BREACH).
fn gzip_encoder(sink: Vec<u8>, jitter: u32) -> GzEncoder<Vec<u8>> {
    if jitter == 0 {
        return GzEncoder::new(sink, Compression::new(GZIP_LEVEL));
    }

    let mut rng = rand::thread_rng();
    let len = rng.gen_range(0..=jitter) as usize;
    let comment: Vec<u8> = (0..len).map(|_| rng.gen_range(b'a'..=b'z')).collect();
    GzBuilder::new()
        .comment(comment)
        .write(sink, Compression::new(GZIP_LEVEL))
}
