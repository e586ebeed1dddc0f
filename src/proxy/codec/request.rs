use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{HeaderMap, Method, header};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::timeout;
use tracing::debug;

use super::{MAX_HEADER_BYTES, read_crlf_line};

#[derive(Debug)]
pub struct Http1RequestHead {
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub expect_continue: bool,
    pub connection_close: bool,
}

impl Http1RequestHead {
    pub fn host(&self) -> &str {
        self.headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
    }
}

/// Reads one HTTP/1.1 request head from a keep-alive connection. Returns
/// `None` when the client closes (or goes idle past the keep-alive timeout)
/// between requests.
pub async fn read_http1_request_head<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    idle_timeout: Duration,
    header_timeout: Duration,
) -> Result<Option<Http1RequestHead>>
where
    S: AsyncRead + Unpin,
{
    // The keep-alive idle wait ends at the first byte; from there the
    // header timeout governs.
    let available = match timeout(idle_timeout, reader.fill_buf()).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(err)) => {
            return Err(err).with_context(|| format!("idling for the next request from {peer}"));
        }
        Err(_) => return Ok(None),
    };
    if available.is_empty() {
        return Ok(None);
    }

    let mut request_line = String::new();
    let first = read_crlf_line(
        reader,
        &mut request_line,
        header_timeout,
        peer,
        MAX_HEADER_BYTES,
    )
    .await?;
    if first == 0 {
        debug!(peer = %peer, "client went away before sending a request");
        return Ok(None);
    }

    // Strictly "METHOD SP TARGET SP VERSION"; anything else is garbage.
    let (method_token, rest) = request_line
        .split_once(' ')
        .ok_or_else(|| anyhow!("request line has no target"))?;
    let (target_token, version_token) = rest
        .split_once(' ')
        .ok_or_else(|| anyhow!("request line has no HTTP version"))?;
    if version_token.contains(' ') {
        bail!("request line has trailing garbage after the version");
    }
    match version_token {
        "HTTP/1.1" => {}
        "HTTP/1.0" => bail!("HTTP/1.0 clients are not supported"),
        other => bail!("unrecognized protocol version '{other}'"),
    }
    let method = Method::from_bytes(method_token.as_bytes())
        .with_context(|| format!("unrecognized method '{method_token}'"))?;
    ensure!(!target_token.is_empty(), "request line has an empty target");
    let target = target_token.to_string();

    let mut headers = HeaderMap::new();
    let mut total_bytes = first;
    let mut header_line = String::new();
    loop {
        let remaining = MAX_HEADER_BYTES
            .checked_sub(total_bytes)
            .filter(|remaining| *remaining > 0)
            .ok_or_else(|| anyhow!("request head is larger than {MAX_HEADER_BYTES} bytes"))?;
        let read =
            read_crlf_line(reader, &mut header_line, header_timeout, peer, remaining).await?;
        if read == 0 {
            bail!("{peer} hung up inside the request headers");
        }
        total_bytes += read;

        if header_line.is_empty() {
            break;
        }
        let (name, value) = header_line
            .split_once(':')
            .ok_or_else(|| anyhow!("header line has no ':'"))?;
        let name = header::HeaderName::try_from(name.trim())
            .map_err(|_| anyhow!("malformed header name '{}'", name.trim()))?;
        let value = http::HeaderValue::from_str(value.trim())
            .map_err(|_| anyhow!("malformed value for header '{name}'"))?;
        headers.append(name, value);
    }

    let content_length = parse_content_length(&headers)?;
    let chunked = is_chunked(&headers);
    if chunked && content_length.is_some() {
        bail!("request declares both Transfer-Encoding and Content-Length");
    }

    Ok(Some(Http1RequestHead {
        method,
        target,
        expect_continue: expect_continue(&headers)?,
        connection_close: wants_close(&headers),
        content_length,
        chunked,
        headers,
    }))
}

fn parse_content_length(headers: &HeaderMap) -> Result<Option<u64>> {
    let mut values = headers.get_all(header::CONTENT_LENGTH).iter();
    let Some(first) = values.next() else {
        return Ok(None);
    };
    if values.next().is_some() {
        bail!("request carries more than one Content-Length header");
    }
    let text = first
        .to_str()
        .map_err(|_| anyhow!("Content-Length is not readable text"))?;
    let length = text
        .parse::<u64>()
        .with_context(|| format!("Content-Length '{text}' is not a number"))?;
    Ok(Some(length))
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers.get_all(header::TRANSFER_ENCODING).iter().any(|value| {
        value
            .to_str()
            .map(|list| {
                list.split(',')
                    .any(|item| item.trim().eq_ignore_ascii_case("chunked"))
            })
            .unwrap_or(false)
    })
}

fn wants_close(headers: &HeaderMap) -> bool {
    headers.get_all(header::CONNECTION).iter().any(|value| {
        value
            .to_str()
            .map(|list| {
                list.split(',')
                    .any(|item| item.trim().eq_ignore_ascii_case("close"))
            })
            .unwrap_or(false)
    })
}

fn expect_continue(headers: &HeaderMap) -> Result<bool> {
    let mut seen = false;
    for value in headers.get_all(header::EXPECT) {
        let text = value
            .to_str()
            .map_err(|_| anyhow!("Expect header is not readable text"))?;
        if !text.eq_ignore_ascii_case("100-continue") {
            bail!("Expect '{text}' is not supported (only 100-continue)");
        }
        if seen {
            bail!("request carries more than one Expect header");
        }
        seen = true;
    }
    Ok(seen)
}
