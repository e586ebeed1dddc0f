use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{HeaderMap, StatusCode, header};
use tokio::io::{AsyncRead, BufReader};
use tracing::warn;

use super::{MAX_HEADER_BYTES, read_crlf_line};

#[derive(Debug)]
pub struct Http1ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub connection_close: bool,
}

/// Reads and validates the upstream's HTTP/1.1 response head.
pub async fn read_http1_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
) -> Result<Http1ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut status_line = String::new();
    let bytes = read_crlf_line(
        reader,
        &mut status_line,
        timeout_dur,
        peer,
        MAX_HEADER_BYTES,
    )
    .await?;
    if bytes == 0 {
        bail!("upstream hung up before the status line");
    }
    let mut total_bytes = bytes;
    let status = decode_status_line(&status_line)?;

    let mut headers = HeaderMap::new();
    let mut content_length = None;
    let mut content_length_seen = false;
    let mut chunked = false;
    let mut transfer_encoding_present = false;
    let mut connection_close = false;

    let mut header_line = String::new();
    loop {
        let remaining = MAX_HEADER_BYTES
            .checked_sub(total_bytes)
            .filter(|remaining| *remaining > 0)
            .ok_or_else(|| anyhow!("upstream response head is larger than {MAX_HEADER_BYTES} bytes"))?;
        let read = read_crlf_line(reader, &mut header_line, timeout_dur, peer, remaining).await?;
        if read == 0 {
            bail!("upstream hung up inside the header block");
        }
        total_bytes += read;

        if header_line.is_empty() {
            break;
        }
        let (name, value) = header_line
            .split_once(':')
            .ok_or_else(|| anyhow!("upstream header line has no ':'"))?;
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            if content_length_seen {
                bail!("upstream sent more than one Content-Length header");
            }
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("Content-Length '{value}' from upstream is not a number"))?;
            content_length = Some(parsed);
            content_length_seen = true;
        }
        if name.eq_ignore_ascii_case("transfer-encoding") {
            transfer_encoding_present = true;
            if value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
        }
        if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("close") {
                    connection_close = true;
                }
            }
        }

        let name = header::HeaderName::try_from(name)
            .map_err(|_| anyhow!("malformed upstream header name '{name}'"))?;
        let value = http::HeaderValue::from_str(value)
            .map_err(|_| anyhow!("malformed upstream value for header '{name}'"))?;
        headers.append(name, value);
    }

    if transfer_encoding_present && content_length_seen {
        warn!(
            peer = %peer,
            "upstream sent both Content-Length and Transfer-Encoding; refusing to guess the framing"
        );
        bail!("upstream declared both Content-Length and Transfer-Encoding");
    }

    Ok(Http1ResponseHead {
        status,
        headers,
        content_length,
        chunked,
        connection_close,
    })
}

/// Pulls the status code out of a `HTTP/1.1 <code> <reason>` line; anything
/// that is not plainly HTTP/1.1 is rejected rather than guessed at.
fn decode_status_line(line: &str) -> Result<StatusCode> {
    let Some(rest) = line.strip_prefix("HTTP/1.1 ") else {
        bail!("upstream spoke something other than HTTP/1.1: '{line}'");
    };
    let code = rest.split(' ').next().unwrap_or("");
    ensure!(!code.is_empty(), "status line '{line}' has no status code");
    let numeric: u16 = code
        .parse()
        .with_context(|| format!("status code '{code}' is not a number"))?;
    StatusCode::from_u16(numeric)
        .with_context(|| format!("status code '{numeric}' is out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn peer() -> SocketAddr {
        "127.0.0.1:3000".parse().unwrap()
    }

    async fn parse(raw: &[u8]) -> Result<Http1ResponseHead> {
        let mut reader = BufReader::new(raw);
        read_http1_response_head(&mut reader, Duration::from_secs(1), peer()).await
    }

    #[tokio::test]
    async fn parses_fixed_length_response() {
        let head = parse(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.content_length, Some(5));
        assert!(!head.chunked);
        assert_eq!(
            head.headers.get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
    }

    #[tokio::test]
    async fn parses_chunked_response() {
        let head = parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
            .await
            .unwrap();
        assert!(head.chunked);
        assert_eq!(head.content_length, None);
    }

    #[tokio::test]
    async fn detects_connection_close() {
        let head = parse(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        assert!(head.connection_close);
    }

    #[tokio::test]
    async fn rejects_status_line_garbage() {
        assert!(parse(b"BAD 200 OK\r\n\r\n").await.is_err());
        assert!(parse(b"HTTP/1.1 twohundred OK\r\n\r\n").await.is_err());
        assert!(parse(b"HTTP/1.1\r\n\r\n").await.is_err());
        assert!(parse(b"HTTP/1.0 200 OK\r\n\r\n").await.is_err());
    }

    #[tokio::test]
    async fn rejects_conflicting_framing() {
        let err = parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\n")
            .await
            .unwrap_err();
        assert!(
            err.to_string()
                .contains("both Content-Length and Transfer-Encoding")
        );
    }

    #[tokio::test]
    async fn rejects_duplicate_content_length() {
        let err = parse(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Length: 5\r\n\r\n")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("more than one Content-Length"));
    }

    #[tokio::test]
    async fn decode_status_line_accepts_a_plain_line() {
        let status = decode_status_line("HTTP/1.1 404 Not Found").unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn decode_status_line_accepts_a_bare_code() {
        let status = decode_status_line("HTTP/1.1 200").unwrap();
        assert_eq!(status, StatusCode::OK);
    }
}
