mod request;
mod response;

pub use request::{Http1RequestHead, read_http1_request_head};
pub use response::{Http1ResponseHead, read_http1_response_head};

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail, ensure};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::util::timeout_with_context;

pub(crate) const MAX_HEADER_BYTES: usize = 32 * 1024;
pub(crate) const CHUNK_SIZE_LINE_LIMIT: usize = 8192;

/// Reads one header-style line into `buf` with the CR/LF terminator already
/// stripped. The returned count is what was consumed off the wire
/// (terminator included), which is the number header-size budgets care
/// about; 0 means the stream ended cleanly before any data arrived.
pub(crate) async fn read_crlf_line<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line limit must be positive");
    buf.clear();
    let mut raw = Vec::new();
    let mut consumed = 0usize;

    loop {
        let window = timeout_with_context(
            timeout_dur,
            reader.fill_buf(),
            format!("reading a line from {peer}"),
        )
        .await?;

        if window.is_empty() {
            if consumed == 0 {
                return Ok(0);
            }
            bail!("{peer} hung up in the middle of a line");
        }

        let (take, complete) = match window.iter().position(|&byte| byte == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (window.len(), false),
        };
        if consumed + take > max_len {
            bail!("line from {peer} is over the {max_len}-byte limit");
        }

        raw.extend_from_slice(&window[..take]);
        reader.consume(take);
        consumed += take;
        if complete {
            break;
        }
    }

    while raw.last().is_some_and(|byte| *byte == b'\r' || *byte == b'\n') {
        raw.pop();
    }
    let line =
        std::str::from_utf8(&raw).map_err(|_| anyhow!("line from {peer} is not valid UTF-8"))?;
    buf.push_str(line);
    Ok(consumed)
}
