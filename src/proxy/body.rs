use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};

use super::codec::{CHUNK_SIZE_LINE_LIMIT, read_crlf_line};
use crate::util::{timeout_with_context, write_all_with_timeout};

const COPY_BUFFER_SIZE: usize = 8192;

/// Sentinel recognized by the error-rendering layer: the request body blew
/// past `MAX_REQUEST_BODY`, so the client gets a 413 instead of a 502.
#[derive(Debug, Error)]
#[error("request body is larger than the configured limit")]
pub struct BodyTooLarge;

/// How a message body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
}

impl BodyPlan {
    pub fn for_request(content_length: Option<u64>, chunked: bool) -> Self {
        if chunked {
            BodyPlan::Chunked
        } else {
            match content_length {
                Some(0) | None => BodyPlan::Empty,
                Some(length) => BodyPlan::Fixed(length),
            }
        }
    }
}

/// Running total against the configured request-body cap (0 = unlimited).
#[derive(Debug, Clone, Copy)]
pub struct BodySizeTracker {
    limit: u64,
    seen: u64,
}

impl BodySizeTracker {
    pub fn new(limit: u64) -> Self {
        Self { limit, seen: 0 }
    }

    pub fn record(&mut self, bytes: u64) -> Result<(), BodyTooLarge> {
        self.seen = self.seen.saturating_add(bytes);
        if self.limit > 0 && self.seen > self.limit {
            return Err(BodyTooLarge);
        }
        Ok(())
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }
}

/// Streams the client's request body to the upstream, enforcing the size cap.
/// Returns the number of body bytes transferred.
pub async fn stream_request_body<S, U>(
    reader: &mut BufReader<S>,
    upstream: &mut U,
    plan: BodyPlan,
    tracker: &mut BodySizeTracker,
    read_timeout: Duration,
    write_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
    U: AsyncWrite + Unpin,
{
    match plan {
        BodyPlan::Empty => Ok(0),
        BodyPlan::Fixed(length) => {
            tracker.record(length)?;
            let mut remaining = length;
            let mut buffer = [0u8; COPY_BUFFER_SIZE];
            while remaining > 0 {
                let to_read = remaining.min(buffer.len() as u64) as usize;
                let read = timeout_with_context(
                    read_timeout,
                    reader.read(&mut buffer[..to_read]),
                    format!("copying the request body from {peer}"),
                )
                .await?;
                if read == 0 {
                    bail!("{peer} hung up mid-request-body");
                }
                remaining -= read as u64;
                write_all_with_timeout(
                    upstream,
                    &buffer[..read],
                    write_timeout,
                    "relaying the request body upstream",
                )
                .await?;
            }
            Ok(length)
        }
        BodyPlan::Chunked => {
            let mut transferred = 0u64;
            let mut body = ChunkedBodyReader::new();
            let mut buffer = [0u8; COPY_BUFFER_SIZE];
            while let Some(read) = body.next(reader, &mut buffer, read_timeout, peer).await? {
                tracker.record(read as u64)?;
                transferred += read as u64;
                write_chunk(upstream, &buffer[..read], write_timeout).await?;
            }
            write_last_chunk(upstream, write_timeout).await?;
            Ok(transferred)
        }
    }
}

/// Reads and discards the client's request body (hits and locally-rendered
/// responses still need the connection re-synchronized for keep-alive).
pub async fn drain_request_body<S>(
    reader: &mut BufReader<S>,
    plan: BodyPlan,
    tracker: &mut BodySizeTracker,
    read_timeout: Duration,
    peer: SocketAddr,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
{
    let mut sink = tokio::io::sink();
    stream_request_body(
        reader,
        &mut sink,
        plan,
        tracker,
        read_timeout,
        read_timeout,
        peer,
    )
    .await
}

pub async fn write_chunk<W>(writer: &mut W, data: &[u8], write_timeout: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.is_empty() {
        return Ok(());
    }
    let framing = format!("{:x}\r\n", data.len());
    write_all_with_timeout(writer, framing.as_bytes(), write_timeout, "writing chunk size").await?;
    write_all_with_timeout(writer, data, write_timeout, "writing chunk data").await?;
    write_all_with_timeout(writer, b"\r\n", write_timeout, "writing chunk terminator").await
}

pub async fn write_last_chunk<W>(writer: &mut W, write_timeout: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_all_with_timeout(writer, b"0\r\n\r\n", write_timeout, "writing final chunk").await
}

/// Incremental reader over a chunked-encoded body; decodes the framing and
/// yields raw data so the caller can transform bytes before re-framing them.
pub struct ChunkedBodyReader {
    remaining_in_chunk: u64,
    done: bool,
}

impl ChunkedBodyReader {
    pub fn new() -> Self {
        Self {
            remaining_in_chunk: 0,
            done: false,
        }
    }

    /// Fills `buffer` with the next piece of body data, returning `None`
    /// once the terminal chunk (and any trailers) have been consumed.
    pub async fn next<S>(
        &mut self,
        reader: &mut BufReader<S>,
        buffer: &mut [u8],
        read_timeout: Duration,
        peer: SocketAddr,
    ) -> Result<Option<usize>>
    where
        S: AsyncRead + Unpin,
    {
        if self.done {
            return Ok(None);
        }

        if self.remaining_in_chunk == 0 {
            let mut line = String::new();
            let read =
                read_crlf_line(reader, &mut line, read_timeout, peer, CHUNK_SIZE_LINE_LIMIT)
                    .await?;
            if read == 0 {
                bail!("{peer} ended the stream before a chunk size arrived");
            }
            // Chunk extensions (anything past ';') are tolerated and ignored.
            let digits = line.split(';').next().unwrap_or_default().trim();
            let chunk_size = u64::from_str_radix(digits, 16)
                .with_context(|| format!("chunk size '{digits}' is not hexadecimal"))?;

            if chunk_size == 0 {
                self.consume_trailers(reader, read_timeout, peer).await?;
                self.done = true;
                return Ok(None);
            }
            self.remaining_in_chunk = chunk_size;
        }

        let to_read = self.remaining_in_chunk.min(buffer.len() as u64) as usize;
        let read = timeout_with_context(
            read_timeout,
            reader.read(&mut buffer[..to_read]),
            format!("reading chunk bytes from {peer}"),
        )
        .await?;
        if read == 0 {
            bail!("{peer} ended the stream mid-chunk");
        }
        self.remaining_in_chunk -= read as u64;

        if self.remaining_in_chunk == 0 {
            let mut terminator = [0u8; 2];
            timeout_with_context(
                read_timeout,
                reader.read_exact(&mut terminator),
                format!("reading the chunk terminator from {peer}"),
            )
            .await?;
            if terminator != *b"\r\n" {
                bail!("chunk from {peer} is missing its CRLF terminator");
            }
        }

        Ok(Some(read))
    }

    async fn consume_trailers<S>(
        &mut self,
        reader: &mut BufReader<S>,
        read_timeout: Duration,
        peer: SocketAddr,
    ) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        let mut line = String::new();
        loop {
            let read =
                read_crlf_line(reader, &mut line, read_timeout, peer, CHUNK_SIZE_LINE_LIMIT)
                    .await?;
            if read == 0 {
                bail!("{peer} ended the stream inside the chunk trailers");
            }
            if line.is_empty() {
                return Ok(());
            }
        }
    }
}
