use std::time::Duration;

use anyhow::Result;
use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWrite};

use super::body::{ChunkedBodyReader, write_chunk, write_last_chunk};
use super::forward::ResponseBodyPlan;
use super::sendfile::FileBody;
use super::upstream::UpstreamConnection;
use crate::cache::CaptureBuffer;
use crate::compress::{
    self, CompressionConfig, Encoding, MIN_COMPRESS_SIZE, StreamingEncoder,
};
use crate::util::write_all_with_timeout;

const COPY_BUFFER_SIZE: usize = 8192;

pub enum OutboundBody {
    /// No body bytes on the wire; `declared_length` still surfaces in the
    /// Content-Length header (HEAD responses).
    Empty { declared_length: Option<u64> },
    Full(Vec<u8>),
    Upstream {
        conn: UpstreamConnection,
        plan: ResponseBodyPlan,
    },
    File(FileBody),
}

pub struct OutboundResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: OutboundBody,
}

pub struct Transforms {
    pub compression: CompressionConfig,
    pub negotiated: Encoding,
    pub capture: Option<CaptureBuffer>,
}

pub struct WriteOutcome {
    /// Body bytes that went to the client (after encoding).
    pub bytes_written: u64,
    /// The upstream connection, if the body came from one, and whether it
    /// was fully drained and may be reused.
    pub upstream: Option<(UpstreamConnection, bool)>,
    pub capture: Option<CaptureBuffer>,
}

/// Writes a response to the client, applying the outbound transforms: the
/// capture sees the raw (upstream-side) bytes, the encoder sits between the
/// capture and the socket.
pub async fn write_response<W>(
    client: &mut W,
    response: OutboundResponse,
    mut transforms: Transforms,
    is_head: bool,
    close_connection: bool,
    read_timeout: Duration,
    write_timeout: Duration,
) -> Result<WriteOutcome>
where
    W: AsyncWrite + Unpin,
{
    let OutboundResponse {
        status,
        mut headers,
        body,
    } = response;

    let known_length = match &body {
        OutboundBody::Empty { .. } => None,
        OutboundBody::Full(bytes) => Some(bytes.len() as u64),
        OutboundBody::Upstream { plan, .. } => match plan {
            ResponseBodyPlan::Empty => Some(0),
            ResponseBodyPlan::Fixed(length) => Some(*length),
            ResponseBodyPlan::Chunked | ResponseBodyPlan::UntilClose => None,
        },
        OutboundBody::File(file) => Some(file.length),
    };

    let encoding = match &body {
        OutboundBody::Empty { .. } => Encoding::Identity,
        _ => compress::plan(
            &transforms.compression,
            transforms.negotiated,
            &mut headers,
            known_length,
        ),
    };
    let jitter = transforms.compression.jitter;

    let mut bytes_written = 0u64;
    let mut upstream = None;

    match body {
        OutboundBody::Empty { declared_length } => {
            let framing = if suppresses_content_length(status) {
                Framing::None
            } else {
                Framing::ContentLength(declared_length.unwrap_or(0))
            };
            write_head(client, status, &headers, framing, close_connection, write_timeout).await?;
        }

        OutboundBody::Full(raw) => {
            if let Some(capture) = transforms.capture.as_mut() {
                capture.record(&raw);
            }
            let encoded = match encoding {
                Encoding::Identity => raw,
                other => {
                    set_content_encoding(&mut headers, other);
                    compress::compress_full(other, &raw, jitter)?
                }
            };
            write_head(
                client,
                status,
                &headers,
                Framing::ContentLength(encoded.len() as u64),
                close_connection,
                write_timeout,
            )
            .await?;
            if !is_head {
                write_all_with_timeout(client, &encoded, write_timeout, "writing response body")
                    .await?;
                bytes_written = encoded.len() as u64;
            }
        }

        OutboundBody::Upstream { mut conn, plan } => {
            let identity_length = match plan {
                ResponseBodyPlan::Empty => Some(0),
                ResponseBodyPlan::Fixed(length) => Some(length),
                _ => None,
            };
            let mut reader = UpstreamBodyReader::new(plan);
            let outcome = write_streamed_body(
                client,
                status,
                &mut headers,
                &mut reader,
                &mut conn,
                encoding,
                jitter,
                identity_length,
                transforms.capture.as_mut(),
                is_head,
                close_connection,
                read_timeout,
                write_timeout,
            )
            .await?;
            bytes_written = outcome;
            upstream = Some((conn, reader.drained()));
        }

        OutboundBody::File(file) => {
            let identity_length = Some(file.length);
            let mut reader = FileBodyReader::new(file);
            let mut no_conn = NoUpstream;
            bytes_written = write_streamed_body(
                client,
                status,
                &mut headers,
                &mut reader,
                &mut no_conn,
                encoding,
                jitter,
                identity_length,
                transforms.capture.as_mut(),
                is_head,
                close_connection,
                read_timeout,
                write_timeout,
            )
            .await?;
        }
    }

    Ok(WriteOutcome {
        bytes_written,
        upstream,
        capture: transforms.capture,
    })
}

/// Writes a locally-generated response (errors, redirects, challenges).
pub async fn write_simple_response<W>(
    client: &mut W,
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
    close_connection: bool,
    write_timeout: Duration,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    write_head(
        client,
        status,
        headers,
        Framing::ContentLength(body.len() as u64),
        close_connection,
        write_timeout,
    )
    .await?;
    if !body.is_empty() {
        write_all_with_timeout(client, body, write_timeout, "writing response body").await?;
    }
    Ok(body.len() as u64)
}

enum Framing {
    ContentLength(u64),
    Chunked,
    None,
}

fn suppresses_content_length(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

fn set_content_encoding(headers: &mut HeaderMap, encoding: Encoding) {
    if let Some(name) = encoding.content_encoding() {
        headers.insert(http::header::CONTENT_ENCODING, name.parse().expect("static value"));
    }
}

async fn write_head<W>(
    client: &mut W,
    status: StatusCode,
    headers: &HeaderMap,
    framing: Framing,
    close_connection: bool,
    write_timeout: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(b"HTTP/1.1 ");
    buffer.extend_from_slice(status.as_str().as_bytes());
    buffer.extend_from_slice(b" ");
    buffer.extend_from_slice(status.canonical_reason().unwrap_or("").as_bytes());
    buffer.extend_from_slice(b"\r\n");

    for (name, value) in headers.iter() {
        buffer.extend_from_slice(name.as_str().as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    match framing {
        Framing::ContentLength(length) => {
            buffer.extend_from_slice(format!("Content-Length: {length}\r\n").as_bytes());
        }
        Framing::Chunked => {
            buffer.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
        Framing::None => {}
    }

    if close_connection {
        buffer.extend_from_slice(b"Connection: close\r\n");
    }
    buffer.extend_from_slice(b"\r\n");

    write_all_with_timeout(client, &buffer, write_timeout, "writing response head").await
}

/// Abstracts "the next raw body chunk" over upstream sockets and files so
/// one streaming loop serves both.
trait BodySource<C> {
    async fn next(
        &mut self,
        conn: &mut C,
        buffer: &mut [u8],
        read_timeout: Duration,
    ) -> Result<Option<usize>>;
}

struct UpstreamBodyReader {
    plan: ResponseBodyPlan,
    remaining: u64,
    chunked: ChunkedBodyReader,
    drained: bool,
}

impl UpstreamBodyReader {
    fn new(plan: ResponseBodyPlan) -> Self {
        let remaining = match plan {
            ResponseBodyPlan::Fixed(length) => length,
            _ => 0,
        };
        Self {
            plan,
            remaining,
            chunked: ChunkedBodyReader::new(),
            drained: matches!(plan, ResponseBodyPlan::Empty | ResponseBodyPlan::Fixed(0)),
        }
    }

    fn drained(&self) -> bool {
        self.drained
    }
}

impl BodySource<UpstreamConnection> for UpstreamBodyReader {
    async fn next(
        &mut self,
        conn: &mut UpstreamConnection,
        buffer: &mut [u8],
        read_timeout: Duration,
    ) -> Result<Option<usize>> {
        let peer = conn
            .get_ref()
            .peer_addr()
            .unwrap_or_else(|_| "127.0.0.1:0".parse().expect("static addr"));
        match self.plan {
            ResponseBodyPlan::Empty => Ok(None),
            ResponseBodyPlan::Fixed(_) => {
                if self.remaining == 0 {
                    self.drained = true;
                    return Ok(None);
                }
                let to_read = self.remaining.min(buffer.len() as u64) as usize;
                let read = crate::util::timeout_with_context(
                    read_timeout,
                    conn.read(&mut buffer[..to_read]),
                    "reading response body from upstream",
                )
                .await?;
                if read == 0 {
                    anyhow::bail!("upstream hung up before finishing the response body");
                }
                self.remaining -= read as u64;
                if self.remaining == 0 {
                    self.drained = true;
                }
                Ok(Some(read))
            }
            ResponseBodyPlan::Chunked => {
                let next = self.chunked.next(conn, buffer, read_timeout, peer).await?;
                if next.is_none() {
                    self.drained = true;
                }
                Ok(next)
            }
            ResponseBodyPlan::UntilClose => {
                let read = crate::util::timeout_with_context(
                    read_timeout,
                    conn.read(buffer),
                    "reading response body from upstream",
                )
                .await?;
                if read == 0 { Ok(None) } else { Ok(Some(read)) }
            }
        }
    }
}

struct NoUpstream;

struct FileBodyReader {
    file: tokio::fs::File,
    remaining: u64,
}

impl FileBodyReader {
    fn new(body: FileBody) -> Self {
        Self {
            file: body.file,
            remaining: body.length,
        }
    }
}

impl BodySource<NoUpstream> for FileBodyReader {
    async fn next(
        &mut self,
        _conn: &mut NoUpstream,
        buffer: &mut [u8],
        read_timeout: Duration,
    ) -> Result<Option<usize>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let to_read = self.remaining.min(buffer.len() as u64) as usize;
        let read = crate::util::timeout_with_context(
            read_timeout,
            self.file.read(&mut buffer[..to_read]),
            "reading file body",
        )
        .await?;
        if read == 0 {
            anyhow::bail!("file shrank while being served");
        }
        self.remaining -= read as u64;
        Ok(Some(read))
    }
}

/// The streaming write loop. Known-length identity bodies go out with
/// Content-Length; everything else is re-framed as chunked. Compression of
/// unknown-length bodies buffers up to the minimum size first, so tiny
/// responses skip the encoder entirely.
#[allow(clippy::too_many_arguments)]
async fn write_streamed_body<W, C, B>(
    client: &mut W,
    status: StatusCode,
    headers: &mut HeaderMap,
    body: &mut B,
    conn: &mut C,
    encoding: Encoding,
    jitter: u32,
    identity_length: Option<u64>,
    mut capture: Option<&mut CaptureBuffer>,
    is_head: bool,
    close_connection: bool,
    read_timeout: Duration,
    write_timeout: Duration,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
    B: BodySource<C>,
{
    let mut buffer = [0u8; COPY_BUFFER_SIZE];

    // Peek phase: what is known up front decides the framing.
    let mut prefix: Vec<u8> = Vec::new();
    let mut ended = false;

    if encoding != Encoding::Identity {
        while prefix.len() as u64 <= MIN_COMPRESS_SIZE {
            match body.next(conn, &mut buffer, read_timeout).await? {
                Some(read) => prefix.extend_from_slice(&buffer[..read]),
                None => {
                    ended = true;
                    break;
                }
            }
        }
    }

    if encoding != Encoding::Identity && ended && (prefix.len() as u64) < MIN_COMPRESS_SIZE {
        // The whole body arrived under the threshold: send it plain.
        if let Some(capture) = capture.as_deref_mut() {
            capture.record(&prefix);
        }
        write_head(
            client,
            status,
            headers,
            Framing::ContentLength(prefix.len() as u64),
            close_connection,
            write_timeout,
        )
        .await?;
        if is_head {
            return Ok(0);
        }
        write_all_with_timeout(client, &prefix, write_timeout, "writing response body").await?;
        return Ok(prefix.len() as u64);
    }

    let mut encoder = StreamingEncoder::new(encoding, jitter)?;
    let framing = match (&encoder, identity_length) {
        (None, Some(length)) => Framing::ContentLength(length),
        _ => Framing::Chunked,
    };
    if encoder.is_some() {
        set_content_encoding(headers, encoding);
    }
    let chunked = matches!(framing, Framing::Chunked);
    write_head(client, status, headers, framing, close_connection, write_timeout).await?;

    let mut bytes_written = 0u64;

    if !prefix.is_empty() {
        if let Some(capture) = capture.as_deref_mut() {
            capture.record(&prefix);
        }
        match encoder.as_mut() {
            Some(encoder) => {
                let out = encoder.write(&prefix)?;
                emit(client, &out, chunked, is_head, write_timeout, &mut bytes_written).await?;
            }
            None => {
                emit(client, &prefix, chunked, is_head, write_timeout, &mut bytes_written).await?;
            }
        }
    }

    if !ended {
        while let Some(read) = body.next(conn, &mut buffer, read_timeout).await? {
            let raw = &buffer[..read];
            if let Some(capture) = capture.as_deref_mut() {
                capture.record(raw);
            }
            match encoder.as_mut() {
                Some(encoder) => {
                    let out = encoder.write(raw)?;
                    emit(client, &out, chunked, is_head, write_timeout, &mut bytes_written)
                        .await?;
                }
                None => {
                    emit(client, raw, chunked, is_head, write_timeout, &mut bytes_written).await?;
                }
            }
        }
    }

    if let Some(encoder) = encoder {
        let tail = encoder.finish()?;
        emit(client, &tail, chunked, is_head, write_timeout, &mut bytes_written).await?;
    }
    if chunked && !is_head {
        write_last_chunk(client, write_timeout).await?;
    }

    Ok(bytes_written)
}

async fn emit<W>(
    client: &mut W,
    data: &[u8],
    chunked: bool,
    is_head: bool,
    write_timeout: Duration,
    bytes_written: &mut u64,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if data.is_empty() || is_head {
        return Ok(());
    }
    if chunked {
        write_chunk(client, data, write_timeout).await?;
    } else {
        write_all_with_timeout(client, data, write_timeout, "writing response body").await?;
    }
    *bytes_written += data.len() as u64;
    Ok(())
}
