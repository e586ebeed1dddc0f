use std::net::SocketAddr;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use h2::server::SendResponse;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, header};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::cache::stage::{self, CacheLookup, CacheMiss};
use crate::cache::CaptureBuffer;
use crate::compress::{self, Encoding, StreamingEncoder};
use crate::logging::{RequestLogEvent, log_request};
use crate::util::write_all_with_timeout;

use super::body::{BodySizeTracker, BodyTooLarge, ChunkedBodyReader, write_chunk, write_last_chunk};
use super::codec::read_http1_response_head;
use super::forward::ResponseBodyPlan;
use super::headers::{
    X_CACHE, advertise_sendfile, apply_forward_policy, encode_upstream_request_head,
    sanitize_response_headers, stamp_request_start,
};
use super::body::BodyPlan;
use super::request::Scheme;
use super::sendfile::{self, FileBody, SendfileAction};
use super::upstream::{UpstreamConnection, UpstreamPool};
use super::{ACTIVE_STORAGE_PREFIX, AppContext};

/// Serves one HTTP/2 connection (TLS-negotiated or cleartext
/// prior-knowledge). Streams are handled concurrently, each with its own
/// upstream connection.
pub async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    scheme: Scheme,
    app: AppContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut connection = h2::server::handshake(stream)
        .await
        .context("HTTP/2 handshake failed")?;

    while let Some(accepted) = connection.accept().await {
        let (request, respond) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                debug!(peer = %peer, error = %err, "HTTP/2 stream error");
                break;
            }
        };
        let app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_stream(request, respond, peer, scheme, app).await {
                debug!(peer = %peer, error = %err, "HTTP/2 request failed");
            }
        });
    }

    Ok(())
}

struct StreamRequest {
    method: Method,
    target: String,
    path: String,
    query: String,
    host: String,
    headers: HeaderMap,
    peer: SocketAddr,
    scheme: Scheme,
}

impl StreamRequest {
    fn from_parts(parts: &http::request::Parts, peer: SocketAddr, scheme: Scheme) -> Result<Self> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (path_and_query.clone(), String::new()),
        };
        let host = parts
            .uri
            .authority()
            .map(|authority| authority.to_string())
            .or_else(|| {
                parts
                    .headers
                    .get(header::HOST)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();

        Ok(Self {
            method: parts.method.clone(),
            target: path_and_query,
            path,
            query,
            host,
            headers: parts.headers.clone(),
            peer,
            scheme,
        })
    }

    fn remote_addr(&self) -> String {
        self.headers
            .get(super::headers::X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
            .filter(|chain| !chain.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.peer.to_string())
    }

    fn header_str(&self, name: header::HeaderName) -> String {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string()
    }
}

async fn handle_stream(
    request: Request<h2::RecvStream>,
    mut respond: SendResponse<Bytes>,
    peer: SocketAddr,
    scheme: Scheme,
    app: AppContext,
) -> Result<()> {
    let started = Instant::now();
    let (parts, mut body) = request.into_parts();
    let mut request = StreamRequest::from_parts(&parts, peer, scheme)?;

    if !app.settings.active_storage_secret.is_empty()
        && request.path.starts_with(ACTIVE_STORAGE_PREFIX)
    {
        info!(path = %request.path, "intercepted Active Storage representation request");
        return send_full(
            &app,
            &request,
            &mut respond,
            StatusCode::NOT_IMPLEMENTED,
            plain_text_headers(),
            Bytes::from_static(b"image representation processing is not implemented\n"),
            "",
            started,
        );
    }

    stamp_request_start(&mut request.headers);
    let negotiated = compress::negotiate(&request.headers);

    let lookup = stage::lookup(
        &app.cache,
        &request.method,
        &request.path,
        &request.query,
        &request.host,
        &request.headers,
    );

    match lookup {
        CacheLookup::Hit(stored) => {
            let mut headers = stored.headers.clone();
            compress::apply_guard(&app.compression, &request.headers, &mut headers);
            headers.insert(X_CACHE, HeaderValue::from_static("hit"));
            send_buffered(
                &app,
                &request,
                &mut respond,
                stored.status,
                headers,
                stored.body,
                negotiated,
                "hit",
                started,
            )
        }
        CacheLookup::Miss(miss) => {
            proxy_stream(
                &app, request, &mut body, &mut respond, Some(miss), negotiated, started,
            )
            .await
        }
        CacheLookup::Bypass => {
            proxy_stream(&app, request, &mut body, &mut respond, None, negotiated, started).await
        }
    }
}

async fn proxy_stream(
    app: &AppContext,
    mut request: StreamRequest,
    body: &mut h2::RecvStream,
    respond: &mut SendResponse<Bytes>,
    cache_miss: Option<CacheMiss>,
    negotiated: Encoding,
    started: Instant,
) -> Result<()> {
    let read_timeout = app.settings.http_read_timeout();
    let write_timeout = app.settings.http_write_timeout();
    let cache_label = if cache_miss.is_some() { "miss" } else { "bypass" };

    advertise_sendfile(&mut request.headers, app.settings.x_sendfile_enabled);
    apply_forward_policy(
        &mut request.headers,
        app.settings.forward_headers(),
        request.peer.ip(),
        &request.host,
        request.scheme,
    );

    let has_body = !body.is_end_stream();
    let body_plan = if has_body { BodyPlan::Chunked } else { BodyPlan::Empty };
    let head_bytes = encode_upstream_request_head(
        &request.method,
        &request.target,
        &request.host,
        &request.headers,
        body_plan,
        false,
    );

    let mut pool = UpstreamPool::new(app.upstream_addr, app.upstream_connect_timeout());
    let forwarded: Result<UpstreamConnection> = async {
        let mut conn = pool.acquire().await?;
        write_all_with_timeout(
            conn.get_mut(),
            &head_bytes,
            write_timeout,
            "writing request head to upstream",
        )
        .await?;

        if has_body {
            let mut tracker = BodySizeTracker::new(app.settings.max_request_body);
            while let Some(chunk) = body.data().await {
                let chunk = chunk.context("reading HTTP/2 request body")?;
                tracker.record(chunk.len() as u64)?;
                write_chunk(conn.get_mut(), &chunk, write_timeout).await?;
                let _ = body.flow_control().release_capacity(chunk.len());
            }
            write_last_chunk(conn.get_mut(), write_timeout).await?;
        }
        Ok(conn)
    }
    .await;

    let mut conn = match forwarded {
        Ok(conn) => conn,
        Err(err) if err.downcast_ref::<BodyTooLarge>().is_some() => {
            return send_full(
                app,
                &request,
                respond,
                StatusCode::PAYLOAD_TOO_LARGE,
                HeaderMap::new(),
                Bytes::new(),
                "",
                started,
            );
        }
        Err(err) => {
            info!(path = %request.path, error = %err, "unable to proxy request");
            return send_bad_gateway(app, &request, respond, started);
        }
    };

    let head = match read_http1_response_head(&mut conn, read_timeout, app.upstream_addr).await {
        Ok(head) => head,
        Err(err) => {
            info!(path = %request.path, error = %err, "unable to proxy request");
            return send_bad_gateway(app, &request, respond, started);
        }
    };

    let status = head.status;
    let body_plan = if request.method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        ResponseBodyPlan::Empty
    } else if head.chunked {
        ResponseBodyPlan::Chunked
    } else {
        match head.content_length {
            Some(0) => ResponseBodyPlan::Empty,
            Some(length) => ResponseBodyPlan::Fixed(length),
            None => ResponseBodyPlan::UntilClose,
        }
    };

    let mut response_headers = sanitize_response_headers(&head.headers);
    let range = request
        .headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let action = sendfile::intercept(
        &mut response_headers,
        app.settings.x_sendfile_enabled,
        range.as_deref(),
    )
    .await;

    let stored_headers = response_headers.clone();
    compress::apply_guard(&app.compression, &request.headers, &mut response_headers);
    response_headers.insert(
        X_CACHE,
        HeaderValue::from_str(cache_label).unwrap_or(HeaderValue::from_static("miss")),
    );

    match action {
        SendfileAction::NotFound => send_full(
            app,
            &request,
            respond,
            StatusCode::NOT_FOUND,
            plain_text_headers(),
            Bytes::from_static(b"not found\n"),
            cache_label,
            started,
        ),
        SendfileAction::Serve(file) => {
            send_file(
                app,
                &request,
                respond,
                response_headers,
                file,
                negotiated,
                cache_label,
                started,
            )
            .await
        }
        SendfileAction::Passthrough => {
            let capture = cache_miss
                .as_ref()
                .map(|_| CaptureBuffer::new(app.settings.max_cache_item_size as usize));
            let (bytes_written, capture) = send_upstream_body(
                app,
                &request,
                respond,
                status,
                response_headers.clone(),
                &mut conn,
                body_plan,
                negotiated,
                capture,
            )
            .await?;

            if let Some(miss) = cache_miss {
                let body = capture.map(CaptureBuffer::body).unwrap_or(Some(Vec::new()));
                if let Some(body) = body {
                    stage::store(
                        &app.cache,
                        miss,
                        status,
                        &stored_headers,
                        body,
                        &request.path,
                    );
                }
            }

            finish_log(
                app,
                &request,
                status,
                bytes_written,
                cache_label,
                &header_string(&response_headers, header::CONTENT_TYPE),
                started,
            );
            Ok(())
        }
    }
}

/// Streams the upstream body out over the HTTP/2 stream, compressing and
/// capturing along the way.
#[allow(clippy::too_many_arguments)]
async fn send_upstream_body(
    app: &AppContext,
    request: &StreamRequest,
    respond: &mut SendResponse<Bytes>,
    status: StatusCode,
    mut headers: HeaderMap,
    conn: &mut UpstreamConnection,
    plan: ResponseBodyPlan,
    negotiated: Encoding,
    mut capture: Option<CaptureBuffer>,
) -> Result<(u64, Option<CaptureBuffer>)> {
    let read_timeout = app.settings.http_read_timeout();
    let peer = app.upstream_addr;
    let is_head = request.method == Method::HEAD;

    if matches!(plan, ResponseBodyPlan::Empty) {
        let response = build_response(status, &headers)?;
        respond.send_response(response, true).map_err(h2_error)?;
        return Ok((0, capture));
    }

    let known_length = match plan {
        ResponseBodyPlan::Fixed(length) => Some(length),
        _ => None,
    };
    let encoding = compress::plan(&app.compression, negotiated, &mut headers, known_length);

    let mut encoder = StreamingEncoder::new(encoding, app.compression.jitter)?;
    if encoder.is_some() {
        headers.insert(header::CONTENT_ENCODING, encoding_value(encoding));
    } else if let Some(length) = known_length {
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&length.to_string()).expect("numeric header"),
        );
    }

    let response = build_response(status, &headers)?;
    let mut stream = respond.send_response(response, is_head).map_err(h2_error)?;
    if is_head {
        return Ok((0, capture));
    }

    let mut bytes_written = 0u64;
    let mut buffer = [0u8; 8192];
    let mut remaining = match plan {
        ResponseBodyPlan::Fixed(length) => length,
        _ => 0,
    };
    let mut chunked = ChunkedBodyReader::new();

    loop {
        let piece = match plan {
            ResponseBodyPlan::Empty => None,
            ResponseBodyPlan::Fixed(_) => {
                if remaining == 0 {
                    None
                } else {
                    let to_read = remaining.min(buffer.len() as u64) as usize;
                    let read = crate::util::timeout_with_context(
                        read_timeout,
                        tokio::io::AsyncReadExt::read(conn, &mut buffer[..to_read]),
                        "reading response body from upstream",
                    )
                    .await?;
                    if read == 0 {
                        anyhow::bail!("upstream hung up before finishing the response body");
                    }
                    remaining -= read as u64;
                    Some(read)
                }
            }
            ResponseBodyPlan::Chunked => {
                chunked.next(conn, &mut buffer, read_timeout, peer).await?
            }
            ResponseBodyPlan::UntilClose => {
                let read = crate::util::timeout_with_context(
                    read_timeout,
                    tokio::io::AsyncReadExt::read(conn, &mut buffer),
                    "reading response body from upstream",
                )
                .await?;
                if read == 0 { None } else { Some(read) }
            }
        };

        let Some(read) = piece else { break };
        let raw = &buffer[..read];
        if let Some(capture) = capture.as_mut() {
            capture.record(raw);
        }
        let out = match encoder.as_mut() {
            Some(encoder) => encoder.write(raw)?,
            None => raw.to_vec(),
        };
        if !out.is_empty() {
            bytes_written += out.len() as u64;
            stream
                .send_data(Bytes::from(out), false)
                .map_err(h2_error)?;
        }
    }

    let tail = match encoder {
        Some(encoder) => encoder.finish()?,
        None => Vec::new(),
    };
    bytes_written += tail.len() as u64;
    stream.send_data(Bytes::from(tail), true).map_err(h2_error)?;

    Ok((bytes_written, capture))
}

#[allow(clippy::too_many_arguments)]
async fn send_file(
    app: &AppContext,
    request: &StreamRequest,
    respond: &mut SendResponse<Bytes>,
    mut headers: HeaderMap,
    mut file: FileBody,
    negotiated: Encoding,
    cache_label: &str,
    started: Instant,
) -> Result<()> {
    use tokio::io::AsyncReadExt;

    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(content_range) = &file.content_range
        && let Ok(value) = HeaderValue::from_str(content_range)
    {
        headers.insert(header::CONTENT_RANGE, value);
    }

    let encoding = compress::plan(&app.compression, negotiated, &mut headers, Some(file.length));
    let mut encoder = StreamingEncoder::new(encoding, app.compression.jitter)?;
    if encoder.is_some() {
        headers.insert(header::CONTENT_ENCODING, encoding_value(encoding));
    } else {
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&file.length.to_string()).expect("numeric header"),
        );
    }

    let is_head = request.method == Method::HEAD;
    let response = build_response(file.status, &headers)?;
    let mut stream = respond.send_response(response, is_head).map_err(h2_error)?;

    let mut bytes_written = 0u64;
    if !is_head {
        let mut buffer = [0u8; 8192];
        let mut remaining = file.length;
        while remaining > 0 {
            let to_read = remaining.min(buffer.len() as u64) as usize;
            let read = file.file.read(&mut buffer[..to_read]).await?;
            if read == 0 {
                anyhow::bail!("file shrank while being served");
            }
            remaining -= read as u64;
            let out = match encoder.as_mut() {
                Some(encoder) => encoder.write(&buffer[..read])?,
                None => buffer[..read].to_vec(),
            };
            if !out.is_empty() {
                bytes_written += out.len() as u64;
                stream
                    .send_data(Bytes::from(out), false)
                    .map_err(h2_error)?;
            }
        }
        let tail = match encoder {
            Some(encoder) => encoder.finish()?,
            None => Vec::new(),
        };
        bytes_written += tail.len() as u64;
        stream.send_data(Bytes::from(tail), true).map_err(h2_error)?;
    }

    finish_log(
        app,
        request,
        file.status,
        bytes_written,
        cache_label,
        &header_string(&headers, header::CONTENT_TYPE),
        started,
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn send_buffered(
    app: &AppContext,
    request: &StreamRequest,
    respond: &mut SendResponse<Bytes>,
    status: StatusCode,
    mut headers: HeaderMap,
    body: Vec<u8>,
    negotiated: Encoding,
    cache_label: &str,
    started: Instant,
) -> Result<()> {
    let encoding = compress::plan(
        &app.compression,
        negotiated,
        &mut headers,
        Some(body.len() as u64),
    );
    let payload = match encoding {
        Encoding::Identity => body,
        other => {
            headers.insert(header::CONTENT_ENCODING, encoding_value(other));
            compress::compress_full(other, &body, app.compression.jitter)?
        }
    };
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&payload.len().to_string()).expect("numeric header"),
    );

    let is_head = request.method == Method::HEAD;
    let response = build_response(status, &headers)?;
    let mut stream = respond.send_response(response, is_head).map_err(h2_error)?;
    let mut bytes_written = 0u64;
    if !is_head {
        bytes_written = payload.len() as u64;
        stream
            .send_data(Bytes::from(payload), true)
            .map_err(h2_error)?;
    }

    finish_log(
        app,
        request,
        status,
        bytes_written,
        cache_label,
        &header_string(&headers, header::CONTENT_TYPE),
        started,
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn send_full(
    app: &AppContext,
    request: &StreamRequest,
    respond: &mut SendResponse<Bytes>,
    status: StatusCode,
    mut headers: HeaderMap,
    body: Bytes,
    cache_label: &str,
    started: Instant,
) -> Result<()> {
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&body.len().to_string()).expect("numeric header"),
    );
    let response = build_response(status, &headers)?;
    let mut stream = respond.send_response(response, body.is_empty()).map_err(h2_error)?;
    let bytes_written = body.len() as u64;
    if !body.is_empty() {
        stream.send_data(body, true).map_err(h2_error)?;
    }
    finish_log(app, request, status, bytes_written, cache_label, "", started);
    Ok(())
}

fn send_bad_gateway(
    app: &AppContext,
    request: &StreamRequest,
    respond: &mut SendResponse<Bytes>,
    started: Instant,
) -> Result<()> {
    let (headers, body) = match &app.bad_gateway_page {
        Some(page) => {
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
            (headers, Bytes::from(page.as_ref().clone()))
        }
        None => (HeaderMap::new(), Bytes::new()),
    };
    send_full(
        app,
        request,
        respond,
        StatusCode::BAD_GATEWAY,
        headers,
        body,
        "",
        started,
    )
}

fn build_response(status: StatusCode, headers: &HeaderMap) -> Result<Response<()>> {
    let mut builder = Response::builder().status(status);
    if let Some(map) = builder.headers_mut() {
        map.extend(headers.iter().map(|(name, value)| (name.clone(), value.clone())));
    }
    builder.body(()).map_err(|err| anyhow!(err))
}

fn encoding_value(encoding: Encoding) -> HeaderValue {
    match encoding.content_encoding() {
        Some(name) => HeaderValue::from_static(name),
        None => HeaderValue::from_static("identity"),
    }
}

fn plain_text_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn h2_error(err: h2::Error) -> anyhow::Error {
    anyhow!("HTTP/2 stream error: {err}")
}

fn finish_log(
    app: &AppContext,
    request: &StreamRequest,
    status: StatusCode,
    bytes_written: u64,
    cache: &str,
    content_type: &str,
    started: Instant,
) {
    if !app.settings.log_requests {
        return;
    }
    log_request(RequestLogEvent {
        path: request.path.clone(),
        status: status.as_u16(),
        elapsed: started.elapsed(),
        method: request.method.to_string(),
        req_content_length: 0,
        req_content_type: request.header_str(header::CONTENT_TYPE),
        resp_content_length: bytes_written,
        resp_content_type: content_type.to_string(),
        remote_addr: request.remote_addr(),
        user_agent: request.header_str(header::USER_AGENT),
        cache: cache.to_string(),
        query: request.query.clone(),
        proto: "HTTP/2.0".to_string(),
    });
}
