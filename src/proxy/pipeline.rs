use std::time::{Duration, Instant};

use anyhow::Result;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::cache::stage::{self, CacheLookup, CacheMiss};
use crate::cache::{CacheableResponse, CaptureBuffer};
use crate::compress::{self, Encoding};
use crate::logging::{RequestLogEvent, log_request};
use crate::util::write_all_with_timeout;

use super::body::{BodySizeTracker, BodyTooLarge, drain_request_body};
use super::codec::read_http1_request_head;
use super::forward::{self, ForwardError, ResponseBodyPlan, UpstreamResponse};
use super::headers::{
    X_CACHE, advertise_sendfile, apply_forward_policy, encode_upstream_request_head,
    sanitize_response_headers, stamp_request_start,
};
use super::request::{ProxiedRequest, Scheme};
use super::respond::{
    OutboundBody, OutboundResponse, Transforms, write_response, write_simple_response,
};
use super::sendfile::{self, SendfileAction};
use super::upstream::UpstreamPool;
use super::{ACTIVE_STORAGE_PREFIX, AppContext};

pub enum ClientDisposition {
    Continue,
    Close,
}

/// Serves one client connection: a keep-alive loop of pipelined requests,
/// each walked through the response pipeline.
pub async fn serve_connection<S>(
    stream: S,
    peer: std::net::SocketAddr,
    scheme: Scheme,
    app: AppContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut reader = BufReader::new(stream);
    let mut pool = UpstreamPool::new(app.upstream_addr, app.upstream_connect_timeout());
    let idle_timeout = app.settings.http_idle_timeout();
    let read_timeout = app.settings.http_read_timeout();
    let write_timeout = app.settings.http_write_timeout();

    loop {
        let head =
            match read_http1_request_head(&mut reader, peer, idle_timeout, read_timeout).await {
                Ok(Some(head)) => head,
                Ok(None) => break,
                Err(err) => {
                    debug!(peer = %peer, error = %err, "could not parse request head");
                    let mut headers = HeaderMap::new();
                    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                    let _ = write_simple_response(
                        reader.get_mut(),
                        StatusCode::BAD_REQUEST,
                        &headers,
                        b"malformed request\n",
                        true,
                        write_timeout,
                    )
                    .await;
                    break;
                }
            };

        let request = ProxiedRequest::from_head(head, peer, scheme);
        match handle_request(&mut reader, &mut pool, &app, request).await {
            Ok(ClientDisposition::Continue) => continue,
            Ok(ClientDisposition::Close) => break,
            Err(err) => {
                debug!(peer = %peer, error = %err, "request failed mid-flight");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_request<S>(
    reader: &mut BufReader<S>,
    pool: &mut UpstreamPool,
    app: &AppContext,
    mut request: ProxiedRequest,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let started = Instant::now();
    let read_timeout = app.settings.http_read_timeout();
    let write_timeout = app.settings.http_write_timeout();

    if request.expect_continue {
        write_all_with_timeout(
            reader.get_mut(),
            b"HTTP/1.1 100 Continue\r\n\r\n",
            write_timeout,
            "writing 100 Continue",
        )
        .await?;
    }

    // Reserved hook for Active Storage representations; the image pipeline
    // has no specification yet, so it answers 501 instead of guessing.
    if !app.settings.active_storage_secret.is_empty()
        && request.path.starts_with(ACTIVE_STORAGE_PREFIX)
    {
        info!(path = %request.path, "intercepted Active Storage representation request");
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let bytes = write_simple_response(
            reader.get_mut(),
            StatusCode::NOT_IMPLEMENTED,
            &headers,
            b"image representation processing is not implemented\n",
            true,
            write_timeout,
        )
        .await?;
        finish_log(app, &request, StatusCode::NOT_IMPLEMENTED, bytes, "", "", started);
        return Ok(ClientDisposition::Close);
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
            serve_hit(reader, app, &request, stored, negotiated, started).await
        }
        CacheLookup::Miss(miss) => {
            forward_and_respond(reader, pool, app, request, Some(miss), negotiated, started).await
        }
        CacheLookup::Bypass => {
            forward_and_respond(reader, pool, app, request, None, negotiated, started).await
        }
    }
}

async fn serve_hit<S>(
    reader: &mut BufReader<S>,
    app: &AppContext,
    request: &ProxiedRequest,
    stored: CacheableResponse,
    negotiated: Encoding,
    started: Instant,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let read_timeout = app.settings.http_read_timeout();
    let write_timeout = app.settings.http_write_timeout();

    // The connection must be re-synchronized even though the cache answers.
    let mut tracker = BodySizeTracker::new(app.settings.max_request_body);
    if let Err(err) = drain_request_body(
        reader,
        request.body_plan,
        &mut tracker,
        read_timeout,
        request.peer,
    )
    .await
    {
        return if err.downcast_ref::<BodyTooLarge>().is_some() {
            respond_too_large(reader.get_mut(), app, request, started).await
        } else {
            Err(err)
        };
    }

    let mut response_headers = stored.headers.clone();
    compress::apply_guard(&app.compression, &request.headers, &mut response_headers);
    response_headers.insert(X_CACHE, HeaderValue::from_static("hit"));

    let content_type = header_str(&response_headers, header::CONTENT_TYPE);
    let outcome = write_response(
        reader.get_mut(),
        OutboundResponse {
            status: stored.status,
            headers: response_headers,
            body: OutboundBody::Full(stored.body),
        },
        Transforms {
            compression: app.compression,
            negotiated,
            capture: None,
        },
        request.method == Method::HEAD,
        request.connection_close,
        read_timeout,
        write_timeout,
    )
    .await?;

    finish_log(
        app,
        request,
        stored.status,
        outcome.bytes_written,
        "hit",
        &content_type,
        started,
    );
    Ok(disposition_for(request))
}

#[allow(clippy::too_many_arguments)]
async fn forward_and_respond<S>(
    reader: &mut BufReader<S>,
    pool: &mut UpstreamPool,
    app: &AppContext,
    mut request: ProxiedRequest,
    cache_miss: Option<CacheMiss>,
    negotiated: Encoding,
    started: Instant,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
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

    let upgrade = request.wants_upgrade();
    let head_bytes = encode_upstream_request_head(
        &request.method,
        &request.target,
        &request.host,
        &request.headers,
        request.body_plan,
        upgrade,
    );

    let response = match forward::forward(
        pool,
        &request,
        &head_bytes,
        reader,
        app.settings.max_request_body,
        read_timeout,
        write_timeout,
    )
    .await
    {
        Ok(response) => response,
        Err(ForwardError::BodyTooLarge(_)) => {
            return respond_too_large(reader.get_mut(), app, &request, started).await;
        }
        Err(ForwardError::Transport(err)) => {
            info!(path = %request.path, error = %err, "unable to proxy request");
            return respond_bad_gateway(reader.get_mut(), app, &request, started).await;
        }
    };

    if response.head.status == StatusCode::SWITCHING_PROTOCOLS && upgrade {
        return serve_upgrade(reader, app, &request, response, started).await;
    }

    let UpstreamResponse {
        head,
        body_plan,
        mut conn,
    } = response;
    let status = head.status;
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

    // Snapshot before the outbound-only mutations: stored entries must not
    // carry X-Cache, the guard marker, or a synthesized Vary.
    let stored_headers = response_headers.clone();

    compress::apply_guard(&app.compression, &request.headers, &mut response_headers);
    let label_value =
        HeaderValue::from_str(cache_label).unwrap_or(HeaderValue::from_static("miss"));
    response_headers.insert(X_CACHE, label_value);

    let is_head = request.method == Method::HEAD;
    let (outbound, upstream_released, serving_file) = match action {
        SendfileAction::Passthrough => match body_plan {
            ResponseBodyPlan::Empty => {
                pool.release(conn, !head.connection_close);
                (
                    OutboundBody::Empty {
                        declared_length: head.content_length,
                    },
                    true,
                    false,
                )
            }
            plan => (OutboundBody::Upstream { conn, plan }, false, false),
        },
        SendfileAction::Serve(file) => {
            let reusable = drain_upstream_body(&mut conn, body_plan, read_timeout).await;
            pool.release(conn, reusable && !head.connection_close);
            (OutboundBody::File(file), true, true)
        }
        SendfileAction::NotFound => {
            let reusable = drain_upstream_body(&mut conn, body_plan, read_timeout).await;
            pool.release(conn, reusable && !head.connection_close);
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            headers.insert(X_CACHE, HeaderValue::from_static("bypass"));
            let bytes = write_simple_response(
                reader.get_mut(),
                StatusCode::NOT_FOUND,
                &headers,
                b"not found\n",
                request.connection_close,
                write_timeout,
            )
            .await?;
            finish_log(app, &request, StatusCode::NOT_FOUND, bytes, cache_label, "", started);
            return Ok(disposition_for(&request));
        }
    };

    let mut response = OutboundResponse {
        status,
        headers: response_headers,
        body: outbound,
    };
    if let OutboundBody::File(file) = &response.body {
        response.status = file.status;
        response
            .headers
            .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        if let Some(content_range) = &file.content_range
            && let Ok(value) = HeaderValue::from_str(content_range)
        {
            response.headers.insert(header::CONTENT_RANGE, value);
        }
    }
    let final_status = response.status;
    let content_type = header_str(&response.headers, header::CONTENT_TYPE);

    // Sendfile responses are never captured; the stored entry would replay
    // the upstream's placeholder body rather than the file.
    let capture = match (&cache_miss, serving_file) {
        (Some(_), false) => Some(CaptureBuffer::new(
            app.settings.max_cache_item_size as usize,
        )),
        _ => None,
    };

    let outcome = write_response(
        reader.get_mut(),
        response,
        Transforms {
            compression: app.compression,
            negotiated,
            capture,
        },
        is_head,
        request.connection_close,
        read_timeout,
        write_timeout,
    )
    .await?;

    if !upstream_released
        && let Some((conn, reusable)) = outcome.upstream
    {
        pool.release(conn, reusable && !head.connection_close);
    }

    if let Some(miss) = cache_miss {
        let body = match outcome.capture {
            Some(capture) => capture.body(),
            // Bodyless responses (HEAD, 204, Content-Length: 0) can still
            // be cacheable; they store an empty body.
            None if !serving_file => Some(Vec::new()),
            None => None,
        };
        if let Some(body) = body {
            stage::store(&app.cache, miss, status, &stored_headers, body, &request.path);
        }
    }

    finish_log(
        app,
        &request,
        final_status,
        outcome.bytes_written,
        cache_label,
        &content_type,
        started,
    );
    Ok(disposition_for(&request))
}

/// Replays the upstream 101 head verbatim and splices bytes in both
/// directions until either side hangs up.
async fn serve_upgrade<S>(
    reader: &mut BufReader<S>,
    app: &AppContext,
    request: &ProxiedRequest,
    response: UpstreamResponse,
    started: Instant,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let write_timeout = app.settings.http_write_timeout();
    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    for (name, value) in response.head.headers.iter() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    write_all_with_timeout(reader.get_mut(), &head, write_timeout, "writing 101 response").await?;

    let mut upstream_reader = response.conn;

    // Bytes already buffered on either side belong to the spliced phase.
    let upstream_buffered = upstream_reader.buffer().to_vec();
    if !upstream_buffered.is_empty() {
        write_all_with_timeout(
            reader.get_mut(),
            &upstream_buffered,
            write_timeout,
            "writing buffered upgrade bytes to client",
        )
        .await?;
    }
    let client_buffered = reader.buffer().to_vec();
    let mut upstream_stream = upstream_reader.into_inner();
    if !client_buffered.is_empty() {
        write_all_with_timeout(
            &mut upstream_stream,
            &client_buffered,
            write_timeout,
            "writing buffered upgrade bytes to upstream",
        )
        .await?;
    }

    finish_log(
        app,
        request,
        StatusCode::SWITCHING_PROTOCOLS,
        0,
        "bypass",
        "",
        started,
    );

    let client_stream = reader.get_mut();
    let _ = tokio::io::copy_bidirectional(client_stream, &mut upstream_stream).await;
    let _ = upstream_stream.shutdown().await;

    Ok(ClientDisposition::Close)
}

async fn respond_too_large<W>(
    client: &mut W,
    app: &AppContext,
    request: &ProxiedRequest,
    started: Instant,
) -> Result<ClientDisposition>
where
    W: AsyncWrite + Unpin,
{
    let bytes = write_simple_response(
        client,
        StatusCode::PAYLOAD_TOO_LARGE,
        &HeaderMap::new(),
        b"",
        true,
        app.settings.http_write_timeout(),
    )
    .await?;
    finish_log(app, request, StatusCode::PAYLOAD_TOO_LARGE, bytes, "", "", started);
    Ok(ClientDisposition::Close)
}

async fn respond_bad_gateway<W>(
    client: &mut W,
    app: &AppContext,
    request: &ProxiedRequest,
    started: Instant,
) -> Result<ClientDisposition>
where
    W: AsyncWrite + Unpin,
{
    let mut headers = HeaderMap::new();
    let body: &[u8] = match &app.bad_gateway_page {
        Some(page) => {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
            page
        }
        None => b"",
    };
    let bytes = write_simple_response(
        client,
        StatusCode::BAD_GATEWAY,
        &headers,
        body,
        true,
        app.settings.http_write_timeout(),
    )
    .await?;
    finish_log(app, request, StatusCode::BAD_GATEWAY, bytes, "", "text/html", started);
    Ok(ClientDisposition::Close)
}

/// Reads the rest of an upstream body nobody wants (sendfile replaced it).
/// Returns whether the connection ended in a reusable state.
async fn drain_upstream_body(
    conn: &mut super::upstream::UpstreamConnection,
    plan: ResponseBodyPlan,
    read_timeout: Duration,
) -> bool {
    use super::body::ChunkedBodyReader;
    use tokio::io::AsyncReadExt;

    let peer = conn
        .get_ref()
        .peer_addr()
        .unwrap_or_else(|_| "127.0.0.1:0".parse().expect("static addr"));
    let mut buffer = [0u8; 8192];
    match plan {
        ResponseBodyPlan::Empty => true,
        ResponseBodyPlan::Fixed(length) => {
            let mut remaining = length;
            while remaining > 0 {
                let to_read = remaining.min(buffer.len() as u64) as usize;
                match crate::util::timeout_with_context(
                    read_timeout,
                    conn.read(&mut buffer[..to_read]),
                    "draining upstream body",
                )
                .await
                {
                    Ok(0) | Err(_) => return false,
                    Ok(read) => remaining -= read as u64,
                }
            }
            true
        }
        ResponseBodyPlan::Chunked => {
            let mut body = ChunkedBodyReader::new();
            loop {
                match body.next(conn, &mut buffer, read_timeout, peer).await {
                    Ok(Some(_)) => continue,
                    Ok(None) => return true,
                    Err(err) => {
                        warn!(error = %err, "failed to drain upstream body");
                        return false;
                    }
                }
            }
        }
        ResponseBodyPlan::UntilClose => false,
    }
}

fn disposition_for(request: &ProxiedRequest) -> ClientDisposition {
    if request.connection_close {
        ClientDisposition::Close
    } else {
        ClientDisposition::Continue
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn finish_log(
    app: &AppContext,
    request: &ProxiedRequest,
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
        req_content_length: request.content_length(),
        req_content_type: request.content_type().to_string(),
        resp_content_length: bytes_written,
        resp_content_type: content_type.to_string(),
        remote_addr: request.remote_addr(),
        user_agent: request.user_agent().to_string(),
        cache: cache.to_string(),
        query: request.query.clone(),
        proto: request.proto.clone(),
    });
}
