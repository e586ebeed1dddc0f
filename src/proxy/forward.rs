use std::time::Duration;

use anyhow::Result;
use http::Method;
use thiserror::Error;
use tokio::io::{AsyncRead, BufReader};
use tracing::debug;

use super::body::{BodyPlan, BodySizeTracker, BodyTooLarge, stream_request_body};
use super::codec::{Http1ResponseHead, read_http1_response_head};
use super::request::ProxiedRequest;
use super::upstream::{UpstreamConnection, UpstreamPool};
use crate::util::write_all_with_timeout;

/// Why a request could not be answered by the upstream. `BodyTooLarge` maps
/// to 413; everything else renders as 502.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(transparent)]
    BodyTooLarge(#[from] BodyTooLarge),
    #[error("upstream transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

/// How the upstream response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseBodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
    UntilClose,
}

pub struct UpstreamResponse {
    pub head: Http1ResponseHead,
    pub body_plan: ResponseBodyPlan,
    pub conn: UpstreamConnection,
}

/// Sends the rewritten request (head and body) to the loopback upstream and
/// reads the response head. The caller already rewrote the headers; this
/// layer only moves bytes and classifies failures.
pub async fn forward<S>(
    pool: &mut UpstreamPool,
    request: &ProxiedRequest,
    head_bytes: &[u8],
    client_reader: &mut BufReader<S>,
    max_request_body: u64,
    read_timeout: Duration,
    write_timeout: Duration,
) -> Result<UpstreamResponse, ForwardError>
where
    S: AsyncRead + Unpin,
{
    let mut conn = pool.acquire().await.map_err(ForwardError::Transport)?;

    write_all_with_timeout(
        conn.get_mut(),
        head_bytes,
        write_timeout,
        "writing request head to upstream",
    )
    .await
    .map_err(ForwardError::Transport)?;

    let mut tracker = BodySizeTracker::new(max_request_body);
    stream_request_body(
        client_reader,
        conn.get_mut(),
        request.body_plan,
        &mut tracker,
        read_timeout,
        write_timeout,
        request.peer,
    )
    .await
    .map_err(|err| match err.downcast::<BodyTooLarge>() {
        Ok(too_large) => ForwardError::BodyTooLarge(too_large),
        Err(err) => ForwardError::Transport(err),
    })?;

    let head = read_http1_response_head(&mut conn, read_timeout, pool.addr())
        .await
        .map_err(ForwardError::Transport)?;

    let body_plan = response_body_plan(&request.method, &head);
    debug!(
        status = head.status.as_u16(),
        plan = ?body_plan,
        "upstream response head received"
    );

    Ok(UpstreamResponse {
        body_plan,
        head,
        conn,
    })
}

fn response_body_plan(method: &Method, head: &Http1ResponseHead) -> ResponseBodyPlan {
    let status = head.status.as_u16();
    if method == Method::HEAD
        || status < 200
        || head.status == http::StatusCode::NO_CONTENT
        || head.status == http::StatusCode::NOT_MODIFIED
    {
        return ResponseBodyPlan::Empty;
    }
    if head.chunked {
        return ResponseBodyPlan::Chunked;
    }
    match head.content_length {
        Some(0) => ResponseBodyPlan::Empty,
        Some(length) => ResponseBodyPlan::Fixed(length),
        None => ResponseBodyPlan::UntilClose,
    }
}
