use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber. The default filter comes from settings
/// (`LOG_LEVEL` / `DEBUG`); `RUST_LOG` overrides it when present.
pub fn init_logger(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    fmt::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init()
        .map_err(|err| anyhow!(err))
}

/// One record per proxied request, emitted after the response has been
/// written (or the connection was hijacked for an upgrade).
#[derive(Debug, Clone)]
pub struct RequestLogEvent {
    pub path: String,
    pub status: u16,
    pub elapsed: Duration,
    pub method: String,
    pub req_content_length: u64,
    pub req_content_type: String,
    pub resp_content_length: u64,
    pub resp_content_type: String,
    pub remote_addr: String,
    pub user_agent: String,
    pub cache: String,
    pub query: String,
    pub proto: String,
}

pub fn log_request(event: RequestLogEvent) {
    let RequestLogEvent {
        path,
        status,
        elapsed,
        method,
        req_content_length,
        req_content_type,
        resp_content_length,
        resp_content_type,
        remote_addr,
        user_agent,
        cache,
        query,
        proto,
    } = event;

    tracing::info!(
        target: "access_log",
        path,
        status,
        dur = elapsed.as_millis() as u64,
        method,
        req_content_length,
        req_content_type,
        resp_content_length,
        resp_content_type,
        remote_addr,
        user_agent,
        cache,
        query,
        proto,
        "Request"
    );
}
