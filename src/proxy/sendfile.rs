use http::{HeaderMap, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, SeekFrom};
use tracing::{debug, warn};

use super::headers::X_SENDFILE;

/// A file the upstream asked us to serve in place of its own body.
pub struct FileBody {
    pub file: File,
    pub length: u64,
    pub total_size: u64,
    pub status: StatusCode,
    pub content_range: Option<String>,
}

pub enum SendfileAction {
    /// No accelerated file in play; the upstream body stands.
    Passthrough,
    /// Serve these file bytes instead of the upstream body.
    Serve(FileBody),
    /// The upstream named a file we cannot read.
    NotFound,
}

/// Inspects a response for `X-Sendfile`. The header never leaves the proxy;
/// when serving is enabled the named file replaces the upstream body, with
/// `Content-Length` forced to the real file size (upstreams hand out
/// `Content-Encoding: gzip` + `Content-Length: 0` for precompressed assets,
/// which would otherwise truncate the response).
pub async fn intercept(
    response_headers: &mut HeaderMap,
    enabled: bool,
    range: Option<&str>,
) -> SendfileAction {
    let filename = response_headers
        .remove(X_SENDFILE)
        .and_then(|value| value.to_str().map(str::to_string).ok());

    let Some(filename) = filename else {
        return SendfileAction::Passthrough;
    };
    if !enabled {
        return SendfileAction::Passthrough;
    }

    debug!(path = %filename, "serving file for X-Sendfile response");

    let metadata = match tokio::fs::metadata(&filename).await {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => {
            warn!(path = %filename, "X-Sendfile target is not a regular file");
            return SendfileAction::NotFound;
        }
        Err(err) => {
            warn!(path = %filename, error = %err, "failed to stat X-Sendfile target");
            return SendfileAction::NotFound;
        }
    };
    let total_size = metadata.len();

    let (status, offset, length, content_range) = match range.map(|value| parse_range(value, total_size))
    {
        None | Some(RangeOutcome::Ignore) => (StatusCode::OK, 0, total_size, None),
        Some(RangeOutcome::Satisfiable { start, end }) => (
            StatusCode::PARTIAL_CONTENT,
            start,
            end - start + 1,
            Some(format!("bytes {start}-{end}/{total_size}")),
        ),
        Some(RangeOutcome::Unsatisfiable) => (
            StatusCode::RANGE_NOT_SATISFIABLE,
            0,
            0,
            Some(format!("bytes */{total_size}")),
        ),
    };

    let mut file = match File::open(&filename).await {
        Ok(file) => file,
        Err(err) => {
            warn!(path = %filename, error = %err, "failed to open X-Sendfile target");
            return SendfileAction::NotFound;
        }
    };
    if offset > 0 && let Err(err) = file.seek(SeekFrom::Start(offset)).await {
        warn!(path = %filename, error = %err, "failed to seek X-Sendfile target");
        return SendfileAction::NotFound;
    }

    SendfileAction::Serve(FileBody {
        file,
        length,
        total_size,
        status,
        content_range,
    })
}

enum RangeOutcome {
    Ignore,
    Satisfiable { start: u64, end: u64 },
    Unsatisfiable,
}

/// Single-range `bytes=` parser. Malformed or multi-range requests fall
/// back to the full representation, which RFC 9110 permits.
fn parse_range(value: &str, total_size: u64) -> RangeOutcome {
    let Some(spec) = value.strip_prefix("bytes=") else {
        return RangeOutcome::Ignore;
    };
    if spec.contains(',') {
        return RangeOutcome::Ignore;
    }
    let Some((start, end)) = spec.split_once('-') else {
        return RangeOutcome::Ignore;
    };
    let start = start.trim();
    let end = end.trim();

    if start.is_empty() {
        // Suffix form: last N bytes.
        let Ok(suffix) = end.parse::<u64>() else {
            return RangeOutcome::Ignore;
        };
        if suffix == 0 || total_size == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        let length = suffix.min(total_size);
        return RangeOutcome::Satisfiable {
            start: total_size - length,
            end: total_size - 1,
        };
    }

    let Ok(start) = start.parse::<u64>() else {
        return RangeOutcome::Ignore;
    };
    if start >= total_size {
        return RangeOutcome::Unsatisfiable;
    }

    let end = if end.is_empty() {
        total_size - 1
    } else {
        match end.parse::<u64>() {
            Ok(end) if end >= start => end.min(total_size - 1),
            _ => return RangeOutcome::Ignore,
        }
    };

    RangeOutcome::Satisfiable { start, end }
}
