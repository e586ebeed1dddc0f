use std::collections::HashSet;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use http::{HeaderMap, HeaderValue, Method, header};

use super::body::BodyPlan;
use super::request::Scheme;

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_REQUEST_START: &str = "x-request-start";
pub const X_SENDFILE: &str = "x-sendfile";
pub const X_SENDFILE_TYPE: &str = "x-sendfile-type";
pub const X_CACHE: &str = "x-cache";

/// Stamps the monotonic request arrival time for upstream queue-time
/// metrics. A value set by an earlier edge wins.
pub fn stamp_request_start(headers: &mut HeaderMap) {
    if headers.contains_key(X_REQUEST_START) {
        return;
    }
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0);
    if let Ok(value) = HeaderValue::from_str(&format!("t={millis}")) {
        headers.insert(X_REQUEST_START, value);
    }
}

/// Advertises (or withdraws) accelerated file serving toward the upstream.
pub fn advertise_sendfile(headers: &mut HeaderMap, enabled: bool) {
    if enabled {
        headers.insert(X_SENDFILE_TYPE, HeaderValue::from_static("X-Sendfile"));
    } else {
        headers.remove(X_SENDFILE_TYPE);
    }
}

/// X-Forwarded-* policy. With `trust_edge` the inbound values are kept (the
/// peer is appended to any X-Forwarded-For chain); otherwise everything the
/// client sent is replaced with what this proxy observed itself.
pub fn apply_forward_policy(
    headers: &mut HeaderMap,
    trust_edge: bool,
    peer: IpAddr,
    host: &str,
    scheme: Scheme,
) {
    let peer_text = peer.to_string();

    if trust_edge {
        let chain = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => format!("{existing}, {peer_text}"),
            _ => peer_text,
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if !headers.contains_key(X_FORWARDED_HOST)
            && let Ok(value) = HeaderValue::from_str(host)
        {
            headers.insert(X_FORWARDED_HOST, value);
        }
        if !headers.contains_key(X_FORWARDED_PROTO) {
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme.as_str()));
        }
    } else {
        if let Ok(value) = HeaderValue::from_str(&peer_text) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        match HeaderValue::from_str(host) {
            Ok(value) => {
                headers.insert(X_FORWARDED_HOST, value);
            }
            Err(_) => {
                headers.remove(X_FORWARDED_HOST);
            }
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme.as_str()));
    }
}

/// Header names that never travel between hops, plus anything the inbound
/// Connection header nominated.
fn hop_by_hop_names(headers: &HeaderMap) -> HashSet<String> {
    let mut names: HashSet<String> = [
        "connection",
        "keep-alive",
        "proxy-connection",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ]
    .into_iter()
    .map(str::to_string)
    .collect();

    for value in headers.get_all(header::CONNECTION) {
        if let Ok(list) = value.to_str() {
            for token in list.split(',') {
                let token = token.trim();
                if !token.is_empty() {
                    names.insert(token.to_ascii_lowercase());
                }
            }
        }
    }
    names
}

/// Serializes the rewritten request head for the upstream connection. The
/// inbound Host is preserved for virtual-hosted upstreams; hop-by-hop
/// headers are dropped (except a deliberate Upgrade carry-over), and the
/// body framing is restated from the plan.
pub fn encode_upstream_request_head(
    method: &Method,
    target: &str,
    host: &str,
    headers: &HeaderMap,
    body_plan: BodyPlan,
    upgrade: bool,
) -> Vec<u8> {
    let hop_by_hop = hop_by_hop_names(headers);

    let mut buffer = Vec::with_capacity(256);
    buffer.extend_from_slice(method.as_str().as_bytes());
    buffer.extend_from_slice(b" ");
    buffer.extend_from_slice(target.as_bytes());
    buffer.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    buffer.extend_from_slice(host.as_bytes());
    buffer.extend_from_slice(b"\r\n");

    for (name, value) in headers.iter() {
        let name_str = name.as_str();
        if name_str == "host" || name_str == "content-length" || hop_by_hop.contains(name_str) {
            continue;
        }
        buffer.extend_from_slice(name_str.as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    match body_plan {
        BodyPlan::Empty => {
            if method == Method::POST || method == Method::PUT || method == Method::PATCH {
                buffer.extend_from_slice(b"Content-Length: 0\r\n");
            }
        }
        BodyPlan::Fixed(length) => {
            buffer.extend_from_slice(format!("Content-Length: {length}\r\n").as_bytes());
        }
        BodyPlan::Chunked => {
            buffer.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
    }

    if upgrade {
        if let Some(value) = headers.get(header::UPGRADE) {
            buffer.extend_from_slice(b"Connection: Upgrade\r\nUpgrade: ");
            buffer.extend_from_slice(value.as_bytes());
            buffer.extend_from_slice(b"\r\n");
        }
    }

    buffer.extend_from_slice(b"\r\n");
    buffer
}

/// Strips hop-by-hop headers from an upstream response before it is
/// serialized back to the client.
pub fn sanitize_response_headers(headers: &HeaderMap) -> HeaderMap {
    let hop_by_hop = hop_by_hop_names(headers);
    let mut sanitized = HeaderMap::new();
    for (name, value) in headers.iter() {
        let name_str = name.as_str();
        if name_str == "content-length" || hop_by_hop.contains(name_str) {
            continue;
        }
        sanitized.append(name.clone(), value.clone());
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                header::HeaderName::try_from(*name).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    fn peer() -> IpAddr {
        "192.0.2.7".parse().unwrap()
    }

    #[test]
    fn stamp_adds_millisecond_timestamp() {
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis();
        let mut map = HeaderMap::new();
        stamp_request_start(&mut map);
        let after = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis();

        let value = map.get(X_REQUEST_START).unwrap().to_str().unwrap();
        let millis: u128 = value.strip_prefix("t=").unwrap().parse().unwrap();
        assert!(millis >= before && millis <= after);
    }

    #[test]
    fn stamp_never_overwrites() {
        let mut map = headers(&[(X_REQUEST_START, "t=123")]);
        stamp_request_start(&mut map);
        assert_eq!(map.get(X_REQUEST_START).unwrap(), "t=123");
    }

    #[test]
    fn trusted_edge_appends_to_forwarded_chain() {
        let mut map = headers(&[
            (X_FORWARDED_FOR, "10.0.0.1"),
            (X_FORWARDED_PROTO, "https"),
            (X_FORWARDED_HOST, "edge.example.com"),
        ]);
        apply_forward_policy(&mut map, true, peer(), "app.example.com", Scheme::Http);
        assert_eq!(map.get(X_FORWARDED_FOR).unwrap(), "10.0.0.1, 192.0.2.7");
        assert_eq!(map.get(X_FORWARDED_PROTO).unwrap(), "https");
        assert_eq!(map.get(X_FORWARDED_HOST).unwrap(), "edge.example.com");
    }

    #[test]
    fn trusted_edge_synthesizes_missing_values() {
        let mut map = HeaderMap::new();
        apply_forward_policy(&mut map, true, peer(), "app.example.com", Scheme::Https);
        assert_eq!(map.get(X_FORWARDED_FOR).unwrap(), "192.0.2.7");
        assert_eq!(map.get(X_FORWARDED_PROTO).unwrap(), "https");
        assert_eq!(map.get(X_FORWARDED_HOST).unwrap(), "app.example.com");
    }

    #[test]
    fn untrusted_client_headers_are_replaced() {
        let mut map = headers(&[
            (X_FORWARDED_FOR, "6.6.6.6"),
            (X_FORWARDED_PROTO, "https"),
            (X_FORWARDED_HOST, "evil.example.com"),
        ]);
        apply_forward_policy(&mut map, false, peer(), "app.example.com", Scheme::Http);
        assert_eq!(map.get(X_FORWARDED_FOR).unwrap(), "192.0.2.7");
        assert_eq!(map.get(X_FORWARDED_PROTO).unwrap(), "http");
        assert_eq!(map.get(X_FORWARDED_HOST).unwrap(), "app.example.com");
    }

    #[test]
    fn upstream_head_preserves_host_and_strips_hop_by_hop() {
        let map = headers(&[
            ("host", "ignored.example.com"),
            ("accept", "*/*"),
            ("connection", "keep-alive, x-custom"),
            ("x-custom", "dropped"),
            ("keep-alive", "timeout=5"),
        ]);
        let head = encode_upstream_request_head(
            &Method::GET,
            "/path?q=1",
            "app.example.com",
            &map,
            BodyPlan::Empty,
            false,
        );
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("GET /path?q=1 HTTP/1.1\r\nHost: app.example.com\r\n"));
        assert!(text.contains("accept: */*\r\n"));
        assert!(!text.contains("x-custom"));
        assert!(!text.contains("keep-alive"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn upstream_head_restates_body_framing() {
        let map = headers(&[("host", "a"), ("content-length", "999")]);
        let fixed = encode_upstream_request_head(
            &Method::POST,
            "/",
            "a",
            &map,
            BodyPlan::Fixed(12),
            false,
        );
        let text = String::from_utf8(fixed).unwrap();
        assert!(text.contains("Content-Length: 12\r\n"));
        assert!(!text.contains("999"));

        let chunked =
            encode_upstream_request_head(&Method::POST, "/", "a", &map, BodyPlan::Chunked, false);
        let text = String::from_utf8(chunked).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
    }

    #[test]
    fn upstream_head_carries_upgrade_when_requested() {
        let map = headers(&[
            ("host", "a"),
            ("connection", "Upgrade"),
            ("upgrade", "websocket"),
        ]);
        let head =
            encode_upstream_request_head(&Method::GET, "/ws", "a", &map, BodyPlan::Empty, true);
        let text = String::from_utf8(head).unwrap();
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
    }

    #[test]
    fn response_sanitizer_strips_connection_nominated_headers() {
        let map = headers(&[
            ("content-type", "text/html"),
            ("connection", "close, x-secret"),
            ("x-secret", "1"),
            ("transfer-encoding", "chunked"),
        ]);
        let sanitized = sanitize_response_headers(&map);
        assert!(sanitized.get("content-type").is_some());
        assert!(sanitized.get("x-secret").is_none());
        assert!(sanitized.get("connection").is_none());
        assert!(sanitized.get("transfer-encoding").is_none());
    }
}
