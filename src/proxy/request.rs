use std::net::SocketAddr;

use http::{HeaderMap, Method, header};

use super::body::BodyPlan;
use super::codec::Http1RequestHead;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// A parsed inbound request in the form the pipeline stages consume.
pub struct ProxiedRequest {
    pub method: Method,
    pub target: String,
    pub path: String,
    pub query: String,
    pub host: String,
    pub headers: HeaderMap,
    pub peer: SocketAddr,
    pub scheme: Scheme,
    pub proto: String,
    pub body_plan: BodyPlan,
    pub expect_continue: bool,
    pub connection_close: bool,
}

impl ProxiedRequest {
    pub fn from_head(head: Http1RequestHead, peer: SocketAddr, scheme: Scheme) -> Self {
        let host = head.host().to_string();
        let (path, query) = split_target(&head.target);
        Self {
            method: head.method,
            path,
            query,
            host,
            peer,
            scheme,
            proto: "HTTP/1.1".to_string(),
            body_plan: BodyPlan::for_request(head.content_length, head.chunked),
            expect_continue: head.expect_continue,
            connection_close: head.connection_close,
            target: head.target,
            headers: head.headers,
        }
    }

    pub fn wants_upgrade(&self) -> bool {
        self.headers.contains_key(header::UPGRADE)
            && self.headers.get_all(header::CONNECTION).iter().any(|value| {
                value
                    .to_str()
                    .map(|list| {
                        list.split(',')
                            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
                    })
                    .unwrap_or(false)
            })
    }

    pub fn content_length(&self) -> u64 {
        match self.body_plan {
            BodyPlan::Fixed(length) => length,
            _ => 0,
        }
    }

    pub fn user_agent(&self) -> &str {
        self.header_str(header::USER_AGENT)
    }

    pub fn content_type(&self) -> &str {
        self.header_str(header::CONTENT_TYPE)
    }

    /// Client address for the access log: a forwarded chain wins over the
    /// socket peer.
    pub fn remote_addr(&self) -> String {
        match self
            .headers
            .get(super::headers::X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
        {
            Some(forwarded) if !forwarded.is_empty() => forwarded.to_string(),
            _ => self.peer.to_string(),
        }
    }

    fn header_str(&self, name: header::HeaderName) -> &str {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
    }
}

fn split_target(target: &str) -> (String, String) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target.to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn head(target: &str, pairs: &[(&str, &str)]) -> Http1RequestHead {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                header::HeaderName::try_from(*name).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        Http1RequestHead {
            method: Method::GET,
            target: target.to_string(),
            headers,
            content_length: None,
            chunked: false,
            expect_continue: false,
            connection_close: false,
        }
    }

    fn peer() -> SocketAddr {
        "198.51.100.9:4711".parse().unwrap()
    }

    #[test]
    fn splits_path_and_query() {
        let request =
            ProxiedRequest::from_head(head("/a/b?x=1&y=2", &[]), peer(), Scheme::Http);
        assert_eq!(request.path, "/a/b");
        assert_eq!(request.query, "x=1&y=2");

        let bare = ProxiedRequest::from_head(head("/a/b", &[]), peer(), Scheme::Http);
        assert_eq!(bare.path, "/a/b");
        assert_eq!(bare.query, "");
    }

    #[test]
    fn detects_upgrade_requests() {
        let request = ProxiedRequest::from_head(
            head("/ws", &[("connection", "Upgrade"), ("upgrade", "websocket")]),
            peer(),
            Scheme::Http,
        );
        assert!(request.wants_upgrade());

        let plain = ProxiedRequest::from_head(head("/", &[]), peer(), Scheme::Http);
        assert!(!plain.wants_upgrade());
    }

    #[test]
    fn remote_addr_prefers_forwarded_chain() {
        let request = ProxiedRequest::from_head(
            head("/", &[("x-forwarded-for", "10.1.1.1, 10.2.2.2")]),
            peer(),
            Scheme::Http,
        );
        assert_eq!(request.remote_addr(), "10.1.1.1, 10.2.2.2");

        let bare = ProxiedRequest::from_head(head("/", &[]), peer(), Scheme::Http);
        assert_eq!(bare.remote_addr(), "198.51.100.9:4711");
    }
}
