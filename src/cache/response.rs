use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use http::{HeaderMap, StatusCode, header};
use serde::{Deserialize, Serialize};

/// A captured upstream response in the shape the cache stores: status,
/// headers, the (uncompressed) body, and the Vary-named request header
/// snapshot taken at insertion time.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheableResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub variant: Vec<(String, String)>,
}

#[derive(Serialize, Deserialize)]
struct PersistedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    variant: Vec<(String, String)>,
}

impl CacheableResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
            variant: Vec::new(),
        }
    }

    /// Applies the cacheability rules to the captured state. Returns the
    /// absolute expiry instant when the response may be stored.
    ///
    /// A response is cacheable when its status is 200..=399 (and not 304),
    /// `Cache-Control` names `public` but not `no-cache`, and a positive TTL
    /// can be derived from `s-max-age` (preferred) or `max-age`.
    pub fn cacheability(&self) -> Option<SystemTime> {
        let status = self.status.as_u16();
        if !(200..=399).contains(&status) || self.status == StatusCode::NOT_MODIFIED {
            return None;
        }

        let directives = cache_control_directives(&self.headers);
        let has = |name: &str| directives.iter().any(|(n, _)| n == name);
        if !has("public") || has("no-cache") {
            return None;
        }

        let ttl = directive_seconds(&directives, "s-max-age")
            .or_else(|| directive_seconds(&directives, "max-age"))?;
        if ttl == 0 {
            return None;
        }

        Some(SystemTime::now() + Duration::from_secs(ttl))
    }

    /// Cookies must never be replayed to other clients.
    pub fn strip_private_headers(&mut self) {
        self.headers.remove(header::SET_COOKIE);
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let persisted = PersistedResponse {
            status: self.status.as_u16(),
            headers: headermap_to_vec(&self.headers),
            body: self.body.clone(),
            variant: self.variant.clone(),
        };
        rmp_serde::to_vec(&persisted).context("failed to encode cached response")
    }

    pub fn decode(buffer: &[u8]) -> Result<Self> {
        let persisted: PersistedResponse =
            rmp_serde::from_slice(buffer).context("failed to decode cached response")?;
        let status = StatusCode::from_u16(persisted.status)
            .context("cached response has invalid status code")?;
        Ok(Self {
            status,
            headers: to_headermap(&persisted.headers),
            body: persisted.body,
            variant: persisted.variant,
        })
    }
}

/// Comma-separated `Cache-Control` directives as `(lowercased name, value)`
/// pairs; the value is whatever follows the first `=`, if anything.
pub fn cache_control_directives(headers: &HeaderMap) -> Vec<(String, Option<String>)> {
    let mut directives = Vec::new();
    for value in headers.get_all(header::CACHE_CONTROL) {
        let Ok(list) = value.to_str() else { continue };
        for part in list.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (name, value) = match part.split_once('=') {
                Some((name, value)) => (name, Some(value.trim().to_string())),
                None => (part, None),
            };
            directives.push((name.trim().to_ascii_lowercase(), value));
        }
    }
    directives
}

fn directive_seconds(directives: &[(String, Option<String>)], name: &str) -> Option<u64> {
    directives
        .iter()
        .find(|(directive, _)| directive == name)
        .and_then(|(_, value)| value.as_deref())
        .and_then(|value| value.parse::<u64>().ok())
}

fn to_headermap(items: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in items {
        if let (Ok(name), Ok(value)) = (
            header::HeaderName::try_from(name.as_str()),
            http::HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}

fn headermap_to_vec(map: &HeaderMap) -> Vec<(String, String)> {
    let mut items = Vec::new();
    for (name, value) in map.iter() {
        if let Ok(value_str) = value.to_str() {
            items.push((name.as_str().to_string(), value_str.to_string()));
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn response_with_cache_control(value: &str) -> CacheableResponse {
        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_str(value).unwrap());
        CacheableResponse::new(StatusCode::OK, headers, b"body".to_vec())
    }

    #[test]
    fn cacheable_with_public_and_max_age() {
        let response = response_with_cache_control("public, max-age=60");
        let expires = response.cacheability().expect("cacheable");
        assert!(expires > SystemTime::now());
    }

    #[test]
    fn prefers_s_max_age_over_max_age() {
        let response = response_with_cache_control("public, s-max-age=3600, max-age=1");
        let expires = response.cacheability().expect("cacheable");
        assert!(expires > SystemTime::now() + Duration::from_secs(1800));
    }

    #[test]
    fn not_cacheable_without_public() {
        assert!(response_with_cache_control("max-age=60").cacheability().is_none());
    }

    #[test]
    fn not_cacheable_with_no_cache() {
        let response = response_with_cache_control("public, no-cache, max-age=60");
        assert!(response.cacheability().is_none());
    }

    #[test]
    fn not_cacheable_without_positive_ttl() {
        assert!(response_with_cache_control("public").cacheability().is_none());
        assert!(
            response_with_cache_control("public, max-age=0")
                .cacheability()
                .is_none()
        );
        assert!(
            response_with_cache_control("public, max-age=nope")
                .cacheability()
                .is_none()
        );
    }

    #[test]
    fn directive_values_do_not_fake_directives() {
        // "public" appearing inside a value must not satisfy the rule.
        let response = response_with_cache_control("private=\"public\", max-age=60");
        assert!(response.cacheability().is_none());
    }

    #[test]
    fn not_cacheable_outside_status_window() {
        for status in [
            StatusCode::NOT_MODIFIED,
            StatusCode::BAD_REQUEST,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::CONTINUE,
        ] {
            let mut response = response_with_cache_control("public, max-age=60");
            response.status = status;
            assert!(response.cacheability().is_none(), "{status} must not cache");
        }

        let mut redirect = response_with_cache_control("public, max-age=60");
        redirect.status = StatusCode::MOVED_PERMANENTLY;
        assert!(redirect.cacheability().is_some());
    }

    #[test]
    fn strip_private_headers_removes_set_cookie() {
        let mut response = response_with_cache_control("public, max-age=60");
        response
            .headers
            .append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        response.strip_private_headers();
        assert!(response.headers.get(header::SET_COOKIE).is_none());
    }

    #[test]
    fn encode_decode_round_trips_every_field() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        headers.append(header::VARY, HeaderValue::from_static("Accept"));
        headers.append(
            header::CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=60"),
        );
        let mut response = CacheableResponse::new(
            StatusCode::CREATED,
            headers,
            b"<h1>hello</h1>".to_vec(),
        );
        response.variant = vec![("accept".to_string(), "text/html".to_string())];

        let decoded = CacheableResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(CacheableResponse::decode(b"not msgpack").is_err());
    }
}
