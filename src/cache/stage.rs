use std::time::SystemTime;

use http::{HeaderMap, Method, StatusCode, header};
use tracing::{debug, warn};

use super::{CacheKey, CacheableResponse, MemoryCache, Variant};

/// Outcome of the request-time cache probe.
pub enum CacheLookup {
    /// The request can never be served from (or stored into) the cache.
    Bypass,
    /// Replay this stored response.
    Hit(CacheableResponse),
    /// Not cached; the carried state lets the response be stored afterwards.
    Miss(CacheMiss),
}

/// State threaded from the lookup to the post-response store: the variant
/// holds the request identity, `base_key` the Vary-less probe key.
pub struct CacheMiss {
    variant: Variant,
    base_key: CacheKey,
}

/// Requests that must not touch the cache: non-idempotent methods,
/// connection upgrades, and range requests (partial responses are never
/// stored, so serving them from a full-body entry would be wrong).
pub fn should_bypass(method: &Method, request_headers: &HeaderMap) -> bool {
    if method != Method::GET && method != Method::HEAD {
        return true;
    }
    if request_headers.contains_key(header::RANGE) {
        return true;
    }
    if header_has_token(request_headers, header::CONNECTION, "upgrade") {
        return true;
    }
    header_has_token(request_headers, header::UPGRADE, "websocket")
}

/// Two-phase, Vary-correct lookup.
///
/// `Vary` is carried by responses, so the first probe uses a key derived
/// from the request line alone. When that finds a candidate, its stored
/// Vary list refines the key for a second probe, and the stored variant
/// snapshot is checked against the live request before the hit is served.
pub fn lookup(
    cache: &MemoryCache,
    method: &Method,
    path: &str,
    query: &str,
    host: &str,
    request_headers: &HeaderMap,
) -> CacheLookup {
    if should_bypass(method, request_headers) {
        return CacheLookup::Bypass;
    }

    let variant = Variant::new(method, path, query, host, request_headers);
    let base_key = variant.cache_key();
    let miss = |variant| CacheLookup::Miss(CacheMiss { variant, base_key });

    let Some(candidate) = fetch(cache, base_key, path) else {
        return miss(variant);
    };

    if candidate.variant.is_empty() {
        return CacheLookup::Hit(candidate);
    }

    let mut variant = variant;
    variant.set_stored_names(&candidate.variant);
    let variant_key = variant.cache_key();

    match fetch(cache, variant_key, path) {
        Some(stored) if variant.matches(&stored.variant) => CacheLookup::Hit(stored),
        _ => miss(variant),
    }
}

/// Evaluates the captured response and stores it when it qualifies. Runs
/// after the client has the full response, so failures only cost a log line.
pub fn store(
    cache: &MemoryCache,
    miss: CacheMiss,
    status: StatusCode,
    response_headers: &HeaderMap,
    body: Vec<u8>,
    path: &str,
) {
    let CacheMiss {
        mut variant,
        base_key,
    } = miss;

    variant.set_response_headers(response_headers);
    if variant.varies_on_everything() {
        return;
    }

    let mut response = CacheableResponse::new(status, response_headers.clone(), body);
    let Some(expires_at) = response.cacheability() else {
        return;
    };

    response.strip_private_headers();
    response.variant = variant.variant_header();

    let encoded = match response.encode() {
        Ok(encoded) => encoded,
        Err(err) => {
            warn!(path, error = %err, "failed to encode response for caching");
            return;
        }
    };

    let variant_key = variant.cache_key();
    store_entry(cache, variant_key, &encoded, expires_at);
    if variant_key != base_key {
        // The Vary-less entry lets the first probe discover the Vary list;
        // the snapshot validation keeps it from serving the wrong variant.
        store_entry(cache, base_key, &encoded, expires_at);
    }
    debug!(path, "cached response");
}

fn store_entry(cache: &MemoryCache, key: CacheKey, encoded: &[u8], expires_at: SystemTime) {
    cache.set(key, encoded.to_vec(), expires_at);
}

fn fetch(cache: &MemoryCache, key: CacheKey, path: &str) -> Option<CacheableResponse> {
    let buffer = cache.get(key)?;
    match CacheableResponse::decode(&buffer) {
        Ok(response) => Some(response),
        Err(err) => {
            warn!(path, error = %err, "failed to decode cached response");
            None
        }
    }
}

fn header_has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|list| {
                list.split(',')
                    .any(|item| item.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn cache() -> MemoryCache {
        MemoryCache::new(1024 * 1024, 1024 * 1024)
    }

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

    fn do_lookup(cache: &MemoryCache, req_headers: &HeaderMap) -> CacheLookup {
        lookup(cache, &Method::GET, "/", "", "example.com", req_headers)
    }

    fn cacheable_headers() -> HeaderMap {
        headers(&[("cache-control", "public, max-age=60")])
    }

    #[test]
    fn bypasses_non_get_head_methods() {
        for method in [Method::POST, Method::PUT, Method::DELETE, Method::PATCH] {
            assert!(should_bypass(&method, &HeaderMap::new()), "{method}");
        }
        assert!(!should_bypass(&Method::GET, &HeaderMap::new()));
        assert!(!should_bypass(&Method::HEAD, &HeaderMap::new()));
    }

    #[test]
    fn bypasses_upgrades_and_ranges() {
        assert!(should_bypass(
            &Method::GET,
            &headers(&[("connection", "Upgrade")])
        ));
        assert!(should_bypass(
            &Method::GET,
            &headers(&[("upgrade", "websocket")])
        ));
        assert!(should_bypass(
            &Method::GET,
            &headers(&[("range", "bytes=0-1")])
        ));
        assert!(!should_bypass(
            &Method::GET,
            &headers(&[("connection", "keep-alive")])
        ));
    }

    #[test]
    fn miss_then_store_then_hit() {
        let cache = cache();
        let req = HeaderMap::new();

        let CacheLookup::Miss(miss) = do_lookup(&cache, &req) else {
            panic!("expected a miss on an empty cache");
        };
        store(
            &cache,
            miss,
            StatusCode::OK,
            &cacheable_headers(),
            b"hello".to_vec(),
            "/",
        );

        match do_lookup(&cache, &req) {
            CacheLookup::Hit(hit) => assert_eq!(hit.body, b"hello"),
            _ => panic!("expected a hit after storing"),
        }
    }

    #[test]
    fn uncacheable_responses_are_not_stored() {
        let cache = cache();
        let req = HeaderMap::new();

        let CacheLookup::Miss(miss) = do_lookup(&cache, &req) else {
            panic!("expected a miss");
        };
        store(
            &cache,
            miss,
            StatusCode::OK,
            &headers(&[("cache-control", "private, max-age=60")]),
            b"secret".to_vec(),
            "/",
        );
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn vary_produces_distinct_entries_per_variant() {
        let cache = cache();
        let json = headers(&[("accept", "application/json")]);
        let text = headers(&[("accept", "text/plain")]);
        let mut resp_headers = cacheable_headers();
        resp_headers.insert(header::VARY, HeaderValue::from_static("Accept"));

        let CacheLookup::Miss(miss) = do_lookup(&cache, &json) else {
            panic!("first json request should miss");
        };
        store(&cache, miss, StatusCode::OK, &resp_headers, b"json".to_vec(), "/");

        // Different Accept must not hit the json entry.
        let CacheLookup::Miss(miss) = do_lookup(&cache, &text) else {
            panic!("first text request should miss");
        };
        store(&cache, miss, StatusCode::OK, &resp_headers, b"text".to_vec(), "/");

        match do_lookup(&cache, &json) {
            CacheLookup::Hit(hit) => assert_eq!(hit.body, b"json"),
            _ => panic!("json variant should hit"),
        }
        match do_lookup(&cache, &text) {
            CacheLookup::Hit(hit) => assert_eq!(hit.body, b"text"),
            _ => panic!("text variant should hit"),
        }
    }

    #[test]
    fn vary_star_is_never_stored() {
        let cache = cache();
        let req = HeaderMap::new();
        let mut resp_headers = cacheable_headers();
        resp_headers.insert(header::VARY, HeaderValue::from_static("*"));

        let CacheLookup::Miss(miss) = do_lookup(&cache, &req) else {
            panic!("expected a miss");
        };
        store(&cache, miss, StatusCode::OK, &resp_headers, b"body".to_vec(), "/");
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn stored_entries_lose_set_cookie() {
        let cache = cache();
        let req = HeaderMap::new();
        let mut resp_headers = cacheable_headers();
        resp_headers.append(header::SET_COOKIE, HeaderValue::from_static("session=1"));

        let CacheLookup::Miss(miss) = do_lookup(&cache, &req) else {
            panic!("expected a miss");
        };
        store(&cache, miss, StatusCode::OK, &resp_headers, b"body".to_vec(), "/");

        match do_lookup(&cache, &req) {
            CacheLookup::Hit(hit) => assert!(hit.headers.get(header::SET_COOKIE).is_none()),
            _ => panic!("expected a hit"),
        }
    }

    #[test]
    fn corrupt_entries_read_as_misses() {
        let cache = cache();
        let req = HeaderMap::new();
        let variant = Variant::new(&Method::GET, "/", "", "example.com", &req);
        cache.set(
            variant.cache_key(),
            b"garbage".to_vec(),
            SystemTime::now() + std::time::Duration::from_secs(60),
        );

        assert!(matches!(do_lookup(&cache, &req), CacheLookup::Miss(_)));
    }
}
