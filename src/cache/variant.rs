use http::{HeaderMap, Method, header};

use super::CacheKey;

/// Per-request view of the `Vary` mechanics: knows how to derive the cache
/// key for the request, optionally refined by the Vary header names learned
/// from a response (or from a stored entry's variant snapshot).
#[derive(Debug, Clone)]
pub struct Variant {
    method: Method,
    path: String,
    canonical_query: String,
    host: String,
    request_headers: HeaderMap,
    header_names: Vec<String>,
}

impl Variant {
    pub fn new(
        method: &Method,
        path: &str,
        query: &str,
        host: &str,
        request_headers: &HeaderMap,
    ) -> Self {
        Self {
            method: method.clone(),
            path: path.to_string(),
            canonical_query: canonicalize_query(query),
            host: host.to_string(),
            request_headers: request_headers.clone(),
            header_names: Vec::new(),
        }
    }

    /// Adopt the Vary list carried by a response's headers.
    pub fn set_response_headers(&mut self, response_headers: &HeaderMap) {
        self.header_names = parse_vary_header(response_headers);
    }

    /// Adopt the Vary list recorded in a stored variant snapshot.
    pub fn set_stored_names(&mut self, snapshot: &[(String, String)]) {
        let mut names: Vec<String> = snapshot
            .iter()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect();
        names.sort();
        names.dedup();
        self.header_names = names;
    }

    pub fn header_names(&self) -> &[String] {
        &self.header_names
    }

    /// A response that says `Vary: *` matches nothing and must not be stored.
    pub fn varies_on_everything(&self) -> bool {
        self.header_names.iter().any(|name| name == "*")
    }

    pub fn cache_key(&self) -> CacheKey {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.method.as_str().as_bytes());
        hasher.update(self.path.as_bytes());
        hasher.update(self.canonical_query.as_bytes());
        hasher.update(self.host.as_bytes());

        for name in &self.header_names {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(self.request_value(name).as_bytes());
        }

        let digest = hasher.finalize();
        let mut key = [0u8; 8];
        key.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(key)
    }

    /// True when the current request carries the same values for every
    /// Vary-named header as the stored snapshot.
    pub fn matches(&self, snapshot: &[(String, String)]) -> bool {
        self.header_names.iter().all(|name| {
            let stored = snapshot
                .iter()
                .find(|(stored_name, _)| stored_name.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
                .unwrap_or("");
            self.request_value(name) == stored
        })
    }

    /// Projects the request onto the Vary-named headers, forming the
    /// snapshot persisted next to the cached response.
    pub fn variant_header(&self) -> Vec<(String, String)> {
        self.header_names
            .iter()
            .map(|name| (name.clone(), self.request_value(name).to_string()))
            .collect()
    }

    fn request_value(&self, name: &str) -> &str {
        self.request_headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
    }
}

fn parse_vary_header(response_headers: &HeaderMap) -> Vec<String> {
    let mut names = Vec::new();
    for value in response_headers.get_all(header::VARY) {
        let Ok(list) = value.to_str() else { continue };
        for name in list.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            names.push(name.to_ascii_lowercase());
        }
    }
    names.sort();
    names.dedup();
    names
}

/// Sorts `key=value` pairs so equivalent query strings share a cache key
/// regardless of parameter order.
fn canonicalize_query(query: &str) -> String {
    let mut pairs: Vec<&str> = query.split('&').filter(|pair| !pair.is_empty()).collect();
    pairs.sort_unstable();
    pairs.join("&")
}
