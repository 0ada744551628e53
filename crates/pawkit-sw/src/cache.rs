//! Cache buckets and their entries.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use pawkit_net::{Request, Response};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::ServiceWorkerError;

/// Identity of a cached request: method plus URL without its fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    /// Key for an arbitrary method and URL.
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.into(),
        }
    }

    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    /// Key identifying `request`.
    pub fn for_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A stored duplicate of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request identity the entry answers.
    pub key: RequestKey,

    /// Final URL of the response.
    pub response_url: String,

    /// Response status.
    pub status: u16,

    /// Response headers, in arrival order.
    pub headers: Vec<StoredHeader>,

    /// Response body.
    #[serde(with = "bytes_base64")]
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

/// One response header. The value is kept as raw bytes, since header values
/// need not be valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHeader {
    pub name: String,
    #[serde(with = "bytes_base64")]
    pub value: Bytes,
}

impl CacheEntry {
    /// Duplicate `response` as an entry for `key`.
    pub fn from_response(key: RequestKey, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| StoredHeader {
                name: name.as_str().to_string(),
                value: Bytes::copy_from_slice(value.as_bytes()),
            })
            .collect();

        Self {
            key,
            response_url: response.url.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.clone(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild the response this entry was made from.
    pub fn to_response(&self) -> Result<Response, ServiceWorkerError> {
        let url = Url::parse(&self.response_url).map_err(|e| {
            ServiceWorkerError::CacheError(format!("entry {} has bad URL: {e}", self.key))
        })?;
        let status = StatusCode::from_u16(self.status).map_err(|_| {
            ServiceWorkerError::CacheError(format!("entry {} has bad status {}", self.key, self.status))
        })?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for header in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(header.name.as_str()),
                HeaderValue::from_bytes(&header.value),
            ) {
                headers.append(name, value);
            }
        }

        Ok(Response {
            url,
            status,
            headers,
            body: self.body.clone(),
        })
    }
}

/// A named bucket of cached responses.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    /// Cache name (the worker version that owns it).
    pub name: String,

    /// Creation order among buckets in the same storage.
    pub(crate) created_seq: u64,

    entries: HashMap<RequestKey, CacheEntry>,
}

impl Cache {
    /// Create an empty bucket.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            created_seq: 0,
            entries: HashMap::new(),
        }
    }

    pub(crate) fn with_entries(name: &str, created_seq: u64, entries: Vec<CacheEntry>) -> Self {
        let mut cache = Self::new(name);
        cache.created_seq = created_seq;
        for entry in entries {
            cache.put(entry);
        }
        cache
    }

    /// Match a request identity.
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store an entry, replacing any previous entry for the same key.
    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key.clone(), entry);
    }

    /// Delete an entry.
    pub fn delete(&mut self, key: &RequestKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All request identities in the bucket.
    pub fn keys(&self) -> Vec<&RequestKey> {
        self.entries.keys().collect()
    }

    /// All entries in the bucket.
    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bucket holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

mod bytes_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONTENT_TYPE;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn entry_for(s: &str, body: &'static str) -> CacheEntry {
        let response = Response::new(url(s), StatusCode::OK, body);
        CacheEntry::from_response(RequestKey::get(&url(s)), &response)
    }

    #[test]
    fn test_request_key_ignores_fragment() {
        let a = RequestKey::get(&url("https://example.com/index.html#feeding"));
        let b = RequestKey::get(&url("https://example.com/index.html"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_request_key_includes_method_and_query() {
        let get = RequestKey::get(&url("https://example.com/js/main.min.js"));
        let head = RequestKey::new(&Method::HEAD, &url("https://example.com/js/main.min.js"));
        let query = RequestKey::get(&url("https://example.com/js/main.min.js?v=2"));
        assert_ne!(get, head);
        assert_ne!(get, query);
        assert_eq!(get.to_string(), "GET https://example.com/js/main.min.js");
    }

    #[test]
    fn test_entry_round_trips_to_response() {
        let response = Response::new(url("https://example.com/manifest.json"), StatusCode::OK, "{}")
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/manifest+json"));
        let entry = CacheEntry::from_response(
            RequestKey::get(&url("https://example.com/manifest.json")),
            &response,
        );

        let restored = entry.to_response().unwrap();
        assert_eq!(restored.status, StatusCode::OK);
        assert_eq!(restored.body, response.body);
        assert_eq!(restored.header("content-type"), Some("application/manifest+json"));
    }

    #[test]
    fn test_entry_keeps_non_utf8_header_values() {
        let latin1 = HeaderValue::from_bytes(b"Gilda Caf\xe9").unwrap();
        let response = Response::new(url("https://example.com/images/gilda.jpg"), StatusCode::OK, "jpg")
            .with_header(HeaderName::from_static("x-dog-name"), latin1.clone());
        let entry = CacheEntry::from_response(
            RequestKey::get(&url("https://example.com/images/gilda.jpg")),
            &response,
        );

        let json = serde_json::to_string(&entry).unwrap();
        let back: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);

        let restored = back.to_response().unwrap();
        assert_eq!(restored.headers.get("x-dog-name"), Some(&latin1));
    }

    #[test]
    fn test_entry_keeps_repeated_headers_in_order() {
        let mut response = Response::new(url("https://example.com/"), StatusCode::OK, "<html>");
        response.headers.append("set-cookie", HeaderValue::from_static("walk=am"));
        response.headers.append("set-cookie", HeaderValue::from_static("walk=pm"));
        let entry = CacheEntry::from_response(RequestKey::get(&url("https://example.com/")), &response);

        let restored = entry.to_response().unwrap();
        let cookies: Vec<_> = restored
            .headers
            .get_all("set-cookie")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(cookies, vec!["walk=am", "walk=pm"]);
    }

    #[test]
    fn test_entry_with_bad_status_is_rejected() {
        let mut entry = entry_for("https://example.com/", "<html>");
        entry.status = 1000;
        assert!(matches!(entry.to_response(), Err(ServiceWorkerError::CacheError(_))));
    }

    #[test]
    fn test_entry_body_is_base64_in_json() {
        let entry = entry_for("https://example.com/css/styles.min.css", "body{}");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["body"], "Ym9keXt9");

        let back: CacheEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back.body, Bytes::from_static(b"body{}"));
    }

    #[test]
    fn test_cache() {
        let mut cache = Cache::new("takecareofmydogs-v1.4.0");
        cache.put(entry_for("https://example.com/css/styles.min.css", "body{}"));

        let hit = RequestKey::get(&url("https://example.com/css/styles.min.css"));
        let miss = RequestKey::get(&url("https://example.com/css/other.css"));
        assert!(cache.match_request(&hit).is_some());
        assert!(cache.match_request(&miss).is_none());
    }

    #[test]
    fn test_cache_put_replaces() {
        let mut cache = Cache::new("v1");
        cache.put(entry_for("https://example.com/", "old"));
        cache.put(entry_for("https://example.com/", "new"));

        assert_eq!(cache.len(), 1);
        let key = RequestKey::get(&url("https://example.com/"));
        assert_eq!(cache.match_request(&key).unwrap().body, Bytes::from_static(b"new"));
    }

    #[test]
    fn test_cache_delete() {
        let mut cache = Cache::new("v1");
        cache.put(entry_for("https://example.com/images/lyla.jpg", "jpg"));

        let key = RequestKey::get(&url("https://example.com/images/lyla.jpg"));
        assert!(cache.delete(&key));
        assert!(!cache.delete(&key));
        assert!(cache.is_empty());
    }
}
