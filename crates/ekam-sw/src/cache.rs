//! Cache generations and the storage that holds them.
//!
//! ```text
//! CacheStorage
//!     ├── "ekam-cache-v4"  (stale, deleted on activate)
//!     └── "ekam-cache-v5"
//!             └── "GET https://…/properties" → CacheEntry
//! ```

use std::path::Path;

use bytes::Bytes;
use ekam_net::{Request, Response, ResponseType};
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use url::Url;

use crate::ServiceWorkerError;

/// Key for a request: method plus URL. Fragments never reach the server,
/// so they are not part of the key.
pub fn cache_key(method: &Method, url: &Url) -> String {
    if url.fragment().is_none() {
        return format!("{} {}", method, url);
    }
    let mut url = url.clone();
    url.set_fragment(None);
    format!("{} {}", method, url)
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers in arrival order. Repeated names keep every value.
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for `request`.
    pub fn from_response(request: &Request, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();

        Self {
            url: request.url.to_string(),
            method: request.method.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.clone(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild a response from this entry.
    pub fn to_response(&self) -> Result<Response, ServiceWorkerError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ServiceWorkerError::Cache(format!("bad url in entry: {e}")))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::Cache(format!("bad status in entry: {e}")))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| ServiceWorkerError::Cache(format!("bad header name in entry: {e}")))?;
            let value = HeaderValue::from_bytes(value)
                .map_err(|e| ServiceWorkerError::Cache(format!("bad value for {name} in entry: {e}")))?;
            headers.append(name, value);
        }

        Ok(Response {
            url,
            status,
            headers,
            response_type: ResponseType::Basic,
            body: self.body.clone(),
        })
    }
}

/// One cache generation.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Exact match on method and URL.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.entries.get(&cache_key(&request.method, &request.url))
    }

    /// Exact GET match on a URL.
    pub fn match_url(&self, url: &Url) -> Option<&CacheEntry> {
        self.entries.get(&cache_key(&Method::GET, url))
    }

    /// Store a response. Replaces any earlier entry for the same request.
    pub fn put(&mut self, request: &Request, response: &Response) {
        let key = cache_key(&request.method, &request.url);
        trace!(cache = %self.name, %key, "Cache put");
        self.entries
            .insert(key, CacheEntry::from_response(request, response));
    }

    /// Delete entry.
    pub fn delete(&mut self, request: &Request) -> bool {
        self.entries
            .remove(&cache_key(&request.method, &request.url))
            .is_some()
    }

    /// All keys.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All cache generations.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// All cache names, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.keys().cloned().collect();
        names.sort();
        names
    }

    /// Read storage from a JSON snapshot. A missing file yields empty storage.
    pub fn load(path: &Path) -> Result<Self, ServiceWorkerError> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No cache snapshot, starting empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };
        let storage: Self = serde_json::from_slice(&raw)?;
        debug!(path = %path.display(), caches = storage.caches.len(), "Cache snapshot loaded");
        Ok(storage)
    }

    /// Write storage to a JSON snapshot, replacing the file atomically.
    pub fn save(&self, path: &Path) -> Result<(), ServiceWorkerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(self)?)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), caches = self.caches.len(), "Cache snapshot saved");
        Ok(())
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
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
    use http::header::LINK;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn page(path: &str, body: &'static str) -> (Request, Response) {
        let u = url("https://ekam.example/").join(path).unwrap();
        let response = Response::new(u.clone(), StatusCode::OK, body)
            .with_content_type("text/html; charset=utf-8");
        (Request::get(u), response)
    }

    #[test]
    fn test_cache_put_and_match() {
        let mut cache = Cache::new("ekam-cache-v5");
        let (request, response) = page("/properties", "<h1>Annonces</h1>");

        cache.put(&request, &response);

        let entry = cache.match_request(&request).unwrap();
        assert_eq!(entry.status, 200);
        assert_eq!(&entry.body[..], b"<h1>Annonces</h1>");
        assert!(cache.match_url(&url("https://ekam.example/properties")).is_some());
        assert!(cache.match_url(&url("https://ekam.example/login")).is_none());
    }

    #[test]
    fn test_match_is_method_sensitive() {
        let mut cache = Cache::new("v1");
        let (request, response) = page("/api/properties", "[]");
        cache.put(&request, &response);

        let head = request.clone().with_method(Method::HEAD);
        assert!(cache.match_request(&head).is_none());
    }

    #[test]
    fn test_put_is_last_write_wins() {
        let mut cache = Cache::new("v1");
        let (request, first) = page("/", "old");
        let (_, second) = page("/", "new");

        cache.put(&request, &first);
        cache.put(&request, &second);

        assert_eq!(cache.len(), 1);
        assert_eq!(&cache.match_request(&request).unwrap().body[..], b"new");
    }

    #[test]
    fn test_cache_delete() {
        let mut cache = Cache::new("v1");
        let (request, response) = page("/static/css/style.css", "body{}");
        cache.put(&request, &response);

        assert!(cache.delete(&request));
        assert!(!cache.delete(&request));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_entry_round_trips_to_response() {
        let (request, response) = page("/licence", "<p>Licence</p>");
        let entry = CacheEntry::from_response(&request, &response);
        let rebuilt = entry.to_response().unwrap();

        assert_eq!(rebuilt.status, StatusCode::OK);
        assert_eq!(rebuilt.response_type, ResponseType::Basic);
        assert_eq!(rebuilt.body, response.body);
        assert_eq!(
            rebuilt.header("content-type"),
            Some("text/html; charset=utf-8")
        );
    }

    #[test]
    fn test_cache_storage() {
        let mut storage = CacheStorage::new();
        assert!(!storage.has("ekam-cache-v5"));

        storage.open("ekam-cache-v4");
        storage.open("ekam-cache-v5");
        assert_eq!(storage.keys(), vec!["ekam-cache-v4", "ekam-cache-v5"]);

        assert!(storage.delete("ekam-cache-v4"));
        assert!(!storage.delete("ekam-cache-v4"));
        assert_eq!(storage.keys(), vec!["ekam-cache-v5"]);
    }

    #[test]
    fn test_repeated_headers_survive_the_cache() {
        let (request, response) = page("/properties", "<h1>Annonces</h1>");
        let mut response = response;
        response.headers.append(LINK, HeaderValue::from_static("</static/css/style.css>; rel=preload"));
        response.headers.append(LINK, HeaderValue::from_static("</static/js/main.js>; rel=preload"));
        response.headers.append(
            HeaderName::from_static("x-agence"),
            HeaderValue::from_bytes(b"Agence \xe9toile").unwrap(),
        );

        let rebuilt = CacheEntry::from_response(&request, &response)
            .to_response()
            .unwrap();

        let links: Vec<_> = rebuilt.headers.get_all(LINK).iter().collect();
        assert_eq!(links.len(), 2);
        assert_eq!(links, response.headers.get_all(LINK).iter().collect::<Vec<_>>());
        assert_eq!(
            rebuilt.headers.get("x-agence").map(|v| v.as_bytes()),
            Some(&b"Agence \xe9toile"[..])
        );
    }

    #[test]
    fn test_fragment_is_ignored_when_matching() {
        let mut cache = Cache::new("ekam-cache-v5");
        let (request, response) = page("/properties", "<h1>Annonces</h1>");
        cache.put(&request, &response);

        assert!(cache.match_url(&url("https://ekam.example/properties#map")).is_some());
        let with_fragment = Request::get(url("https://ekam.example/properties#photos"));
        assert!(cache.match_request(&with_fragment).is_some());
        assert_eq!(
            cache_key(&Method::GET, &url("https://ekam.example/properties#map")),
            "GET https://ekam.example/properties"
        );
    }

    #[test]
    fn test_snapshot_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("caches.json");

        let mut storage = CacheStorage::new();
        let (request, _) = page("/static/images/no-image.jpg", "");
        let image = Response::new(request.url.clone(), StatusCode::OK, vec![0xffu8, 0xd8, 0xff, 0x00])
            .with_content_type("image/jpeg");
        storage.open("ekam-cache-v5").put(&request, &image);
        storage.save(&path).unwrap();

        let loaded = CacheStorage::load(&path).unwrap();
        let entry = loaded
            .get("ekam-cache-v5")
            .and_then(|c| c.match_request(&request))
            .unwrap();
        assert_eq!(&entry.body[..], &[0xff, 0xd8, 0xff, 0x00]);
        assert_eq!(
            entry.headers,
            vec![("content-type".to_string(), b"image/jpeg".to_vec())]
        );
    }

    #[test]
    fn test_load_missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CacheStorage::load(&dir.path().join("absent.json")).unwrap();
        assert!(storage.keys().is_empty());
    }
}
