//! # Ekam Net
//!
//! Request/response model and network access for the Ekam offline cache.
//!
//! ## Design Goals
//!
//! 1. **One seam**: everything the cache controller needs from the network
//!    goes through the [`Fetcher`] trait, so tests can swap the network out.
//! 2. **Response types**: responses carry a [`ResponseType`] derived from
//!    their origin, which decides whether they may ever be cached.
//! 3. **Classified failures**: every rejected fetch maps to a
//!    [`FetchErrorKind`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use thiserror::Error;
use url::Url;

pub mod loader;
pub mod origin;

pub use loader::{HttpFetcher, LoaderConfig};
pub use origin::Origin;

/// Accept header sent for page navigations.
pub const NAVIGATION_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Network unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Why a fetch was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Offline, DNS failure, connection refused.
    Unavailable,
    /// The deadline expired before a response arrived.
    TimedOut,
    /// A response arrived but could not be read.
    Malformed,
}

impl FetchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::Unavailable => "network-unavailable",
            FetchErrorKind::TimedOut => "timed-out",
            FetchErrorKind::Malformed => "malformed-response",
        }
    }
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl NetError {
    /// Classify this failure.
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            NetError::Unavailable(_) => FetchErrorKind::Unavailable,
            NetError::Timeout(_) => FetchErrorKind::TimedOut,
            NetError::Malformed(_) | NetError::InvalidUrl(_) => FetchErrorKind::Malformed,
            NetError::HttpError(e) => {
                if e.is_timeout() {
                    FetchErrorKind::TimedOut
                } else if e.is_decode() || e.is_body() {
                    FetchErrorKind::Malformed
                } else {
                    FetchErrorKind::Unavailable
                }
            }
        }
    }
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Request mode, as seen by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// A full document load (address bar, link click).
    Navigate,
    /// Same-origin only.
    SameOrigin,
    /// Sub-resource loads (images, stylesheets, scripts).
    #[default]
    NoCors,
    /// Script-initiated cross-origin fetch.
    Cors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub mode: RequestMode,
    pub body: Option<Bytes>,
}

impl Request {
    /// Create a GET sub-resource request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            mode: RequestMode::NoCors,
            body: None,
        }
    }

    /// Create a navigation request.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
        .accept(NAVIGATION_ACCEPT)
    }

    /// Set the method.
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set the mode.
    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the Accept header. Invalid values are ignored.
    pub fn accept(mut self, value: &str) -> Self {
        if let Ok(v) = HeaderValue::from_str(value) {
            self.headers.insert(ACCEPT, v);
        }
        self
    }

    /// Set the body.
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// Whether this is a full document load.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Whether the Accept header mentions `text/html`.
    pub fn accepts_html(&self) -> bool {
        self.headers
            .get(ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("text/html"))
    }
}

/// How much of a response the page is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Same-origin and fully inspectable.
    #[default]
    Basic,
    /// Cross-origin, readable through CORS.
    Cors,
    /// Cross-origin without CORS.
    Opaque,
    /// A redirect that was not followed.
    OpaqueRedirect,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Basic => "basic",
            ResponseType::Cors => "cors",
            ResponseType::Opaque => "opaque",
            ResponseType::OpaqueRedirect => "opaqueredirect",
        }
    }
}

/// HTTP response with its body fully loaded.
///
/// Cloning is cheap: the body is reference-counted.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    pub body: Bytes,
}

impl Response {
    /// Create a basic response.
    pub fn new(url: Url, status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            response_type: ResponseType::Basic,
            body: body.into(),
        }
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Set the Content-Type header. Invalid values are ignored.
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        if let Ok(v) = HeaderValue::from_str(content_type) {
            self.headers.insert(CONTENT_TYPE, v);
        }
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Only exactly-200 same-origin responses may be stored.
    pub fn is_cacheable(&self) -> bool {
        self.status == StatusCode::OK && self.response_type == ResponseType::Basic
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Parsed Content-Type.
    pub fn content_type(&self) -> Option<Mime> {
        self.header(CONTENT_TYPE.as_str())
            .and_then(|s| s.parse::<Mime>().ok())
    }
}

/// Anything that can satisfy a request from the network.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}
