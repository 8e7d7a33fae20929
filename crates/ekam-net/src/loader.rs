//! HTTP fetcher backed by `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use reqwest::Client;
use tracing::{debug, info, trace};
use url::Url;

use crate::{Fetcher, NetError, Origin, Request, RequestMode, Response, ResponseType};

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Per-request timeout enforced by the HTTP client.
    pub default_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("ekam-offline/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "fr-FR,fr;q=0.9,en;q=0.8".to_string(),
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Fetches requests from a single upstream origin.
///
/// Redirects are never followed; they come back as
/// [`ResponseType::OpaqueRedirect`].
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
    origin: Origin,
}

impl HttpFetcher {
    /// Create a fetcher for pages served from `origin`.
    pub fn new(origin: &Url, config: LoaderConfig) -> Result<Self, NetError> {
        let origin = Origin::from_url(origin);
        if origin.is_opaque() {
            return Err(NetError::InvalidUrl(format!(
                "origin must be http or https, got {origin}"
            )));
        }

        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        info!(%origin, "HttpFetcher initialized");

        Ok(Self {
            client,
            config,
            origin,
        })
    }

    /// The origin pages are served from.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    fn classify(&self, request: &Request, final_url: &Url, status: StatusCode) -> ResponseType {
        if status.is_redirection() {
            ResponseType::OpaqueRedirect
        } else if self.origin.contains(&request.url) && self.origin.contains(final_url) {
            ResponseType::Basic
        } else if request.mode == RequestMode::NoCors {
            ResponseType::Opaque
        } else {
            ResponseType::Cors
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .header("Accept-Language", &self.config.accept_language);

        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let response_type = self.classify(request, &url, status);

        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            response_type = response_type.as_str(),
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url,
            status,
            headers,
            response_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FetchErrorKind;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert!(config.user_agent.starts_with("ekam-offline/"));
        assert_eq!(config.default_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_opaque_origin() {
        let origin = Url::parse("file:///srv/ekam").unwrap();
        assert!(HttpFetcher::new(&origin, LoaderConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_same_origin_is_basic() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/static/css/style.css"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("body { margin: 0 }", "text/css"),
            )
            .mount(&server)
            .await;

        let origin = Url::parse(&server.uri()).unwrap();
        let fetcher = HttpFetcher::new(&origin, LoaderConfig::default()).unwrap();
        let request = Request::get(origin.join("/static/css/style.css").unwrap());

        let response = fetcher.fetch(&request).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.response_type, ResponseType::Basic);
        assert_eq!(response.content_type(), Some(mime::TEXT_CSS));
        assert_eq!(&response.body[..], b"body { margin: 0 }");
        assert!(response.is_cacheable());
    }

    #[tokio::test]
    async fn test_redirect_is_not_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/profile"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/login"))
            .mount(&server)
            .await;

        let origin = Url::parse(&server.uri()).unwrap();
        let fetcher = HttpFetcher::new(&origin, LoaderConfig::default()).unwrap();
        let request = Request::navigate(origin.join("/user/profile").unwrap());

        let response = fetcher.fetch(&request).await.unwrap();
        assert_eq!(response.status, StatusCode::FOUND);
        assert_eq!(response.response_type, ResponseType::OpaqueRedirect);
        assert!(!response.is_cacheable());
    }

    #[tokio::test]
    async fn test_cross_origin_no_cors_is_opaque() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tiles/1/2/3.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x89, b'P', b'N', b'G']))
            .mount(&server)
            .await;

        let pages = Url::parse("http://ekam.invalid/").unwrap();
        let fetcher = HttpFetcher::new(&pages, LoaderConfig::default()).unwrap();

        let tiles = Url::parse(&server.uri()).unwrap();
        let request = Request::get(tiles.join("/tiles/1/2/3.png").unwrap());
        let response = fetcher.fetch(&request).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Opaque);

        let cors = request.clone().with_mode(RequestMode::Cors);
        let response = fetcher.fetch(&cors).await.unwrap();
        assert_eq!(response.response_type, ResponseType::Cors);
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        let origin = Url::parse("http://127.0.0.1:1/").unwrap();
        let fetcher = HttpFetcher::new(&origin, LoaderConfig::default()).unwrap();

        let err = fetcher.fetch(&Request::get(origin.clone())).await.unwrap_err();
        assert_eq!(err.kind(), FetchErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/properties"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let origin = Url::parse(&server.uri()).unwrap();
        let config = LoaderConfig {
            default_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let fetcher = HttpFetcher::new(&origin, config).unwrap();

        let request = Request::get(origin.join("/api/properties").unwrap());
        let err = fetcher.fetch(&request).await.unwrap_err();
        assert_eq!(err.kind(), FetchErrorKind::TimedOut);
    }
}
