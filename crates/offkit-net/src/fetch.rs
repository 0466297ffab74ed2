//! The network capability.

use std::time::Duration;

use async_trait::async_trait;
use offkit_common::{with_timeout, OffKitError};
use reqwest::Client;
use tracing::{debug, trace};

use crate::{NetError, Request, Response};

/// Performs the actual network fetch for a request.
///
/// Resolving with any response, whatever its status, counts as success.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}

/// Fetch with an outer bound on top of whatever the fetcher does.
///
/// An elapsed bound is reported as [`NetError::Timeout`].
pub async fn fetch_with_timeout(
    fetcher: &dyn Fetcher,
    request: &Request,
    bound: Option<Duration>,
) -> Result<Response, NetError> {
    match with_timeout(bound, || fetcher.fetch(request)).await {
        Ok(result) => result,
        Err(OffKitError::Timeout(elapsed)) => {
            debug!(url = %request.url, ?elapsed, "Fetch timed out");
            Err(NetError::Timeout(elapsed))
        }
        Err(other) => Err(NetError::RequestFailed(other.to_string())),
    }
}

/// HTTP fetcher configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("OffKit/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "en-US,en;q=0.9".to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// reqwest-backed [`Fetcher`].
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        debug!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self { client, config })
    }

    fn map_error(&self, request: &Request, err: reqwest::Error) -> NetError {
        if err.is_timeout() {
            NetError::Timeout(request.timeout.unwrap_or(self.config.default_timeout))
        } else {
            NetError::Http(err)
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        debug!(
            id = request.id.raw(),
            url = %request.url,
            method = %request.method,
            "Fetching resource"
        );

        if !matches!(request.url.scheme(), "http" | "https") {
            return Err(NetError::InvalidUrl(format!(
                "unsupported scheme in {}",
                request.url
            )));
        }

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if !request.headers.contains_key(http::header::ACCEPT_LANGUAGE) {
            req_builder = req_builder.header(
                http::header::ACCEPT_LANGUAGE,
                self.config.accept_language.as_str(),
            );
        }

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder
            .send()
            .await
            .map_err(|e| self.map_error(request, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();

        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_error(request, e))?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response::new(Some(url), status, headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Hanging;

    #[async_trait]
    impl Fetcher for Hanging {
        async fn fetch(&self, _request: &Request) -> Result<Response, NetError> {
            std::future::pending().await
        }
    }

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert!(config.user_agent.starts_with("OffKit/"));
        assert_eq!(config.default_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_http_fetch_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.html"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("<h1>hi</h1>", "text/html"),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/index.html", server.uri())).unwrap();
        let response = fetcher.fetch(&Request::get(url)).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.content_type(), Some("text/html"));
        assert_eq!(response.text_lossy(), "<h1>hi</h1>");
    }

    #[tokio::test]
    async fn test_http_fetch_rejects_non_http_scheme() {
        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse("data:text/plain,hello").unwrap();

        let err = fetcher.fetch(&Request::get(url)).await.unwrap_err();
        assert!(matches!(err, NetError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_http_error_status_is_not_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/missing.js", server.uri())).unwrap();
        let response = fetcher.fetch(&Request::get(url)).await.unwrap();

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(!response.is_cacheable());
    }

    #[tokio::test]
    async fn test_http_request_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/slow", server.uri())).unwrap();
        let request = Request::get(url).timeout(Duration::from_millis(50));

        let result = fetcher.fetch(&request).await;
        assert!(matches!(result, Err(NetError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_outer_bound_on_hanging_fetcher() {
        let request = Request::get(Url::parse("https://app.example/").unwrap());
        let result =
            fetch_with_timeout(&Hanging, &request, Some(Duration::from_millis(20))).await;
        assert!(matches!(result, Err(NetError::Timeout(d)) if d == Duration::from_millis(20)));
    }
}
