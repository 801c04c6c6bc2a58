//! Retrying, streaming artifact fetcher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Client, Method, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use super::artifact::{Artifact, ArtifactHead};
use super::backoff::{RetryPolicy, parse_retry_after};
use super::dns::DnsCache;
use super::error::FetchError;

/// Longest error body kept for diagnostics.
const ERROR_BODY_LIMIT: usize = 1024;

/// Per-URL header injection, e.g. bearer tokens for private registries.
///
/// Returning `None` sends the request without an extra header.
pub type AuthHook = Arc<dyn Fn(&str) -> Option<(HeaderName, HeaderValue)> + Send + Sync>;

/// Anything that can open artifact downloads.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Open a download. The caller owns the returned body stream.
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<Artifact, FetchError>;

    /// Size and content type without downloading the body.
    async fn head(&self, url: &str, cancel: &CancellationToken)
    -> Result<ArtifactHead, FetchError>;
}

/// Transport and retry settings for [`Fetcher`].
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Whole-request timeout, body included. Artifacts can be large.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    pub user_agent: String,
    pub dns_refresh_interval: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            user_agent: default_user_agent(),
            dns_refresh_interval: Duration::from_secs(5 * 60),
        }
    }
}

pub fn default_user_agent() -> String {
    format!("pkgfetch/{}", env!("CARGO_PKG_VERSION"))
}

/// Downloads artifacts from upstream registries.
///
/// 404 is terminal, 429 and 5xx are retried with jittered exponential
/// backoff, everything else fails on the first attempt. Cloning is cheap and
/// shares the connection pool and DNS cache.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    retry: RetryPolicy,
    auth: Option<AuthHook>,
    dns: Arc<DnsCache>,
}

impl Fetcher {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_config(FetcherConfig::default())
    }

    pub fn with_config(config: FetcherConfig) -> Result<Self, FetchError> {
        let dns = DnsCache::new(config.dns_refresh_interval);

        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(config.user_agent)
            .dns_resolver(Arc::clone(&dns))
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self {
            client,
            retry: config.retry,
            auth: None,
            dns,
        })
    }

    /// Attach a header-injection hook called for every request URL.
    pub fn with_auth<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) -> Option<(HeaderName, HeaderValue)> + Send + Sync + 'static,
    {
        self.auth = Some(Arc::new(hook));
        self
    }

    pub fn with_auth_hook(mut self, hook: Option<AuthHook>) -> Self {
        self.auth = hook;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn dns_cache(&self) -> &Arc<DnsCache> {
        &self.dns
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Response, FetchError> {
        let parsed = url::Url::parse(url).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let mut request = self
            .client
            .request(method.clone(), parsed)
            .header(ACCEPT, "*/*");

        if let Some(auth) = &self.auth {
            if let Some((name, value)) = auth(url) {
                request = request.header(name, value);
            }
        }

        debug!(%method, url, "sending request");

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled { url: url.to_string() }),
            result = request.send() => result.map_err(|source| FetchError::Network {
                url: url.to_string(),
                source,
            })?,
        };

        check_status(url, response, cancel).await
    }

    async fn fetch_once(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Artifact, FetchError> {
        let response = self.send(Method::GET, url, cancel).await?;
        Ok(Artifact::new(url, response, cancel.clone()))
    }
}

#[async_trait]
impl ArtifactFetcher for Fetcher {
    async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<Artifact, FetchError> {
        let mut retry = 0;

        loop {
            let err = match self.fetch_once(url, cancel).await {
                Ok(artifact) => {
                    debug!(url, size = %artifact.size(), retries = retry, "artifact fetched");
                    return Ok(artifact);
                }
                Err(err) => err,
            };

            if !err.is_transient() || retry >= self.retry.max_retries {
                return Err(err);
            }

            retry += 1;
            let delay = self.retry.delay_with_hint(retry, err.retry_after());
            warn!(
                url,
                error = %err,
                retry,
                max_retries = self.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                "transient upstream failure, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled { url: url.to_string() }),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn head(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ArtifactHead, FetchError> {
        let response = self.send(Method::HEAD, url, cancel).await?;
        Ok(ArtifactHead::from_headers(response.headers()))
    }
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("retry", &self.retry)
            .field("auth", &self.auth.is_some())
            .finish_non_exhaustive()
    }
}

/// Map a response status onto the fetch error taxonomy.
async fn check_status(
    url: &str,
    response: Response,
    cancel: &CancellationToken,
) -> Result<Response, FetchError> {
    let status = response.status();
    if status == StatusCode::OK {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);

    match status {
        StatusCode::NOT_FOUND => Err(FetchError::NotFound {
            url: url.to_string(),
        }),
        StatusCode::TOO_MANY_REQUESTS => Err(FetchError::RateLimited {
            url: url.to_string(),
            retry_after,
        }),
        s if s.is_server_error() => Err(FetchError::UpstreamDown {
            url: url.to_string(),
            status,
            retry_after,
        }),
        _ => Err(FetchError::UnexpectedStatus {
            url: url.to_string(),
            status,
            body: read_error_body(response, cancel).await,
        }),
    }
}

async fn read_error_body(mut response: Response, cancel: &CancellationToken) -> String {
    let mut body = Vec::new();
    while body.len() < ERROR_BODY_LIMIT {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            chunk = response.chunk() => chunk,
        };
        match chunk {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            _ => break,
        }
    }
    body.truncate(ERROR_BODY_LIMIT);
    String::from_utf8_lossy(&body).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::artifact::ArtifactSize;
    use std::time::Instant;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_fetcher(max_retries: u32) -> Fetcher {
        Fetcher::with_config(FetcherConfig {
            retry: RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(10),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    async fn request_count(server: &MockServer) -> usize {
        server.received_requests().await.unwrap().len()
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        let content = "test artifact content";

        Mock::given(method("GET"))
            .and(path("/test.tgz"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/gzip")
                    .insert_header("etag", "\"abc123\"")
                    .set_body_string(content),
            )
            .mount(&server)
            .await;

        let fetcher = Fetcher::new().unwrap();
        let cancel = CancellationToken::new();
        let artifact = fetcher
            .fetch(&format!("{}/test.tgz", server.uri()), &cancel)
            .await
            .unwrap();

        assert_eq!(artifact.size(), ArtifactSize::Known(21));
        assert_eq!(artifact.content_type(), Some("application/gzip"));
        assert_eq!(artifact.etag(), Some("\"abc123\""));

        let body = artifact.bytes().await.unwrap();
        assert_eq!(&body[..], content.as_bytes());
    }

    #[tokio::test]
    async fn test_fetch_not_found_is_not_retried() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = fast_fetcher(3);
        let err = fetcher
            .fetch(&format!("{}/missing.tgz", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_not_found(), "got {err:?}");
        assert_eq!(request_count(&server).await, 1);
    }

    #[tokio::test]
    async fn test_fetch_rate_limit_retry() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("success"))
            .mount(&server)
            .await;

        let fetcher = fast_fetcher(3);
        let artifact = fetcher
            .fetch(&format!("{}/test.tgz", server.uri()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(&artifact.bytes().await.unwrap()[..], b"success");
        assert_eq!(request_count(&server).await, 3);
    }

    #[tokio::test]
    async fn test_fetch_server_error_retry() {
        for failures in 0..=3u64 {
            let server = MockServer::start().await;

            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(503))
                .up_to_n_times(failures)
                .with_priority(1)
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
                .mount(&server)
                .await;

            let fetcher = fast_fetcher(3);
            let result = fetcher
                .fetch(&format!("{}/test.tgz", server.uri()), &CancellationToken::new())
                .await;

            assert!(result.is_ok(), "{failures} failures: {result:?}");
            assert_eq!(request_count(&server).await, failures as usize + 1);
        }
    }

    #[tokio::test]
    async fn test_fetch_max_retries() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = fast_fetcher(2);
        let err = fetcher
            .fetch(&format!("{}/test.tgz", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(
            matches!(err, FetchError::UpstreamDown { status, .. } if status == StatusCode::SERVICE_UNAVAILABLE),
            "got {err:?}"
        );
        // Initial attempt + 2 retries.
        assert_eq!(request_count(&server).await, 3);
    }

    #[tokio::test]
    async fn test_fetch_rate_limit_exhausted() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let fetcher = fast_fetcher(1);
        let err = fetcher
            .fetch(&format!("{}/test.tgz", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::RateLimited { .. }), "got {err:?}");
        assert_eq!(request_count(&server).await, 2);
    }

    #[tokio::test]
    async fn test_fetch_unexpected_status_is_terminal() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let fetcher = fast_fetcher(3);
        let err = fetcher
            .fetch(&format!("{}/test.tgz", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            FetchError::UnexpectedStatus { status, body, url } => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(body, "forbidden");
                assert!(url.ends_with("/test.tgz"));
            }
            other => panic!("expected UnexpectedStatus, got {other:?}"),
        }
        assert_eq!(request_count(&server).await, 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = Fetcher::with_config(FetcherConfig {
            retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(10),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = fetcher
            .fetch(&format!("{}/test.tgz", server.uri()), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Cancelled { .. }), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(request_count(&server).await, 1);
    }

    #[tokio::test]
    async fn test_cancel_during_request() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("slow")
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let fetcher = fast_fetcher(3);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = fetcher
            .fetch(&format!("{}/test.tgz", server.uri()), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Cancelled { .. }), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_already_cancelled_sends_nothing() {
        let server = MockServer::start().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let fetcher = fast_fetcher(3);
        let err = fetcher
            .fetch(&format!("{}/test.tgz", server.uri()), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Cancelled { .. }));
        assert_eq!(request_count(&server).await, 0);
    }

    #[tokio::test]
    async fn test_retry_after_is_honoured() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let fetcher = fast_fetcher(3);
        let started = Instant::now();
        fetcher
            .fetch(&format!("{}/test.tgz", server.uri()), &CancellationToken::new())
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(request_count(&server).await, 2);
    }

    #[tokio::test]
    async fn test_auth_hook_adds_header() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string("private"))
            .mount(&server)
            .await;

        let private_prefix = format!("{}/private/", server.uri());
        let fetcher = fast_fetcher(0).with_auth(move |url| {
            url.starts_with(&private_prefix).then(|| {
                (
                    reqwest::header::AUTHORIZATION,
                    HeaderValue::from_static("Bearer secret"),
                )
            })
        });

        let cancel = CancellationToken::new();
        let artifact = fetcher
            .fetch(&format!("{}/private/pkg.tgz", server.uri()), &cancel)
            .await
            .unwrap();
        assert_eq!(&artifact.bytes().await.unwrap()[..], b"private");

        // The hook declines for other URLs, so the mock does not match.
        let err = fetcher
            .fetch(&format!("{}/public/pkg.tgz", server.uri()), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let requests = server.received_requests().await.unwrap();
        assert!(requests[1].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_user_agent_and_accept_headers() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(header("user-agent", "pkgfetch-test/1.0"))
            .and(header("accept", "*/*"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let fetcher = Fetcher::with_config(FetcherConfig {
            user_agent: "pkgfetch-test/1.0".to_string(),
            ..Default::default()
        })
        .unwrap();

        let result = fetcher
            .fetch(&format!("{}/a.tgz", server.uri()), &CancellationToken::new())
            .await;
        assert!(result.is_ok(), "{result:?}");
    }

    #[tokio::test]
    async fn test_head() {
        let server = MockServer::start().await;

        Mock::given(method("HEAD"))
            .and(path("/test.tgz"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/octet-stream")
                    .set_body_bytes(vec![0u8; 12345]),
            )
            .mount(&server)
            .await;

        let fetcher = Fetcher::new().unwrap();
        let head = fetcher
            .head(&format!("{}/test.tgz", server.uri()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(head.size, ArtifactSize::Known(12345));
        assert_eq!(head.content_type.as_deref(), Some("application/octet-stream"));
    }

    #[tokio::test]
    async fn test_head_is_not_retried() {
        let server = MockServer::start().await;

        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = fast_fetcher(3);
        let err = fetcher
            .head(&format!("{}/test.tgz", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::UpstreamDown { .. }));
        assert_eq!(request_count(&server).await, 1);
    }

    #[tokio::test]
    async fn test_head_not_found() {
        let server = MockServer::start().await;

        let fetcher = Fetcher::new().unwrap();
        let err = fetcher
            .head(&format!("{}/missing.tgz", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let fetcher = Fetcher::new().unwrap();
        let err = fetcher
            .fetch("not a url", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_fetches() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("data"))
            .mount(&server)
            .await;

        let fetcher = Fetcher::new().unwrap();
        let cancel = CancellationToken::new();
        let fetches = (0..16).map(|i| {
            let fetcher = fetcher.clone();
            let cancel = cancel.clone();
            let url = format!("{}/pkg-{}.tgz", server.uri(), i);
            async move { fetcher.fetch(&url, &cancel).await?.bytes().await }
        });

        let results = futures::future::join_all(fetches).await;
        assert!(results.iter().all(|r| r.as_ref().is_ok_and(|b| &b[..] == b"data")));
    }
}
