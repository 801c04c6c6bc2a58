//! Small-body HTTP client for registry metadata APIs.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::RegistryError;
use crate::fetch::{RetryPolicy, default_user_agent, parse_retry_after};

/// Settings for [`JsonClient`].
#[derive(Debug, Clone)]
pub struct JsonClientConfig {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub user_agent: String,
}

impl Default for JsonClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry: RetryPolicy {
                max_retries: 5,
                base_delay: Duration::from_millis(50),
                jitter: false,
                ..Default::default()
            },
            user_agent: default_user_agent(),
        }
    }
}

/// Metadata client shared by the registry implementations.
///
/// 404 and other client errors are terminal. 429, 5xx and transport
/// failures are retried with exponential backoff.
#[derive(Debug, Clone)]
pub struct JsonClient {
    client: Client,
    retry: RetryPolicy,
}

impl JsonClient {
    pub fn new() -> Result<Self, RegistryError> {
        Self::with_config(JsonClientConfig::default())
    }

    pub fn with_config(config: JsonClientConfig) -> Result<Self, RegistryError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()?;

        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<T, RegistryError> {
        let body = self.get_body(url, "application/json", cancel).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn get_xml<T: DeserializeOwned>(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<T, RegistryError> {
        let text = self.get_text(url, cancel).await?;
        Ok(quick_xml::de::from_str(&text)?)
    }

    pub async fn get_text(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String, RegistryError> {
        let body = self.get_body(url, "*/*", cancel).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// GET `url` with retries and return the whole body.
    pub async fn get_body(
        &self,
        url: &str,
        accept: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes, RegistryError> {
        let mut retry = 0;

        loop {
            let err = match self.get_once(url, accept, cancel).await {
                Ok(body) => return Ok(body),
                Err(err) => err,
            };

            if !is_transient(&err) || retry >= self.retry.max_retries {
                return Err(err);
            }

            retry += 1;
            let hint = match &err {
                RegistryError::RateLimited { retry_after, .. } => *retry_after,
                _ => None,
            };
            let delay = self.retry.delay_with_hint(retry, hint);
            warn!(url, error = %err, retry, delay_ms = delay.as_millis() as u64, "registry request failed, retrying");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RegistryError::Cancelled { url: url.to_string() }),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn get_once(
        &self,
        url: &str,
        accept: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes, RegistryError> {
        debug!(url, "fetching registry metadata");

        let request = self.client.get(url).header(ACCEPT, accept).send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RegistryError::Cancelled { url: url.to_string() }),
            response = request => response?,
        };

        let response = check_status(url, response)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RegistryError::Cancelled { url: url.to_string() }),
            body = response.bytes() => Ok(body?),
        }
    }
}

fn check_status(url: &str, response: Response) -> Result<Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        return Err(RegistryError::RateLimited {
            url: url.to_string(),
            retry_after,
        });
    }

    Err(RegistryError::Request {
        url: url.to_string(),
        status,
    })
}

fn is_transient(err: &RegistryError) -> bool {
    match err {
        RegistryError::RateLimited { .. } => true,
        RegistryError::Request { status, .. } => status.is_server_error(),
        RegistryError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize)]
    struct Doc {
        name: String,
    }

    fn client(max_retries: u32) -> JsonClient {
        JsonClient::with_config(JsonClientConfig {
            retry: RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(5),
                jitter: false,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pkg"))
            .and(header("accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"name":"test"}"#))
            .mount(&server)
            .await;

        let doc: Doc = client(0)
            .get_json(&format!("{}/pkg", server.uri()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(doc.name, "test");
    }

    #[tokio::test]
    async fn test_not_found_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(5)
            .get_text(&format!("{}/missing", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("v1.0.0\n"))
            .mount(&server)
            .await;

        let text = client(5)
            .get_text(&format!("{}/list", server.uri()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "v1.0.0\n");
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_surfaces_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .mount(&server)
            .await;

        let err = client(1)
            .get_text(&format!("{}/x", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            RegistryError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::ZERO));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_request() {
        let server = MockServer::start().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client(5)
            .get_text(&format!("{}/x", server.uri()), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Cancelled { .. }));
        assert_eq!(server.received_requests().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_invalid_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client(0)
            .get_json::<Doc>(&format!("{}/x", server.uri()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Json(_)));
    }
}
