//! Resolved artifact locations and fetched artifact streams.

use bytes::{Bytes, BytesMut};
use futures::Stream;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderMap};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::error::FetchError;

/// Where to download a package version from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactInfo {
    pub url: String,
    pub filename: String,
    /// `<algorithm>-<digest>`, e.g. `sha256-...`, when the registry publishes one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
}

impl ArtifactInfo {
    /// Artifact named after the URL's last path segment.
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        let filename = filename_from_url(&url);
        Self {
            url,
            filename,
            integrity: None,
        }
    }

    /// Artifact with an explicit local filename.
    ///
    /// An empty filename falls back to the one derived from the URL.
    pub fn with_filename(url: impl Into<String>, filename: impl Into<String>) -> Self {
        let url = url.into();
        let mut filename = filename.into();
        if filename.is_empty() {
            filename = filename_from_url(&url);
        }
        Self {
            url,
            filename,
            integrity: None,
        }
    }

    pub fn integrity(mut self, integrity: Option<String>) -> Self {
        self.integrity = integrity.filter(|i| !i.is_empty());
        self
    }
}

/// Derive a local filename from a download URL.
///
/// Uses the last non-empty path segment, ignoring query and fragment. Falls
/// back to the host, then to `"artifact"`, so the result is never empty.
pub fn filename_from_url(raw: &str) -> String {
    if let Ok(parsed) = url::Url::parse(raw) {
        let segment = parsed
            .path_segments()
            .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
            .map(str::to_string);
        if let Some(segment) = segment {
            return segment;
        }
        if let Some(host) = parsed.host_str() {
            return host.to_string();
        }
        return "artifact".to_string();
    }

    let trimmed = raw
        .split(['?', '#'])
        .next()
        .unwrap_or(raw)
        .trim_end_matches('/');
    match trimmed.rsplit('/').next() {
        Some(last) if !last.is_empty() => last.to_string(),
        _ => "artifact".to_string(),
    }
}

/// Declared body length of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactSize {
    Known(u64),
    /// No usable `Content-Length` (e.g. chunked transfer encoding).
    Unknown,
}

impl ArtifactSize {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(ArtifactSize::Known)
            .unwrap_or(ArtifactSize::Unknown)
    }

    pub fn known(&self) -> Option<u64> {
        match self {
            ArtifactSize::Known(n) => Some(*n),
            ArtifactSize::Unknown => None,
        }
    }
}

impl std::fmt::Display for ArtifactSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactSize::Known(n) => write!(f, "{} bytes", n),
            ArtifactSize::Unknown => write!(f, "unknown size"),
        }
    }
}

/// Result of a HEAD request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactHead {
    pub size: ArtifactSize,
    pub content_type: Option<String>,
}

impl ArtifactHead {
    pub(crate) fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            size: ArtifactSize::from_headers(headers),
            content_type: header_string(headers, CONTENT_TYPE),
        }
    }
}

/// A successfully opened artifact download.
///
/// Owns the live response body. Read it with [`chunk`](Self::chunk),
/// [`copy_to`](Self::copy_to), [`bytes`](Self::bytes) or
/// [`into_stream`](Self::into_stream). Dropping the artifact closes the
/// connection whether or not the body was drained.
pub struct Artifact {
    url: String,
    size: ArtifactSize,
    content_type: Option<String>,
    etag: Option<String>,
    response: reqwest::Response,
    cancel: CancellationToken,
}

impl Artifact {
    pub(crate) fn new(url: &str, response: reqwest::Response, cancel: CancellationToken) -> Self {
        let headers = response.headers();
        let size = ArtifactSize::from_headers(headers);
        let content_type = header_string(headers, CONTENT_TYPE);
        let etag = header_string(headers, ETAG);
        Self {
            url: url.to_string(),
            size,
            content_type,
            etag,
            response,
            cancel,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn size(&self) -> ArtifactSize {
        self.size
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// Next chunk of the body, or `None` once drained.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, FetchError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled { url: self.url.clone() }),
            chunk = self.response.chunk() => chunk.map_err(|source| FetchError::Network {
                url: self.url.clone(),
                source,
            }),
        }
    }

    /// Stream the whole body into `writer`, returning the number of bytes written.
    pub async fn copy_to<W>(mut self, writer: &mut W) -> Result<u64, FetchError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0u64;
        while let Some(chunk) = self.chunk().await? {
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;
        Ok(written)
    }

    /// Buffer the whole body in memory.
    pub async fn bytes(mut self) -> Result<Bytes, FetchError> {
        let mut buf = match self.size {
            ArtifactSize::Known(n) => BytesMut::with_capacity(n.min(64 * 1024 * 1024) as usize),
            ArtifactSize::Unknown => BytesMut::new(),
        };
        while let Some(chunk) = self.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Convert into a stream of body chunks.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, FetchError>> + Send {
        futures::stream::try_unfold(self, |mut artifact| async move {
            let chunk = artifact.chunk().await?;
            Ok::<_, FetchError>(chunk.map(|chunk| (chunk, artifact)))
        })
    }
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact")
            .field("url", &self.url)
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .field("etag", &self.etag)
            .finish_non_exhaustive()
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::fetcher::{ArtifactFetcher, Fetcher};
    use futures::StreamExt;
    use reqwest::header::HeaderValue;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BODY: &str = "0123456789abcdef";

    async fn serve_body() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pkg.tgz"))
            .respond_with(ResponseTemplate::new(200).set_body_string(BODY))
            .mount(&server)
            .await;
        server
    }

    async fn open(server: &MockServer, cancel: &CancellationToken) -> Artifact {
        Fetcher::new()
            .unwrap()
            .fetch(&format!("{}/pkg.tgz", server.uri()), cancel)
            .await
            .unwrap()
    }

    /// Collects writes and cancels the token after the first one.
    struct CancellingWriter {
        buf: Vec<u8>,
        cancel: CancellationToken,
    }

    impl AsyncWrite for CancellingWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            data: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.buf.extend_from_slice(data);
            self.cancel.cancel();
            Poll::Ready(Ok(data.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_filename_from_url() {
        assert_eq!(
            filename_from_url("https://registry.npmjs.org/lodash/-/lodash-4.17.21.tgz"),
            "lodash-4.17.21.tgz"
        );
        assert_eq!(
            filename_from_url("https://files.pythonhosted.org/packages/ab/cd/requests-2.31.0.tar.gz#sha256=abc"),
            "requests-2.31.0.tar.gz"
        );
        assert_eq!(
            filename_from_url("https://example.com/dl/pkg.zip?token=x"),
            "pkg.zip"
        );
        assert_eq!(filename_from_url("https://example.com/dl/"), "dl");
        assert_eq!(filename_from_url("https://example.com/"), "example.com");
        assert_eq!(filename_from_url("not a url/with/name.tar"), "name.tar");
        assert_eq!(filename_from_url("/"), "artifact");
    }

    #[test]
    fn test_artifact_info_filename_never_empty() {
        let info = ArtifactInfo::with_filename("https://example.com/a/b.crate", "");
        assert_eq!(info.filename, "b.crate");

        let info = ArtifactInfo::from_url("https://example.com/a/b.crate")
            .integrity(Some(String::new()));
        assert_eq!(info.integrity, None);
    }

    #[test]
    fn test_size_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(ArtifactSize::from_headers(&headers), ArtifactSize::Unknown);

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        assert_eq!(ArtifactSize::from_headers(&headers), ArtifactSize::Known(0));

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("12345"));
        assert_eq!(
            ArtifactSize::from_headers(&headers),
            ArtifactSize::Known(12345)
        );

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("lots"));
        assert_eq!(ArtifactSize::from_headers(&headers), ArtifactSize::Unknown);
    }

    #[test]
    fn test_head_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("1234"));
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );

        let head = ArtifactHead::from_headers(&headers);
        assert_eq!(head.size.known(), Some(1234));
        assert_eq!(head.content_type.as_deref(), Some("application/octet-stream"));
    }

    #[tokio::test]
    async fn test_copy_to_writes_whole_body() {
        let server = serve_body().await;
        let cancel = CancellationToken::new();
        let artifact = open(&server, &cancel).await;
        assert_eq!(artifact.size(), ArtifactSize::Known(BODY.len() as u64));

        let mut out = Vec::new();
        let written = artifact.copy_to(&mut out).await.unwrap();
        assert_eq!(written, BODY.len() as u64);
        assert_eq!(out, BODY.as_bytes());
    }

    #[tokio::test]
    async fn test_copy_to_stops_when_cancelled_mid_body() {
        let server = serve_body().await;
        let cancel = CancellationToken::new();
        let artifact = open(&server, &cancel).await;

        let mut writer = CancellingWriter {
            buf: Vec::new(),
            cancel: cancel.clone(),
        };
        let err = artifact.copy_to(&mut writer).await.unwrap_err();
        assert!(matches!(err, FetchError::Cancelled { .. }));
        assert!(!writer.buf.is_empty());
    }

    #[tokio::test]
    async fn test_into_stream_yields_body() {
        let server = serve_body().await;
        let cancel = CancellationToken::new();
        let chunks: Vec<Bytes> = open(&server, &cancel)
            .await
            .into_stream()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;

        assert_eq!(chunks.concat(), BODY.as_bytes());
    }

    #[tokio::test]
    async fn test_into_stream_ends_with_cancelled_error() {
        let server = serve_body().await;
        let cancel = CancellationToken::new();
        let stream = open(&server, &cancel).await.into_stream();
        futures::pin_mut!(stream);

        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.is_empty());

        cancel.cancel();
        let next = stream.next().await.unwrap();
        assert!(matches!(next, Err(FetchError::Cancelled { .. })));
        assert!(stream.next().await.is_none());
    }
}
