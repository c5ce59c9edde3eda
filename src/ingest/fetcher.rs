use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use thiserror::Error;

use crate::config::Config;

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const MAX_PAGE_SIZE: usize = 5 * 1024 * 1024; // 5MB

/// Errors that can occur during HTTP retrieval.
///
/// 4xx statuses are permanent and fail immediately; timeouts, transport
/// errors, 5xx, 429, and short reads are transient and retried with backoff
/// before surfacing here.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, invalid URL)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with a non-success status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout on every attempt
    #[error("Request timed out")]
    Timeout,
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// ETag / Last-Modified pair stored per feed and replayed as
/// `If-None-Match` / `If-Modified-Since` on the next fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheValidators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl CacheValidators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Outcome of one conditional feed fetch.
#[derive(Debug)]
pub enum FeedFetch {
    /// New payload, plus whatever validators the response carried
    Fetched {
        bytes: Vec<u8>,
        validators: CacheValidators,
    },
    /// 304: the stored validators still hold, there is nothing to parse
    NotModified,
}

/// HTTP retrieval with bounded exponential retry.
///
/// Storage-free by design: callers own the per-feed metadata writes, so this
/// type can be exercised against a mock server without a database.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
    retry_attempts: u32,
    retry_base_delay: Duration,
}

impl Fetcher {
    /// Build a fetcher from the loaded configuration.
    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self::new(
            client,
            Duration::from_secs(config.request_timeout_secs),
            config.retry_attempts,
            Duration::from_millis(config.retry_base_delay_ms),
        ))
    }

    pub fn new(
        client: reqwest::Client,
        timeout: Duration,
        retry_attempts: u32,
        retry_base_delay: Duration,
    ) -> Self {
        Self {
            client,
            timeout,
            retry_attempts,
            retry_base_delay,
        }
    }

    /// Fetch a feed with a conditional GET.
    ///
    /// Stored validators are replayed as `If-None-Match` / `If-Modified-Since`;
    /// a 304 yields [`FeedFetch::NotModified`] without reading a body.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Timeout`] / [`FetchError::Network`] - transient, after retries
    /// - [`FetchError::HttpStatus`] - 4xx immediately, 5xx after retries
    /// - [`FetchError::RateLimited`] - 429 after retries
    /// - [`FetchError::ResponseTooLarge`] - body over 10MB
    /// - [`FetchError::IncompleteResponse`] - short read, after retries
    pub async fn fetch_feed(
        &self,
        url: &str,
        validators: &CacheValidators,
    ) -> Result<FeedFetch, FetchError> {
        let mut retry_count = 0;

        let (bytes, response_validators) = loop {
            let mut request = self.client.get(url);
            if let Some(etag) = &validators.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &validators.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }

            let response = match tokio::time::timeout(self.timeout, request.send()).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    // Transport errors (DNS, refused connection, reset) are
                    // transient; a bad URL surfaces as a builder error on the
                    // first attempt and is not worth retrying, but reqwest
                    // reports both the same way, so the retry budget covers it.
                    if retry_count >= self.retry_attempts {
                        return Err(FetchError::Network(e));
                    }
                    self.backoff(url, retry_count, "transport error").await;
                    retry_count += 1;
                    continue;
                }
                Err(_) => {
                    if retry_count >= self.retry_attempts {
                        return Err(FetchError::Timeout);
                    }
                    self.backoff(url, retry_count, "timeout").await;
                    retry_count += 1;
                    continue;
                }
            };

            // Rate limiting backs off like a server error but keeps its own
            // terminal error so callers can see what exhausted the budget
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if retry_count >= self.retry_attempts {
                    return Err(FetchError::RateLimited(self.retry_attempts));
                }
                self.backoff(url, retry_count, "rate limited").await;
                retry_count += 1;
                continue;
            }

            if response.status().is_server_error() {
                if retry_count >= self.retry_attempts {
                    return Err(FetchError::HttpStatus(response.status().as_u16()));
                }
                self.backoff(url, retry_count, "server error").await;
                retry_count += 1;
                continue;
            }

            if response.status() == StatusCode::NOT_MODIFIED {
                return Ok(FeedFetch::NotModified);
            }

            // 4xx and other non-success statuses fail immediately
            if !response.status().is_success() {
                return Err(FetchError::HttpStatus(response.status().as_u16()));
            }

            let response_validators = CacheValidators {
                etag: header_string(&response, ETAG),
                last_modified: header_string(&response, LAST_MODIFIED),
            };

            match read_limited_bytes(response, MAX_FEED_SIZE).await {
                Ok(bytes) => break (bytes, response_validators),
                Err(FetchError::IncompleteResponse { expected, received }) => {
                    if retry_count >= self.retry_attempts {
                        return Err(FetchError::IncompleteResponse { expected, received });
                    }
                    self.backoff(url, retry_count, "incomplete response").await;
                    retry_count += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        };

        Ok(FeedFetch::Fetched {
            bytes,
            validators: response_validators,
        })
    }

    /// Fetch an article page for extraction. No conditional headers and no
    /// retries: a failure here degrades the entry to its feed summary rather
    /// than failing the feed.
    pub async fn fetch_page(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = tokio::time::timeout(self.timeout, self.client.get(url).send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Network)?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        read_limited_bytes(response, MAX_PAGE_SIZE).await
    }

    async fn backoff(&self, url: &str, retry_count: u32, cause: &'static str) {
        let delay = self.retry_base_delay * 2u32.pow(retry_count);
        tracing::warn!(
            url = %url,
            retry = retry_count,
            delay_ms = delay.as_millis() as u64,
            cause = cause,
            "Fetch failed, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}

fn header_string(
    response: &reqwest::Response,
    name: reqwest::header::HeaderName,
) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Capture Content-Length for completeness check
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    // A short read means the connection dropped mid-body; callers retry it
    // with the rest of the transient failures.
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{any, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <item><guid>1</guid><title>Test</title></item>
</channel></rss>"#;

    fn test_fetcher() -> Fetcher {
        Fetcher::new(
            reqwest::Client::new(),
            Duration::from_millis(200),
            3,
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn test_fetch_success_captures_validators() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .insert_header("ETag", "\"v1\"")
                    .insert_header("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT"),
            )
            .mount(&mock_server)
            .await;

        let fetcher = test_fetcher();
        let url = format!("{}/feed", mock_server.uri());
        let result = fetcher
            .fetch_feed(&url, &CacheValidators::default())
            .await
            .unwrap();

        match result {
            FeedFetch::Fetched { bytes, validators } => {
                assert_eq!(bytes, VALID_RSS.as_bytes());
                assert_eq!(validators.etag.as_deref(), Some("\"v1\""));
                assert_eq!(
                    validators.last_modified.as_deref(),
                    Some("Mon, 01 Jan 2024 00:00:00 GMT")
                );
            }
            FeedFetch::NotModified => panic!("Expected Fetched"),
        }
    }

    #[tokio::test]
    async fn test_conditional_headers_sent_and_304_honored() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("If-None-Match", "\"v1\""))
            .and(header("If-Modified-Since", "Mon, 01 Jan 2024 00:00:00 GMT"))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&mock_server)
            .await;

        let fetcher = test_fetcher();
        let url = format!("{}/feed", mock_server.uri());
        let validators = CacheValidators {
            etag: Some("\"v1\"".to_string()),
            last_modified: Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
        };

        let result = fetcher.fetch_feed(&url, &validators).await.unwrap();
        assert!(matches!(result, FeedFetch::NotModified));
    }

    #[tokio::test]
    async fn test_404_fails_immediately() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1) // No retries on 4xx
            .mount(&mock_server)
            .await;

        let fetcher = test_fetcher();
        let url = format!("{}/feed", mock_server.uri());
        let err = fetcher
            .fetch_feed(&url, &CacheValidators::default())
            .await
            .unwrap_err();

        match err {
            FetchError::HttpStatus(404) => {}
            e => panic!("Expected HttpStatus(404), got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_500_retries_then_fails() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(4) // Initial request + 3 retries
            .mount(&mock_server)
            .await;

        let fetcher = test_fetcher();
        let url = format!("{}/feed", mock_server.uri());
        let err = fetcher
            .fetch_feed(&url, &CacheValidators::default())
            .await
            .unwrap_err();

        match err {
            FetchError::HttpStatus(500) => {}
            e => panic!("Expected HttpStatus(500), got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_503_retry_then_success() {
        let mock_server = MockServer::start().await;

        // First two requests return 503, third succeeds
        Mock::given(any())
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;

        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&mock_server)
            .await;

        let fetcher = test_fetcher();
        let url = format!("{}/feed", mock_server.uri());
        let result = fetcher
            .fetch_feed(&url, &CacheValidators::default())
            .await
            .unwrap();

        assert!(matches!(result, FeedFetch::Fetched { .. }));
    }

    #[tokio::test]
    async fn test_429_exhausts_budget() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(4)
            .mount(&mock_server)
            .await;

        let fetcher = test_fetcher();
        let url = format!("{}/feed", mock_server.uri());
        let err = fetcher
            .fetch_feed(&url, &CacheValidators::default())
            .await
            .unwrap_err();

        match err {
            FetchError::RateLimited(3) => {}
            e => panic!("Expected RateLimited(3), got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_timeout_exhausts_budget() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&mock_server)
            .await;

        let fetcher = Fetcher::new(
            reqwest::Client::new(),
            Duration::from_millis(50),
            1,
            Duration::from_millis(5),
        );
        let url = format!("{}/feed", mock_server.uri());
        let err = fetcher
            .fetch_feed(&url, &CacheValidators::default())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Timeout));
    }

    #[tokio::test]
    async fn test_fetch_page_no_retries() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&mock_server)
            .await;

        let fetcher = test_fetcher();
        let url = format!("{}/article", mock_server.uri());
        let err = fetcher.fetch_page(&url).await.unwrap_err();

        match err {
            FetchError::HttpStatus(500) => {}
            e => panic!("Expected HttpStatus(500), got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_fetch_page_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>page</html>"))
            .mount(&mock_server)
            .await;

        let fetcher = test_fetcher();
        let url = format!("{}/article", mock_server.uri());
        let bytes = fetcher.fetch_page(&url).await.unwrap();
        assert_eq!(bytes, b"<html>page</html>");
    }
}
