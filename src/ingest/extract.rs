use std::io::Cursor;

use readability::extractor;
use url::Url;

use crate::ingest::fetcher::Fetcher;
use crate::ingest::sanitize::{sanitize, SanitizeLevel, SanitizePolicy};
use crate::storage::ExtractionStatus;

/// Sanitized article body plus how it was obtained.
#[derive(Debug)]
pub struct ExtractedContent {
    pub content: String,
    pub status: ExtractionStatus,
}

/// Full-text extraction with summary fallback.
///
/// Never fails: any problem along the way (no link, unfetchable page,
/// readability giving up) degrades the entry to its sanitized feed summary
/// instead of surfacing an error.
pub struct ContentExtractor {
    fetcher: Fetcher,
    policy: SanitizePolicy,
}

impl ContentExtractor {
    pub fn new(fetcher: Fetcher, policy: SanitizePolicy) -> Self {
        Self { fetcher, policy }
    }

    /// Produce the stored content for one entry.
    ///
    /// Fetches the linked page and runs readability over it; the result is
    /// sanitized before it is returned. Degrades when the link is missing or
    /// not http(s), the page fetch fails, or extraction yields nothing.
    pub async fn extract(&self, link: Option<&str>, summary: Option<&str>) -> ExtractedContent {
        let Some(link) = link else {
            return self.degraded(summary);
        };

        let page_url = match Url::parse(link) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            _ => {
                tracing::debug!(link = %link, "Entry link is not a fetchable URL");
                return self.degraded(summary);
            }
        };

        let bytes = match self.fetcher.fetch_page(page_url.as_str()).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(url = %page_url, error = %e, "Page fetch failed");
                return self.degraded(summary);
            }
        };

        let html = String::from_utf8_lossy(&bytes);
        let product = match extractor::extract(&mut Cursor::new(html.as_bytes()), &page_url) {
            Ok(product) => product,
            Err(e) => {
                tracing::debug!(url = %page_url, error = ?e, "Readability extraction failed");
                return self.degraded(summary);
            }
        };

        let content = sanitize(&product.content, &self.policy, SanitizeLevel::Safe);
        if content.trim().is_empty() {
            tracing::debug!(url = %page_url, "Extraction produced no usable content");
            return self.degraded(summary);
        }

        ExtractedContent {
            content,
            status: ExtractionStatus::Full,
        }
    }

    /// Sanitize whatever summary the feed carried; empty when it had none.
    fn degraded(&self, summary: Option<&str>) -> ExtractedContent {
        let content = summary
            .map(|s| sanitize(s, &self.policy, SanitizeLevel::Safe))
            .unwrap_or_default();
        ExtractedContent {
            content,
            status: ExtractionStatus::DegradedSummary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ARTICLE_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Rust ownership explained</title><script>track();</script></head>
<body>
<nav><a class="nav-link" href="/home">Home</a><a class="nav-link" href="/about">About</a></nav>
<div id="content">
<p>Ownership is the mechanism through which the language manages memory without
a garbage collector. Every value has a single owner, and the value is dropped
when the owner goes out of scope. This single rule removes entire categories
of bugs that plague manual memory management.</p>
<p>Borrowing extends the model with references. A value can be borrowed either
by any number of immutable references or by exactly one mutable reference at
a time, a constraint the compiler enforces at compile time rather than at
runtime. The borrow checker is the part of the compiler that does this work.</p>
<p>Lifetimes tie the two together. They describe how long references remain
valid, and although the compiler infers most of them, complex signatures
sometimes need explicit annotations to express the relationship between
inputs and outputs of a function.</p>
</div>
<footer>Copyright notice</footer>
</body>
</html>"#;

    fn test_extractor() -> ContentExtractor {
        let fetcher = Fetcher::new(
            reqwest::Client::new(),
            Duration::from_millis(500),
            0,
            Duration::from_millis(5),
        );
        ContentExtractor::new(fetcher, SanitizePolicy::default())
    }

    #[tokio::test]
    async fn test_full_extraction_from_page() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ARTICLE_PAGE))
            .mount(&mock_server)
            .await;

        let extractor = test_extractor();
        let url = format!("{}/article", mock_server.uri());
        let result = extractor
            .extract(Some(&url), Some("<p>short summary</p>"))
            .await;

        assert_eq!(result.status, ExtractionStatus::Full);
        assert!(result.content.contains("borrow checker"));
        assert!(!result.content.contains("nav-link"));
        assert!(!result.content.contains("track()"));
    }

    #[tokio::test]
    async fn test_missing_link_degrades_to_summary() {
        let extractor = test_extractor();
        let result = extractor
            .extract(None, Some("<p>summary <script>x()</script>text</p>"))
            .await;

        assert_eq!(result.status, ExtractionStatus::DegradedSummary);
        assert_eq!(result.content, "<p>summary text</p>");
    }

    #[tokio::test]
    async fn test_unfetchable_page_degrades() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let extractor = test_extractor();
        let url = format!("{}/gone", mock_server.uri());
        let result = extractor.extract(Some(&url), Some("fallback text")).await;

        assert_eq!(result.status, ExtractionStatus::DegradedSummary);
        assert_eq!(result.content, "fallback text");
    }

    #[tokio::test]
    async fn test_non_http_link_degrades() {
        let extractor = test_extractor();

        let result = extractor.extract(Some("ftp://files.example/a"), None).await;
        assert_eq!(result.status, ExtractionStatus::DegradedSummary);
        assert_eq!(result.content, "");

        let result = extractor.extract(Some("not a url at all"), Some("s")).await;
        assert_eq!(result.status, ExtractionStatus::DegradedSummary);
        assert_eq!(result.content, "s");
    }

    #[tokio::test]
    async fn test_no_link_no_summary_yields_empty_degraded() {
        let extractor = test_extractor();
        let result = extractor.extract(None, None).await;

        assert_eq!(result.status, ExtractionStatus::DegradedSummary);
        assert_eq!(result.content, "");
    }
}
