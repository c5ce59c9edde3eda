use chrono::{DateTime, Utc};
use feed_rs::model::FeedType;
use feed_rs::parser;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Malformed feed document: {0}")]
    Malformed(#[from] parser::ParseFeedError),
}

/// Syndication format of a fetched payload, resolved by content sniffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    Rss,
    Atom,
    Json,
}

impl std::fmt::Display for FeedFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedFormat::Rss => write!(f, "rss"),
            FeedFormat::Atom => write!(f, "atom"),
            FeedFormat::Json => write!(f, "json"),
        }
    }
}

impl From<FeedType> for FeedFormat {
    fn from(feed_type: FeedType) -> Self {
        match feed_type {
            FeedType::Atom => FeedFormat::Atom,
            FeedType::JSON => FeedFormat::Json,
            FeedType::RSS0 | FeedType::RSS1 | FeedType::RSS2 => FeedFormat::Rss,
        }
    }
}

/// One successfully decoded entry, dates normalized to UTC.
#[derive(Debug, Clone)]
pub struct ParsedEntry {
    pub guid: Option<String>,
    pub title: String,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub published: Option<DateTime<Utc>>,
}

/// Per-entry decode result. A bad entry never aborts the rest of the
/// document; it surfaces here and gets counted by the caller.
#[derive(Debug, Clone)]
pub enum EntryOutcome {
    Parsed(ParsedEntry),
    Skipped { reason: &'static str },
}

/// A decoded feed document with entries in document order.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub format: FeedFormat,
    pub title: Option<String>,
    pub entries: Vec<EntryOutcome>,
}

/// Decode a raw feed payload. RSS, Atom, and JSON Feed are sniffed from the
/// content itself; the transport's Content-Type is not trusted.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    // Keep source ids verbatim. feed-rs would otherwise synthesize ids for
    // id-less entries (a random one when link and title are both missing),
    // and entry identity here must come from the source or from the
    // normalized link+title fallback, never from a per-parse value.
    let feed = parser::Builder::new()
        .id_generator(|_links, _title, _uri| String::new())
        .build()
        .parse(bytes)?;
    let format = FeedFormat::from(feed.feed_type);
    let title = feed.title.map(|t| t.content);

    let entries = feed
        .entries
        .into_iter()
        .map(|entry| {
            let guid = if entry.id.trim().is_empty() {
                None
            } else {
                Some(entry.id.trim().to_string())
            };
            let link = entry.links.first().map(|l| l.href.clone());
            let raw_title = entry
                .title
                .map(|t| t.content)
                .filter(|t| !t.trim().is_empty());

            // An entry with no guid, no link, and no title has no usable
            // identity; storing it would collide with every other such entry.
            if guid.is_none() && link.is_none() && raw_title.is_none() {
                return EntryOutcome::Skipped {
                    reason: "entry has no guid, link, or title",
                };
            }

            let published = entry.published.or(entry.updated);
            let summary = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body));

            EntryOutcome::Parsed(ParsedEntry {
                guid,
                title: raw_title.unwrap_or_else(|| "Untitled".to_string()),
                link,
                summary,
                published,
            })
        })
        .collect();

    Ok(ParsedFeed {
        format,
        title,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(outcomes: &[EntryOutcome]) -> Vec<&ParsedEntry> {
        outcomes
            .iter()
            .filter_map(|o| match o {
                EntryOutcome::Parsed(e) => Some(e),
                EntryOutcome::Skipped { .. } => None,
            })
            .collect()
    }

    #[test]
    fn parses_rss2() {
        let xml = r#"<?xml version="1.0"?>
            <rss version="2.0"><channel>
                <title>Example</title>
                <item>
                    <title>First Post</title>
                    <link>https://example.com/1</link>
                    <guid>https://example.com/1</guid>
                    <pubDate>Mon, 01 Jan 2024 10:00:00 GMT</pubDate>
                    <description>Summary text</description>
                </item>
            </channel></rss>"#;

        let feed = parse_feed(xml.as_bytes()).unwrap();
        assert_eq!(feed.format, FeedFormat::Rss);
        assert_eq!(feed.title.as_deref(), Some("Example"));

        let entries = parsed(&feed.entries);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "First Post");
        assert_eq!(entries[0].link.as_deref(), Some("https://example.com/1"));
        assert_eq!(entries[0].guid.as_deref(), Some("https://example.com/1"));
        assert_eq!(entries[0].summary.as_deref(), Some("Summary text"));
        let published = entries[0].published.unwrap();
        assert_eq!(published.to_rfc3339(), "2024-01-01T10:00:00+00:00");
    }

    #[test]
    fn parses_atom_with_updated_fallback() {
        let xml = r#"<?xml version="1.0"?>
            <feed xmlns="http://www.w3.org/2005/Atom">
                <title>Atom Example</title>
                <id>urn:feed</id>
                <updated>2024-01-01T00:00:00Z</updated>
                <entry>
                    <title>Entry</title>
                    <id>urn:entry:1</id>
                    <link href="https://example.com/e/1"/>
                    <updated>2024-02-02T08:30:00Z</updated>
                </entry>
            </feed>"#;

        let feed = parse_feed(xml.as_bytes()).unwrap();
        assert_eq!(feed.format, FeedFormat::Atom);

        let entries = parsed(&feed.entries);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].guid.as_deref(), Some("urn:entry:1"));
        let published = entries[0].published.unwrap();
        assert_eq!(published.to_rfc3339(), "2024-02-02T08:30:00+00:00");
    }

    #[test]
    fn parses_json_feed() {
        let json = r#"{
            "version": "https://jsonfeed.org/version/1",
            "title": "JSON Example",
            "items": [
                {"id": "1", "url": "https://example.com/1",
                 "title": "One", "content_html": "<p>body</p>"}
            ]
        }"#;

        let feed = parse_feed(json.as_bytes()).unwrap();
        assert_eq!(feed.format, FeedFormat::Json);

        let entries = parsed(&feed.entries);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].guid.as_deref(), Some("1"));
        assert_eq!(entries[0].summary.as_deref(), Some("<p>body</p>"));
    }

    #[test]
    fn entry_without_identity_is_skipped_not_fatal() {
        let xml = r#"<?xml version="1.0"?>
            <rss version="2.0"><channel>
                <title>Example</title>
                <item><description>floating fragment</description></item>
                <item>
                    <title>Real</title>
                    <link>https://example.com/real</link>
                </item>
            </channel></rss>"#;

        let feed = parse_feed(xml.as_bytes()).unwrap();
        assert_eq!(feed.entries.len(), 2);
        assert!(matches!(feed.entries[0], EntryOutcome::Skipped { .. }));

        let entries = parsed(&feed.entries);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "Real");
    }

    #[test]
    fn missing_title_defaults_when_identity_exists() {
        let xml = r#"<?xml version="1.0"?>
            <rss version="2.0"><channel>
                <title>Example</title>
                <item><guid>id-1</guid></item>
            </channel></rss>"#;

        let feed = parse_feed(xml.as_bytes()).unwrap();
        let entries = parsed(&feed.entries);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "Untitled");
        assert!(entries[0].published.is_none());
    }

    #[test]
    fn summary_falls_back_to_content_body() {
        let xml = r#"<?xml version="1.0"?>
            <rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/">
            <channel>
                <title>Example</title>
                <item>
                    <title>Post</title>
                    <link>https://example.com/1</link>
                    <content:encoded><![CDATA[<p>full body</p>]]></content:encoded>
                </item>
            </channel></rss>"#;

        let feed = parse_feed(xml.as_bytes()).unwrap();
        let entries = parsed(&feed.entries);
        assert_eq!(entries[0].summary.as_deref(), Some("<p>full body</p>"));
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(parse_feed(b"this is not a feed").is_err());
        assert!(parse_feed(b"").is_err());
    }
}
