//! Corpus export: dump stored posts to per-category directories for
//! downstream analysis, with a README and a feed manifest alongside.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::ingest::{SanitizeLevel, SanitizePolicy};
use crate::storage::{Database, Feed, FeedStatus, Post, StorageError};

const README_DTFMT: &str = "%b %d, %Y at %H:%M";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Export I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Export query failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Export serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("'{0}' is not a directory")]
    NotADirectory(String),
}

/// On-disk format for exported posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportScheme {
    Json,
    Html,
}

impl ExportScheme {
    fn extension(&self) -> &'static str {
        match self {
            ExportScheme::Json => "json",
            ExportScheme::Html => "html",
        }
    }
}

/// Totals reported back after an export run.
#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub feeds: usize,
    pub posts: usize,
    pub categories: usize,
}

/// Writes the corpus to disk, one file per post under its feed's category
/// directory.
///
/// JSON files carry the stored post record verbatim; HTML files wrap the
/// content in a minimal document with the configured sanitize level applied.
pub struct CorpusExporter {
    db: Database,
    scheme: ExportScheme,
    level: SanitizeLevel,
    policy: SanitizePolicy,
}

impl CorpusExporter {
    pub fn new(
        db: Database,
        scheme: ExportScheme,
        level: SanitizeLevel,
        policy: SanitizePolicy,
    ) -> Self {
        Self {
            db,
            scheme,
            level,
            policy,
        }
    }

    /// Export all posts, or only those whose feed category is listed in
    /// `categories`, to directories under `root`.
    pub async fn export(
        &self,
        root: &Path,
        categories: Option<&[String]>,
    ) -> Result<ExportSummary, ExportError> {
        ensure_dir(root)?;

        let feeds = self.db.all_feeds().await?;
        let selected: Vec<&Feed> = match categories {
            Some(filter) => feeds
                .iter()
                .filter(|f| filter.iter().any(|c| c == f.category()))
                .collect(),
            None => feeds.iter().collect(),
        };

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();

        for feed in &selected {
            let category = feed.category();
            let dir = root.join(category);
            ensure_dir(&dir)?;

            let posts = self.db.posts_for_feed(feed.id).await?;
            for post in &posts {
                let path = dir.join(format!("{}.{}", post.id, self.scheme.extension()));
                let payload = match self.scheme {
                    ExportScheme::Json => serde_json::to_string_pretty(post)?,
                    ExportScheme::Html => self.htmlize(post),
                };
                std::fs::write(&path, payload)?;
                *counts.entry(category.to_string()).or_insert(0) += 1;
            }
        }

        let summary = ExportSummary {
            feeds: selected.len(),
            posts: counts.values().sum(),
            categories: distinct_categories(&selected),
        };

        self.write_readme(&root.join("README"), &summary, &counts)?;
        write_manifest(&root.join("feeds.json"), &selected)?;

        tracing::info!(
            root = %root.display(),
            feeds = summary.feeds,
            posts = summary.posts,
            categories = summary.categories,
            "Corpus exported"
        );
        Ok(summary)
    }

    /// A post as a standalone HTML document, content sanitized at the
    /// requested level.
    fn htmlize(&self, post: &Post) -> String {
        let body = match self.level {
            SanitizeLevel::Text => format!(
                "<p>{}</p>",
                escape_html(&crate::ingest::sanitize(
                    &post.content,
                    &self.policy,
                    SanitizeLevel::Text
                ))
            ),
            level => crate::ingest::sanitize(&post.content, &self.policy, level),
        };
        let title = escape_html(&post.title);
        format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\"/>\n\
             <title>{title}</title>\n</head>\n<body>\n<h1>{title}</h1>\n\
             {body}\n</body>\n</html>\n"
        )
    }

    fn write_readme(
        &self,
        path: &Path,
        summary: &ExportSummary,
        counts: &BTreeMap<String, usize>,
    ) -> Result<(), ExportError> {
        let mut output = vec![
            "weir corpus export".to_string(),
            "==================".to_string(),
            String::new(),
            format!(
                "Exported on: {}",
                chrono::Utc::now().format(README_DTFMT)
            ),
            format!(
                "{} feeds containing {} posts in {} categories.",
                summary.feeds, summary.posts, summary.categories
            ),
            String::new(),
            "Category Counts".to_string(),
            "---------------".to_string(),
            String::new(),
        ];
        for (category, count) in counts {
            output.push(format!("- {}: {}", category, count));
        }
        output.push(String::new());

        std::fs::write(path, output.join("\n"))?;
        Ok(())
    }
}

/// One row of the feeds.json manifest, for resolving the feed behind each
/// exported post.
#[derive(Serialize)]
struct FeedInfo<'a> {
    id: i64,
    url: &'a str,
    title: &'a str,
    category: &'a str,
    status: FeedStatus,
}

fn write_manifest(path: &Path, feeds: &[&Feed]) -> Result<(), ExportError> {
    let rows: Vec<FeedInfo<'_>> = feeds
        .iter()
        .map(|feed| FeedInfo {
            id: feed.id,
            url: &feed.url,
            title: &feed.title,
            category: feed.category(),
            status: feed.status,
        })
        .collect();
    std::fs::write(path, serde_json::to_string_pretty(&rows)?)?;
    Ok(())
}

fn distinct_categories(feeds: &[&Feed]) -> usize {
    let mut seen: Vec<&str> = feeds.iter().map(|f| f.category()).collect();
    seen.sort_unstable();
    seen.dedup();
    seen.len()
}

fn ensure_dir(path: &Path) -> Result<(), ExportError> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    if !path.is_dir() {
        return Err(ExportError::NotADirectory(path.display().to_string()));
    }
    Ok(())
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ExtractionStatus, FeedRegistration, InsertOutcome, NewPost};

    async fn seed_corpus(db: &Database) -> (Feed, Feed) {
        let books_id = db
            .upsert_feed(&FeedRegistration {
                url: "https://books.example/feed".to_string(),
                title: Some("Books Weekly".to_string()),
                tags: vec!["books".to_string()],
                extra: Default::default(),
            })
            .await
            .unwrap();
        let untagged_id = db
            .upsert_feed(&FeedRegistration {
                url: "https://misc.example/feed".to_string(),
                title: None,
                tags: vec![],
                extra: Default::default(),
            })
            .await
            .unwrap();

        for (feed_id, n, title) in [
            (books_id, 1, "Shelf Notes"),
            (books_id, 2, "Paper & Ink"),
            (untagged_id, 3, "Odds and Ends"),
        ] {
            let outcome = db
                .insert_post_if_new(&NewPost {
                    feed_id,
                    url: Some(format!("https://posts.example/{}", n)),
                    title: title.to_string(),
                    published: None,
                    content: format!("<p>Post {} body <em>text</em></p>", n),
                    extraction_status: ExtractionStatus::Full,
                    fingerprint: format!("{:064x}", n),
                })
                .await
                .unwrap();
            assert!(matches!(outcome, InsertOutcome::Inserted(_)));
        }

        let books = db
            .feed_by_url("https://books.example/feed")
            .await
            .unwrap()
            .unwrap();
        let untagged = db
            .feed_by_url("https://misc.example/feed")
            .await
            .unwrap()
            .unwrap();
        (books, untagged)
    }

    #[tokio::test]
    async fn test_json_export_layout_and_manifest() {
        let db = Database::open(":memory:", 1).await.unwrap();
        let (books, untagged) = seed_corpus(&db).await;

        let dir = tempfile::tempdir().unwrap();
        let exporter = CorpusExporter::new(
            db.clone(),
            ExportScheme::Json,
            SanitizeLevel::Safe,
            SanitizePolicy::default(),
        );
        let summary = exporter.export(dir.path(), None).await.unwrap();

        assert_eq!(summary.feeds, 2);
        assert_eq!(summary.posts, 3);
        assert_eq!(summary.categories, 2);

        let books_posts = db.posts_for_feed(books.id).await.unwrap();
        for post in &books_posts {
            let path = dir.path().join("books").join(format!("{}.json", post.id));
            let raw = std::fs::read_to_string(&path).unwrap();
            let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(value["title"], serde_json::json!(post.title));
            assert_eq!(value["fingerprint"], serde_json::json!(post.fingerprint));
        }

        let misc_posts = db.posts_for_feed(untagged.id).await.unwrap();
        assert!(dir
            .path()
            .join("uncategorized")
            .join(format!("{}.json", misc_posts[0].id))
            .exists());

        let manifest = std::fs::read_to_string(dir.path().join("feeds.json")).unwrap();
        let rows: Vec<serde_json::Value> = serde_json::from_str(&manifest).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r["category"] == "books"));
        assert!(rows.iter().any(|r| r["status"] == "active"));

        let readme = std::fs::read_to_string(dir.path().join("README")).unwrap();
        assert!(readme.contains("2 feeds containing 3 posts in 2 categories."));
        assert!(readme.contains("- books: 2"));
        assert!(readme.contains("- uncategorized: 1"));
    }

    #[tokio::test]
    async fn test_html_export_wraps_and_sanitizes() {
        let db = Database::open(":memory:", 1).await.unwrap();
        let (books, _) = seed_corpus(&db).await;

        let dir = tempfile::tempdir().unwrap();
        let exporter = CorpusExporter::new(
            db.clone(),
            ExportScheme::Html,
            SanitizeLevel::Safe,
            SanitizePolicy::default(),
        );
        exporter.export(dir.path(), None).await.unwrap();

        let posts = db.posts_for_feed(books.id).await.unwrap();
        let path = dir.path().join("books").join(format!("{}.html", posts[0].id));
        let html = std::fs::read_to_string(&path).unwrap();
        assert!(html.contains("<!DOCTYPE html>"));
        assert!(html.contains(&format!("<h1>{}</h1>", posts[0].title)));
        assert!(html.contains("<em>text</em>"));
    }

    #[tokio::test]
    async fn test_text_level_strips_markup() {
        let db = Database::open(":memory:", 1).await.unwrap();
        let (books, _) = seed_corpus(&db).await;

        let dir = tempfile::tempdir().unwrap();
        let exporter = CorpusExporter::new(
            db.clone(),
            ExportScheme::Html,
            SanitizeLevel::Text,
            SanitizePolicy::default(),
        );
        exporter.export(dir.path(), None).await.unwrap();

        let posts = db.posts_for_feed(books.id).await.unwrap();
        let path = dir.path().join("books").join(format!("{}.html", posts[0].id));
        let html = std::fs::read_to_string(&path).unwrap();
        assert!(!html.contains("<em>"));
        assert!(html.contains("body text"));
    }

    #[tokio::test]
    async fn test_category_filter_limits_output() {
        let db = Database::open(":memory:", 1).await.unwrap();
        seed_corpus(&db).await;

        let dir = tempfile::tempdir().unwrap();
        let exporter = CorpusExporter::new(
            db.clone(),
            ExportScheme::Json,
            SanitizeLevel::Safe,
            SanitizePolicy::default(),
        );
        let summary = exporter
            .export(dir.path(), Some(&["books".to_string()]))
            .await
            .unwrap();

        assert_eq!(summary.feeds, 1);
        assert_eq!(summary.posts, 2);
        assert!(dir.path().join("books").is_dir());
        assert!(!dir.path().join("uncategorized").exists());
    }

    #[tokio::test]
    async fn test_root_path_collision_rejected() {
        let db = Database::open(":memory:", 1).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("not_a_dir");
        std::fs::write(&file_path, "occupied").unwrap();

        let exporter = CorpusExporter::new(
            db,
            ExportScheme::Json,
            SanitizeLevel::Safe,
            SanitizePolicy::default(),
        );
        let result = exporter.export(&file_path, None).await;
        assert!(matches!(result, Err(ExportError::NotADirectory(_))));
    }
}
