use std::sync::atomic::{AtomicBool, Ordering};

use futures::{stream, StreamExt};

use crate::ingest::extract::ContentExtractor;
use crate::ingest::fetcher::{CacheValidators, FeedFetch, Fetcher};
use crate::ingest::fingerprint::fingerprint;
use crate::ingest::parser::{parse_feed, EntryOutcome};
use crate::storage::{
    Database, ExtractionStatus, Feed, FeedOutcome, FeedOutcomeStatus, InsertOutcome, JobStatus,
    NewPost, StorageError,
};

/// Aggregate result of one ingestion tick.
#[derive(Debug, Clone, Copy)]
pub struct TickSummary {
    pub job_id: i64,
    pub status: JobStatus,
    pub feeds_processed: usize,
    pub feeds_unchanged: usize,
    pub feeds_failed: usize,
    pub new_posts: i64,
    pub duplicates: i64,
    pub failed: i64,
}

/// Drives one ingestion pass: fan out over the registered feeds, run each
/// through fetch / parse / extract / store, and record the job.
///
/// Per-feed failures never escape a tick; only job bookkeeping against
/// storage can fail `run_once` itself.
pub struct Coordinator {
    db: Database,
    fetcher: Fetcher,
    extractor: ContentExtractor,
    concurrency: usize,
}

impl Coordinator {
    pub fn new(
        db: Database,
        fetcher: Fetcher,
        extractor: ContentExtractor,
        concurrency: usize,
    ) -> Self {
        Self {
            db,
            fetcher,
            extractor,
            concurrency: concurrency.max(1),
        }
    }

    /// Run a single ingestion job over all feeds not marked inactive.
    ///
    /// `cancel` is checked before each feed starts: once set, in-flight feeds
    /// finish but no new ones begin, and the job is finalized as cancelled.
    pub async fn run_once(&self, cancel: &AtomicBool) -> Result<TickSummary, StorageError> {
        let feeds = self.db.active_feeds().await?;
        let job_id = self.db.begin_job().await?;
        tracing::info!(job_id, feeds = feeds.len(), "Ingestion tick started");

        // Futures are built eagerly (async fn bodies stay inert until polled)
        // so the stream holds no borrowing iterator or closure; rustc cannot
        // prove those general enough inside a spawned task (rust-lang #89976).
        let feed_futures: Vec<_> = feeds
            .iter()
            .map(|feed| self.process_feed(feed, cancel))
            .collect();
        let outcomes: Vec<FeedOutcome> = stream::iter(feed_futures)
            .buffer_unordered(self.concurrency)
            .filter_map(|outcome| async move { outcome })
            .collect()
            .await;

        let status = if cancel.load(Ordering::SeqCst) {
            JobStatus::Cancelled
        } else {
            JobStatus::Completed
        };
        self.db.finalize_job(job_id, status, &outcomes).await?;

        let mut summary = TickSummary {
            job_id,
            status,
            feeds_processed: outcomes.len(),
            feeds_unchanged: 0,
            feeds_failed: 0,
            new_posts: 0,
            duplicates: 0,
            failed: 0,
        };
        for outcome in &outcomes {
            summary.new_posts += outcome.new_posts;
            summary.duplicates += outcome.duplicates;
            summary.failed += outcome.failed;
            match outcome.status {
                FeedOutcomeStatus::Unchanged => summary.feeds_unchanged += 1,
                FeedOutcomeStatus::Failed => summary.feeds_failed += 1,
                FeedOutcomeStatus::Updated => {}
            }
        }

        tracing::info!(
            job_id,
            status = ?status,
            feeds = summary.feeds_processed,
            unchanged = summary.feeds_unchanged,
            feed_failures = summary.feeds_failed,
            new_posts = summary.new_posts,
            duplicates = summary.duplicates,
            failed = summary.failed,
            "Ingestion tick finished"
        );

        Ok(summary)
    }

    /// Returns `None` when the feed was skipped because cancellation was
    /// already requested.
    async fn process_feed(&self, feed: &Feed, cancel: &AtomicBool) -> Option<FeedOutcome> {
        if cancel.load(Ordering::SeqCst) {
            tracing::debug!(feed = %feed.url, "Skipping feed, cancellation requested");
            return None;
        }

        let validators = CacheValidators {
            etag: feed.etag.clone(),
            last_modified: feed.last_modified.clone(),
        };

        let (bytes, validators) = match self.fetcher.fetch_feed(&feed.url, &validators).await {
            Ok(FeedFetch::Fetched { bytes, validators }) => (bytes, validators),
            Ok(FeedFetch::NotModified) => {
                if let Err(e) = self.db.record_fetch_not_modified(feed.id).await {
                    return Some(self.failed_outcome(feed, e.to_string()));
                }
                tracing::debug!(feed = %feed.url, "Feed not modified");
                return Some(FeedOutcome {
                    feed_id: feed.id,
                    new_posts: 0,
                    duplicates: 0,
                    failed: 0,
                    status: FeedOutcomeStatus::Unchanged,
                    error: None,
                });
            }
            Err(e) => return Some(self.fetch_failed_outcome(feed, e.to_string()).await),
        };

        let parsed = match parse_feed(&bytes) {
            Ok(parsed) => parsed,
            Err(e) => return Some(self.fetch_failed_outcome(feed, e.to_string()).await),
        };

        tracing::debug!(
            feed = %feed.url,
            format = %parsed.format,
            entries = parsed.entries.len(),
            "Feed fetched"
        );

        let mut new_posts = 0i64;
        let mut duplicates = 0i64;
        let mut failed = 0i64;

        for entry in parsed.entries {
            let entry = match entry {
                EntryOutcome::Parsed(entry) => entry,
                EntryOutcome::Skipped { reason } => {
                    tracing::debug!(feed = %feed.url, reason, "Entry skipped");
                    failed += 1;
                    continue;
                }
            };

            let fp = fingerprint(entry.guid.as_deref(), entry.link.as_deref(), &entry.title);

            match self.db.post_by_fingerprint(&fp).await {
                Ok(Some(existing)) => {
                    duplicates += 1;
                    // A post stored from its summary can be upgraded once the
                    // entry reappears with a link we can extract from
                    if existing.extraction_status == ExtractionStatus::DegradedSummary
                        && entry.link.is_some()
                    {
                        let extracted = self
                            .extractor
                            .extract(entry.link.as_deref(), entry.summary.as_deref())
                            .await;
                        if extracted.status == ExtractionStatus::Full {
                            match self
                                .db
                                .promote_post_content(existing.id, &extracted.content)
                                .await
                            {
                                Ok(true) => {
                                    tracing::debug!(
                                        post_id = existing.id,
                                        "Promoted post to full content"
                                    );
                                }
                                Ok(false) => {}
                                Err(e) => {
                                    return Some(self.abandoned_outcome(
                                        feed,
                                        e,
                                        new_posts,
                                        duplicates,
                                        failed,
                                    ));
                                }
                            }
                        }
                    }
                }
                Ok(None) => {
                    let extracted = self
                        .extractor
                        .extract(entry.link.as_deref(), entry.summary.as_deref())
                        .await;
                    let post = NewPost {
                        feed_id: feed.id,
                        url: entry.link,
                        title: entry.title,
                        published: entry.published,
                        content: extracted.content,
                        extraction_status: extracted.status,
                        fingerprint: fp,
                    };
                    match self.db.insert_post_if_new(&post).await {
                        Ok(InsertOutcome::Inserted(_)) => new_posts += 1,
                        // Another worker got there first between the probe
                        // and the insert
                        Ok(InsertOutcome::Duplicate) => duplicates += 1,
                        Err(e) => {
                            return Some(self.abandoned_outcome(
                                feed,
                                e,
                                new_posts,
                                duplicates,
                                failed,
                            ));
                        }
                    }
                }
                Err(e) => {
                    return Some(self.abandoned_outcome(feed, e, new_posts, duplicates, failed));
                }
            }
        }

        if let Err(e) = self
            .db
            .record_fetch_success(
                feed.id,
                validators.etag.as_deref(),
                validators.last_modified.as_deref(),
            )
            .await
        {
            return Some(self.failed_outcome(feed, e.to_string()));
        }

        Some(FeedOutcome {
            feed_id: feed.id,
            new_posts,
            duplicates,
            failed,
            status: FeedOutcomeStatus::Updated,
            error: None,
        })
    }

    /// Fetch or parse failed: mark the feed unhealthy and report the error in
    /// the job outcome.
    async fn fetch_failed_outcome(&self, feed: &Feed, error: String) -> FeedOutcome {
        match self.db.record_fetch_failure(feed.id, &error).await {
            Ok(consecutive_errors) => {
                tracing::warn!(
                    feed = %feed.url,
                    error = %error,
                    consecutive_errors,
                    "Feed fetch failed"
                );
            }
            Err(e) => {
                tracing::error!(feed = %feed.url, error = %e, "Could not record fetch failure");
            }
        }
        FeedOutcome {
            feed_id: feed.id,
            new_posts: 0,
            duplicates: 0,
            failed: 0,
            status: FeedOutcomeStatus::Failed,
            error: Some(error),
        }
    }

    /// Storage stopped cooperating mid-feed: keep the counts accumulated so
    /// far, skip the remaining entries, and leave fetch health alone since
    /// the feed itself was fine.
    fn abandoned_outcome(
        &self,
        feed: &Feed,
        error: StorageError,
        new_posts: i64,
        duplicates: i64,
        failed: i64,
    ) -> FeedOutcome {
        let error = error.to_string();
        tracing::error!(
            feed = %feed.url,
            error = %error,
            "Storage failure mid-feed, abandoning remaining entries"
        );
        FeedOutcome {
            feed_id: feed.id,
            new_posts,
            duplicates,
            failed,
            status: FeedOutcomeStatus::Failed,
            error: Some(error),
        }
    }

    fn failed_outcome(&self, feed: &Feed, error: String) -> FeedOutcome {
        tracing::error!(feed = %feed.url, error = %error, "Feed bookkeeping failed");
        FeedOutcome {
            feed_id: feed.id,
            new_posts: 0,
            duplicates: 0,
            failed: 0,
            status: FeedOutcomeStatus::Failed,
            error: Some(error),
        }
    }
}
