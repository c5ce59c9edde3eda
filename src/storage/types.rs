use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Storage-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum StorageError {
    /// Another instance of the application has locked the database
    #[error("Another instance of weir appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A uniqueness constraint rejected the write (row already exists)
    #[error("A conflicting row already exists")]
    Conflict,

    /// Generic database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StorageError {
    /// Classify a sqlx error into conflict, lock contention, or pass-through.
    ///
    /// Callers treat [`StorageError::Conflict`] as a skip (the row exists) and
    /// everything else as a connectivity failure worth retrying next tick.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return StorageError::Conflict;
            }
        }

        let error_string = err.to_string().to_lowercase();

        // Check for SQLite lock-related error messages
        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return StorageError::InstanceLocked;
        }

        StorageError::Database(err)
    }
}

// ============================================================================
// Status Enums
// ============================================================================

/// Fetch-health status of a feed.
///
/// `Inactive` excludes a feed from ticks without deleting its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FeedStatus {
    Active,
    Error,
    Inactive,
}

/// How a post's body was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ExtractionStatus {
    /// Boilerplate removal succeeded on the fetched article page
    Full,
    /// Extraction failed or was impossible; body is the feed summary
    DegradedSummary,
}

/// Overall status of one ingestion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Cancelled,
}

/// Terminal status of one feed within one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FeedOutcomeStatus {
    /// Fetch succeeded and at least one new post landed
    Updated,
    /// Fetch succeeded (possibly 304) with nothing new
    Unchanged,
    /// Fetch, parse, or persistence failed at the feed level
    Failed,
}

// ============================================================================
// Input Types
// ============================================================================

/// A feed registration from OPML import or manual entry, upserted by URL.
#[derive(Debug, Clone)]
pub struct FeedRegistration {
    pub url: String,
    /// Display title when the source provides one; storage falls back to the URL
    pub title: Option<String>,
    /// Category tags; the first one names the export directory
    pub tags: Vec<String>,
    /// Open extension map for loosely-structured metadata (e.g. "htmlurl")
    pub extra: BTreeMap<String, String>,
}

/// A fully processed entry ready for insertion.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub feed_id: i64,
    pub url: Option<String>,
    pub title: String,
    pub published: Option<DateTime<Utc>>,
    pub content: String,
    pub extraction_status: ExtractionStatus,
    pub fingerprint: String,
}

/// Result of an insert-if-new attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// The fingerprint already exists in the corpus
    Duplicate,
}

/// Per-feed counters produced by one tick, written at job finalization.
#[derive(Debug, Clone)]
pub struct FeedOutcome {
    pub feed_id: i64,
    pub new_posts: i64,
    pub duplicates: i64,
    pub failed: i64,
    pub status: FeedOutcomeStatus,
    pub error: Option<String>,
}

// ============================================================================
// Helper Types
// ============================================================================

/// Internal row type for feed queries (used by sqlx FromRow).
/// Converts to Feed via into_feed(), parsing the JSON-in-TEXT columns.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedRow {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub tags: String,
    pub extra: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_fetched: Option<DateTime<Utc>>,
    pub status: FeedStatus,
    pub last_error: Option<String>,
    pub consecutive_errors: i64,
    pub created_at: DateTime<Utc>,
}

impl FeedRow {
    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            id: self.id,
            url: self.url,
            title: self.title,
            tags: serde_json::from_str(&self.tags).unwrap_or_default(),
            extra: serde_json::from_str(&self.extra).unwrap_or_default(),
            etag: self.etag,
            last_modified: self.last_modified,
            last_fetched: self.last_fetched,
            status: self.status,
            last_error: self.last_error,
            consecutive_errors: self.consecutive_errors,
            created_at: self.created_at,
        }
    }
}

/// Identity and extraction state of an existing post, for duplicate handling.
#[derive(Debug, Clone, Copy, sqlx::FromRow)]
pub(crate) struct PostRef {
    pub id: i64,
    pub extraction_status: ExtractionStatus,
}

// ============================================================================
// Data Structures
// ============================================================================

/// Feed data from database
#[derive(Debug, Clone)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub tags: Vec<String>,
    pub extra: BTreeMap<String, String>,
    /// HTTP cache validators replayed on the next conditional GET
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_fetched: Option<DateTime<Utc>>,
    pub status: FeedStatus,
    pub last_error: Option<String>,
    /// Consecutive fetch failures since the last success
    pub consecutive_errors: i64,
    pub created_at: DateTime<Utc>,
}

impl Feed {
    /// Category used for export grouping: the first tag, or "uncategorized".
    pub fn category(&self) -> &str {
        self.tags.first().map(String::as_str).unwrap_or("uncategorized")
    }
}

/// Post data from database. Immutable once written, except that
/// `promote_post_content` may upgrade a degraded body to a full one.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Post {
    pub id: i64,
    pub feed_id: i64,
    pub url: Option<String>,
    pub title: String,
    pub published: Option<DateTime<Utc>>,
    pub content: String,
    pub extraction_status: ExtractionStatus,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// Audit record of one scheduler tick.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IngestionJob {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
}

/// One feed's outcome row inside a finalized job.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobOutcome {
    pub job_id: i64,
    pub feed_id: i64,
    pub new_posts: i64,
    pub duplicates: i64,
    pub failed: i64,
    pub status: FeedOutcomeStatus,
    pub error: Option<String>,
}
