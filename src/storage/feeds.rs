use chrono::Utc;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{Feed, FeedRegistration, FeedRow, FeedStatus, StorageError};

fn tags_json(reg: &FeedRegistration) -> String {
    serde_json::to_string(&reg.tags).unwrap_or_else(|_| "[]".to_string())
}

fn extra_json(reg: &FeedRegistration) -> String {
    serde_json::to_string(&reg.extra).unwrap_or_else(|_| "{}".to_string())
}

impl Database {
    // ========================================================================
    // Feed Registration
    // ========================================================================

    /// Register feeds from OPML import, batched in chunks of 100.
    ///
    /// Insert-or-update by unique URL: title, tags, and the extension map are
    /// refreshed, fetch health (validators, status, error counter) is
    /// preserved.
    pub async fn register_feeds(&self, feeds: &[FeedRegistration]) -> Result<(), StorageError> {
        if feeds.is_empty() {
            return Ok(());
        }

        const BATCH_SIZE: usize = 100;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for chunk in feeds.chunks(BATCH_SIZE) {
            let rows: Vec<(String, String)> = chunk
                .iter()
                .map(|reg| (tags_json(reg), extra_json(reg)))
                .collect();

            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("INSERT INTO feeds (url, title, tags, extra, created_at) ");

            builder.push_values(chunk.iter().zip(&rows), |mut b, (reg, (tags, extra))| {
                b.push_bind(&reg.url)
                    .push_bind(reg.title.as_deref().unwrap_or(&reg.url))
                    .push_bind(tags)
                    .push_bind(extra)
                    .push_bind(now);
            });

            builder.push(
                " ON CONFLICT(url) DO UPDATE SET \
                 title = excluded.title, tags = excluded.tags, extra = excluded.extra",
            );

            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Insert or update a single feed by URL, returning its id.
    pub async fn upsert_feed(&self, reg: &FeedRegistration) -> Result<i64, StorageError> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO feeds (url, title, tags, extra, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(url) DO UPDATE SET
                 title = excluded.title, tags = excluded.tags, extra = excluded.extra
             RETURNING id",
        )
        .bind(&reg.url)
        .bind(reg.title.as_deref().unwrap_or(&reg.url))
        .bind(tags_json(reg))
        .bind(extra_json(reg))
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::from_sqlx)?;
        Ok(row.0)
    }

    // ========================================================================
    // Feed Queries
    // ========================================================================

    /// Feeds eligible for the next tick: everything not manually deactivated.
    ///
    /// Feeds in `error` status stay in rotation; a later successful fetch
    /// clears the status. Only `inactive` excludes a feed.
    pub async fn active_feeds(&self) -> Result<Vec<Feed>, StorageError> {
        let rows: Vec<FeedRow> = sqlx::query_as(
            "SELECT id, url, title, tags, extra, etag, last_modified, last_fetched,
                    status, last_error, consecutive_errors, created_at
             FROM feeds WHERE status != 'inactive' ORDER BY title",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FeedRow::into_feed).collect())
    }

    /// All registered feeds regardless of status.
    pub async fn all_feeds(&self) -> Result<Vec<Feed>, StorageError> {
        let rows: Vec<FeedRow> = sqlx::query_as(
            "SELECT id, url, title, tags, extra, etag, last_modified, last_fetched,
                    status, last_error, consecutive_errors, created_at
             FROM feeds ORDER BY title",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FeedRow::into_feed).collect())
    }

    /// Look up a feed by its canonical URL.
    pub async fn feed_by_url(&self, url: &str) -> Result<Option<Feed>, StorageError> {
        let row: Option<FeedRow> = sqlx::query_as(
            "SELECT id, url, title, tags, extra, etag, last_modified, last_fetched,
                    status, last_error, consecutive_errors, created_at
             FROM feeds WHERE url = ?",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(FeedRow::into_feed))
    }

    // ========================================================================
    // Fetch-Cycle Writes
    // ========================================================================

    /// Record a successful fetch: store the new cache validators, stamp
    /// `last_fetched`, clear error state. Validators from the response replace
    /// the stored pair even when absent, so a feed that stops sending them
    /// falls back to unconditional fetches.
    pub async fn record_fetch_success(
        &self,
        feed_id: i64,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE feeds SET etag = ?, last_modified = ?, last_fetched = ?,
                    status = 'active', last_error = NULL, consecutive_errors = 0
             WHERE id = ?",
        )
        .bind(etag)
        .bind(last_modified)
        .bind(Utc::now())
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a 304 Not Modified: stamp `last_fetched` and clear error state,
    /// leaving the stored validators untouched.
    pub async fn record_fetch_not_modified(&self, feed_id: i64) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE feeds SET last_fetched = ?,
                    status = 'active', last_error = NULL, consecutive_errors = 0
             WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed fetch: mark the feed `error` and bump its consecutive
    /// failure counter. Returns the new count.
    pub async fn record_fetch_failure(
        &self,
        feed_id: i64,
        error: &str,
    ) -> Result<i64, StorageError> {
        let result: (i64,) = sqlx::query_as(
            "UPDATE feeds SET status = 'error', last_error = ?,
                    consecutive_errors = consecutive_errors + 1
             WHERE id = ? RETURNING consecutive_errors",
        )
        .bind(error)
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(result.0)
    }

    /// Manually activate or deactivate a feed. Rows are never deleted;
    /// `inactive` removes a feed from rotation while keeping its posts.
    pub async fn set_feed_status(
        &self,
        feed_id: i64,
        status: FeedStatus,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE feeds SET status = ? WHERE id = ?")
            .bind(status)
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
