use chrono::Utc;

use super::schema::Database;
use super::types::{InsertOutcome, NewPost, Post, PostRef, StorageError};

impl Database {
    // ========================================================================
    // Post Operations
    // ========================================================================

    /// Insert a post unless its fingerprint already exists.
    ///
    /// The `fingerprint` unique index is the dedup authority: when two workers
    /// race on the same syndicated item, the loser's constraint violation maps
    /// to [`InsertOutcome::Duplicate`] instead of an error.
    pub async fn insert_post_if_new(&self, post: &NewPost) -> Result<InsertOutcome, StorageError> {
        let result: Result<(i64,), sqlx::Error> = sqlx::query_as(
            "INSERT INTO posts
                 (feed_id, url, title, published, content, extraction_status,
                  fingerprint, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(post.feed_id)
        .bind(&post.url)
        .bind(&post.title)
        .bind(post.published)
        .bind(&post.content)
        .bind(post.extraction_status)
        .bind(&post.fingerprint)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok((id,)) => Ok(InsertOutcome::Inserted(id)),
            Err(err) => match StorageError::from_sqlx(err) {
                StorageError::Conflict => Ok(InsertOutcome::Duplicate),
                other => Err(other),
            },
        }
    }

    /// Cheap existence probe by fingerprint, used to skip the article-page
    /// fetch for entries already in the corpus. The unique index remains the
    /// arbiter; a miss here still goes through `insert_post_if_new`.
    pub(crate) async fn post_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<PostRef>, StorageError> {
        let row: Option<PostRef> = sqlx::query_as(
            "SELECT id, extraction_status FROM posts WHERE fingerprint = ?",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Upgrade a degraded post with a fully extracted body.
    ///
    /// Only moves `degraded_summary` to `full`, never the reverse; posts are
    /// otherwise immutable. Returns whether an upgrade happened.
    pub async fn promote_post_content(
        &self,
        post_id: i64,
        content: &str,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE posts SET content = ?, extraction_status = 'full'
             WHERE id = ? AND extraction_status = 'degraded_summary'",
        )
        .bind(content)
        .bind(post_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Post Queries
    // ========================================================================

    /// Posts for one feed, newest published first.
    pub async fn posts_for_feed(&self, feed_id: i64) -> Result<Vec<Post>, StorageError> {
        let posts: Vec<Post> = sqlx::query_as(
            "SELECT id, feed_id, url, title, published, content, extraction_status,
                    fingerprint, created_at
             FROM posts WHERE feed_id = ? ORDER BY published DESC, id DESC",
        )
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(posts)
    }

    /// Total number of posts in the corpus.
    pub async fn post_count(&self) -> Result<i64, StorageError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}
