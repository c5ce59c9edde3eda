use chrono::{DateTime, Utc};
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{FeedOutcome, IngestionJob, JobOutcome, JobStatus, StorageError};

impl Database {
    // ========================================================================
    // Ingestion Job Audit Trail
    // ========================================================================

    /// Open a job record at tick start. Returns the job id.
    pub async fn begin_job(&self) -> Result<i64, StorageError> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO ingestion_jobs (started_at, status) VALUES (?, 'running')
             RETURNING id",
        )
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Finalize a job exactly once: stamp the end time, set the overall
    /// status, and append the per-feed outcome rows in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] if the job was already finalized;
    /// finalized jobs are immutable.
    pub async fn finalize_job(
        &self,
        job_id: i64,
        status: JobStatus,
        outcomes: &[FeedOutcome],
    ) -> Result<(), StorageError> {
        const BATCH_SIZE: usize = 100;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE ingestion_jobs SET finished_at = ?, status = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(Utc::now())
        .bind(status)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StorageError::Conflict);
        }

        for chunk in outcomes.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO job_outcomes
                 (job_id, feed_id, new_posts, duplicates, failed, status, error) ",
            );

            builder.push_values(chunk, |mut b, outcome| {
                b.push_bind(job_id)
                    .push_bind(outcome.feed_id)
                    .push_bind(outcome.new_posts)
                    .push_bind(outcome.duplicates)
                    .push_bind(outcome.failed)
                    .push_bind(outcome.status)
                    .push_bind(&outcome.error);
            });

            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Jobs started at or after `since`, newest first.
    pub async fn recent_jobs(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<IngestionJob>, StorageError> {
        let jobs: Vec<IngestionJob> = sqlx::query_as(
            "SELECT id, started_at, finished_at, status FROM ingestion_jobs
             WHERE started_at >= ? ORDER BY started_at DESC, id DESC LIMIT ?",
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Look up one job.
    pub async fn job_by_id(&self, job_id: i64) -> Result<Option<IngestionJob>, StorageError> {
        let job: Option<IngestionJob> = sqlx::query_as(
            "SELECT id, started_at, finished_at, status FROM ingestion_jobs WHERE id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Per-feed outcome rows for one job.
    pub async fn job_outcomes(&self, job_id: i64) -> Result<Vec<JobOutcome>, StorageError> {
        let outcomes: Vec<JobOutcome> = sqlx::query_as(
            "SELECT job_id, feed_id, new_posts, duplicates, failed, status, error
             FROM job_outcomes WHERE job_id = ? ORDER BY feed_id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(outcomes)
    }
}
