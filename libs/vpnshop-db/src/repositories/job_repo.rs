use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};

use super::JobRepository;
use crate::models::job::{Job, NewJob};

#[derive(Debug, Clone)]
pub struct PgJobRepository {
    pool: PgPool,
}

impl PgJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub(crate) async fn insert_job(conn: &mut PgConnection, job: &NewJob) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO jobs (kind, dedupe_key, payload) VALUES ($1, $2, $3)
         ON CONFLICT (dedupe_key) DO NOTHING",
    )
    .bind(job.payload.kind())
    .bind(&job.dedupe_key)
    .bind(Json(&job.payload))
    .execute(&mut *conn)
    .await
    .context("Failed to enqueue job")?;
    Ok(result.rows_affected() == 1)
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn enqueue(&self, job: &NewJob) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        insert_job(&mut conn, job).await
    }

    async fn claim(&self, limit: i64, lease_secs: i64) -> Result<Vec<Job>> {
        sqlx::query_as::<_, Job>(
            "UPDATE jobs SET status = 'RUNNING', attempts = attempts + 1,
                locked_until = NOW() + make_interval(secs => $2), updated_at = NOW()
             WHERE id IN (
                SELECT id FROM jobs
                WHERE (status = 'PENDING' AND run_at <= NOW())
                   OR (status = 'RUNNING' AND locked_until < NOW())
                ORDER BY run_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
             )
             RETURNING *",
        )
        .bind(limit)
        .bind(lease_secs as f64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to claim jobs")
    }

    async fn complete(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'DONE', locked_until = NULL, last_error = NULL, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reschedule(&self, id: i64, error: &str, run_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'PENDING', run_at = $1, last_error = $2, locked_until = NULL, updated_at = NOW() WHERE id = $3",
        )
        .bind(run_at)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bury(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'DEAD', last_error = $1, locked_until = NULL, updated_at = NOW() WHERE id = $2",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_key(&self, dedupe_key: &str) -> Result<Option<Job>> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE dedupe_key = $1")
            .bind(dedupe_key)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch job")
    }
}
