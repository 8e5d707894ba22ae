//! Checkpoint repository for PostgreSQL

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::CheckpointError;
use crate::ingestion::{CheckpointStore, IngestProgress, RunKey};

const CREATE_PROGRESS_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS ingest_progress (
        run_key    TEXT PRIMARY KEY,
        progress   TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
"#;

const UPSERT_PROGRESS_SQL: &str = r#"
    INSERT INTO ingest_progress (run_key, progress, updated_at)
    VALUES ($1, $2, $3)
    ON CONFLICT (run_key)
    DO UPDATE SET progress = EXCLUDED.progress, updated_at = EXCLUDED.updated_at
"#;

/// Run a checkpoint query under a deadline.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, CheckpointError>
where
    F: Future<Output = Result<T, CheckpointError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CheckpointError::Timeout(limit)),
    }
}

/// Stores one JSON progress document per run in `ingest_progress`.
///
/// Every query runs under `timeout`.
#[derive(Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Create the progress table if it is missing.
    pub async fn ensure_schema(&self) -> Result<(), CheckpointError> {
        bounded(self.timeout, async {
            sqlx::query(CREATE_PROGRESS_TABLE_SQL)
                .execute(&self.pool)
                .await?;
            Ok::<_, CheckpointError>(())
        })
        .await
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, run_key: &RunKey) -> Result<Option<IngestProgress>, CheckpointError> {
        let row = bounded(self.timeout, async {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT progress FROM ingest_progress WHERE run_key = $1")
                    .bind(run_key.as_str())
                    .fetch_optional(&self.pool)
                    .await?;
            Ok::<_, CheckpointError>(row)
        })
        .await?;

        match row {
            Some((json,)) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, progress: &IngestProgress) -> Result<(), CheckpointError> {
        let json = serde_json::to_string(progress)?;
        let updated_at: DateTime<Utc> = progress.updated_at;

        bounded(self.timeout, async {
            sqlx::query(UPSERT_PROGRESS_SQL)
                .bind(progress.run_key.as_str())
                .bind(json)
                .bind(updated_at)
                .execute(&self.pool)
                .await?;
            Ok::<_, CheckpointError>(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<IngestProgress>, CheckpointError> {
        let rows = bounded(self.timeout, async {
            let rows: Vec<(String,)> =
                sqlx::query_as("SELECT progress FROM ingest_progress ORDER BY run_key")
                    .fetch_all(&self.pool)
                    .await?;
            Ok::<_, CheckpointError>(rows)
        })
        .await?;

        rows.into_iter()
            .map(|(json,)| serde_json::from_str(&json).map_err(CheckpointError::from))
            .collect()
    }
}
