//! PostgreSQL-backed status store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::stages::StageKind;

use super::{CurrentStatus, DatasetStatus, LogEntry, LogLevel, StatusError, StatusStore};

/// Status store backed by the `dataset_status` and `processing_logs` tables.
pub struct PgStatusStore {
    pool: PgPool,
}

impl PgStatusStore {
    /// Connects to the database and returns a new store.
    pub async fn connect(database_url: &str) -> Result<Self, StatusError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StatusError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a store from an existing pool.
    ///
    /// Useful when sharing a pool with the task queue.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the status tables if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), StatusError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dataset_status (
                dataset_id BIGINT PRIMARY KEY,
                current_status TEXT NOT NULL DEFAULT 'idle',
                is_upload_done BOOLEAN NOT NULL DEFAULT FALSE,
                is_ortho_done BOOLEAN NOT NULL DEFAULT FALSE,
                is_metadata_done BOOLEAN NOT NULL DEFAULT FALSE,
                is_cog_done BOOLEAN NOT NULL DEFAULT FALSE,
                is_thumbnail_done BOOLEAN NOT NULL DEFAULT FALSE,
                is_deadwood_done BOOLEAN NOT NULL DEFAULT FALSE,
                is_forest_cover_done BOOLEAN NOT NULL DEFAULT FALSE,
                is_odm_done BOOLEAN NOT NULL DEFAULT FALSE,
                has_error BOOLEAN NOT NULL DEFAULT FALSE,
                error_message TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processing_logs (
                id BIGSERIAL PRIMARY KEY,
                dataset_id BIGINT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_processing_logs_dataset \
             ON processing_logs (dataset_id, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_status(row: &sqlx::postgres::PgRow) -> DatasetStatus {
        let current: String = row.get("current_status");
        DatasetStatus {
            dataset_id: row.get("dataset_id"),
            current_status: CurrentStatus::parse(&current),
            is_upload_done: row.get("is_upload_done"),
            is_ortho_done: row.get("is_ortho_done"),
            is_metadata_done: row.get("is_metadata_done"),
            is_cog_done: row.get("is_cog_done"),
            is_thumbnail_done: row.get("is_thumbnail_done"),
            is_deadwood_done: row.get("is_deadwood_done"),
            is_forest_cover_done: row.get("is_forest_cover_done"),
            is_odm_done: row.get("is_odm_done"),
            has_error: row.get("has_error"),
            error_message: row.get("error_message"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn get(&self, dataset_id: i64) -> Result<Option<DatasetStatus>, StatusError> {
        let row = sqlx::query("SELECT * FROM dataset_status WHERE dataset_id = $1")
            .bind(dataset_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(Self::row_to_status))
    }

    async fn ensure(&self, dataset_id: i64) -> Result<DatasetStatus, StatusError> {
        sqlx::query(
            "INSERT INTO dataset_status (dataset_id) VALUES ($1) \
             ON CONFLICT (dataset_id) DO NOTHING",
        )
        .bind(dataset_id)
        .execute(&self.pool)
        .await?;

        self.get(dataset_id)
            .await?
            .ok_or(StatusError::NotFound(dataset_id))
    }

    async fn set_current(
        &self,
        dataset_id: i64,
        status: CurrentStatus,
    ) -> Result<(), StatusError> {
        let result = sqlx::query(
            "UPDATE dataset_status SET current_status = $2, updated_at = NOW() \
             WHERE dataset_id = $1",
        )
        .bind(dataset_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StatusError::NotFound(dataset_id));
        }
        Ok(())
    }

    async fn mark_done(&self, dataset_id: i64, stage: StageKind) -> Result<(), StatusError> {
        // done_column() is a static string from a closed enum, never user input.
        let query = format!(
            "UPDATE dataset_status SET {} = TRUE, updated_at = NOW() WHERE dataset_id = $1",
            stage.done_column()
        );
        let result = sqlx::query(&query).bind(dataset_id).execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            return Err(StatusError::NotFound(dataset_id));
        }
        Ok(())
    }

    async fn set_error(&self, dataset_id: i64, message: &str) -> Result<(), StatusError> {
        let result = sqlx::query(
            "UPDATE dataset_status \
             SET has_error = TRUE, error_message = $2, current_status = 'idle', \
                 updated_at = NOW() \
             WHERE dataset_id = $1",
        )
        .bind(dataset_id)
        .bind(message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StatusError::NotFound(dataset_id));
        }
        Ok(())
    }

    async fn reset_for_stages(
        &self,
        dataset_id: i64,
        stages: &[StageKind],
    ) -> Result<(), StatusError> {
        let mut sets: Vec<String> = stages
            .iter()
            .map(|s| format!("{} = FALSE", s.done_column()))
            .collect();
        sets.push("has_error = FALSE".to_string());
        sets.push("error_message = NULL".to_string());
        sets.push("updated_at = NOW()".to_string());

        let query = format!(
            "UPDATE dataset_status SET {} WHERE dataset_id = $1",
            sets.join(", ")
        );
        let result = sqlx::query(&query).bind(dataset_id).execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            return Err(StatusError::NotFound(dataset_id));
        }
        Ok(())
    }

    async fn record_log(
        &self,
        dataset_id: i64,
        level: LogLevel,
        message: &str,
    ) -> Result<(), StatusError> {
        sqlx::query(
            "INSERT INTO processing_logs (dataset_id, level, message) VALUES ($1, $2, $3)",
        )
        .bind(dataset_id)
        .bind(level.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_errors(
        &self,
        dataset_id: i64,
        limit: i64,
    ) -> Result<Vec<LogEntry>, StatusError> {
        let rows = sqlx::query(
            "SELECT dataset_id, level, message, created_at FROM processing_logs \
             WHERE dataset_id = $1 AND level = 'error' \
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(dataset_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let entries = rows
            .iter()
            .map(|row| {
                let created_at: DateTime<Utc> = row.get("created_at");
                LogEntry {
                    dataset_id: row.get("dataset_id"),
                    level: LogLevel::Error,
                    message: row.get("message"),
                    created_at,
                }
            })
            .collect();

        Ok(entries)
    }
}
