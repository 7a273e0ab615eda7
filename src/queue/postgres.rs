//! PostgreSQL-backed task queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::TieBreak;
use crate::stages::{normalize_requested, StageKind};

use super::{QueueError, QueueTask, TaskQueue};

/// Task queue backed by the `processing_queue` table.
pub struct PgTaskQueue {
    pool: PgPool,
    tie_break: TieBreak,
}

impl PgTaskQueue {
    /// Connects to the database and returns a new queue.
    pub async fn connect(database_url: &str, tie_break: TieBreak) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool, tie_break })
    }

    /// Creates a queue from an existing pool.
    pub fn from_pool(pool: PgPool, tie_break: TieBreak) -> Self {
        Self { pool, tie_break }
    }

    /// Creates the queue table and the priority-ordered view if missing.
    pub async fn ensure_schema(&self) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processing_queue (
                id BIGSERIAL PRIMARY KEY,
                dataset_id BIGINT NOT NULL,
                user_id UUID NOT NULL,
                task_types TEXT[] NOT NULL,
                priority SMALLINT NOT NULL DEFAULT 2,
                is_processing BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE OR REPLACE VIEW processing_queue_view AS \
             SELECT * FROM processing_queue ORDER BY priority DESC, created_at ASC",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn order_clause(&self) -> &'static str {
        match self.tie_break {
            TieBreak::EnqueueTime => "ORDER BY priority DESC, created_at ASC",
            TieBreak::RowId => "ORDER BY priority DESC, id ASC",
        }
    }

    fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<QueueTask, QueueError> {
        let task_id: i64 = row.get("id");
        let raw_types: Vec<String> = row.get("task_types");

        let mut task_types = Vec::with_capacity(raw_types.len());
        for raw in &raw_types {
            let stage: StageKind = raw
                .parse()
                .map_err(|source| QueueError::UnknownStage { task_id, source })?;
            task_types.push(stage);
        }

        let created_at: DateTime<Utc> = row.get("created_at");
        Ok(QueueTask {
            id: task_id,
            dataset_id: row.get("dataset_id"),
            user_id: row.get("user_id"),
            task_types: normalize_requested(&task_types),
            priority: row.get("priority"),
            is_processing: row.get("is_processing"),
            created_at,
        })
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn next_task(&self) -> Result<Option<QueueTask>, QueueError> {
        let query = format!(
            "SELECT id, dataset_id, user_id, task_types, priority, is_processing, created_at \
             FROM processing_queue {} LIMIT 1",
            self.order_clause()
        );

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn delete(&self, task_id: i64) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM processing_queue WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn submit(
        &self,
        dataset_id: i64,
        user_id: Uuid,
        task_types: Vec<StageKind>,
        priority: i16,
    ) -> Result<QueueTask, QueueError> {
        let normalized = normalize_requested(&task_types);
        let raw_types: Vec<String> = normalized.iter().map(|s| s.as_str().to_string()).collect();

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM processing_queue WHERE dataset_id = $1")
            .bind(dataset_id)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(
            "INSERT INTO processing_queue (dataset_id, user_id, task_types, priority) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, dataset_id, user_id, task_types, priority, is_processing, created_at",
        )
        .bind(dataset_id)
        .bind(user_id)
        .bind(&raw_types)
        .bind(priority)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Self::row_to_task(&row)
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM processing_queue")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.get("n");
        Ok(n as usize)
    }
}
