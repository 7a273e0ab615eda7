//! Task queue over the external submission table.
//!
//! Submissions land in the `processing_queue` table through the external
//! API; the worker only ever reads the single highest-priority ready row and
//! deletes rows on terminal outcomes. Ordering is priority-descending with an
//! explicit, configurable secondary key (the source view left the
//! within-priority order undefined).
//!
//! Resubmission is delete-then-insert on the external side and is not atomic
//! with respect to an in-flight worker; the scheduler does not try to close
//! that race.

mod memory;
mod postgres;

pub use memory::MemoryTaskQueue;
pub use postgres::PgTaskQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::stages::{normalize_requested, StageKind};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// A stored stage identifier could not be parsed.
    #[error("Task {task_id} carries an unknown stage: {source}")]
    UnknownStage {
        task_id: i64,
        source: crate::stages::UnknownStage,
    },
}

/// One pending unit of work.
///
/// `task_types` is deduplicated and held in canonical pipeline order no
/// matter what order the submission listed the stages in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueTask {
    pub id: i64,
    pub dataset_id: i64,
    pub user_id: Uuid,
    pub task_types: Vec<StageKind>,
    /// Numeric priority; the ready view orders by this descending.
    pub priority: i16,
    /// Legacy marker, superseded by the status row's `current_status`.
    pub is_processing: bool,
    pub created_at: DateTime<Utc>,
}

impl QueueTask {
    /// Builds a task, normalizing the requested stages.
    pub fn new(
        id: i64,
        dataset_id: i64,
        user_id: Uuid,
        task_types: Vec<StageKind>,
        priority: i16,
    ) -> Self {
        Self {
            id,
            dataset_id,
            user_id,
            task_types: normalize_requested(&task_types),
            priority,
            is_processing: false,
            created_at: Utc::now(),
        }
    }
}

/// Read side of the submission queue, plus the delete-then-insert submission
/// primitive the external API uses (exposed here so tests and the dev CLI
/// can drive the queue the same way).
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// The single task at position 1 of the priority-ordered view.
    ///
    /// An empty queue is `Ok(None)`, not an error.
    async fn next_task(&self) -> Result<Option<QueueTask>, QueueError>;

    /// Deletes a queue row by task id. Deleting an already-deleted row is a
    /// no-op.
    async fn delete(&self, task_id: i64) -> Result<(), QueueError>;

    /// Submits a task for a dataset, deleting any prior row for that dataset
    /// first so at most one row per dataset ever exists.
    async fn submit(
        &self,
        dataset_id: i64,
        user_id: Uuid,
        task_types: Vec<StageKind>,
        priority: i16,
    ) -> Result<QueueTask, QueueError>;

    /// Number of pending rows.
    async fn len(&self) -> Result<usize, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_normalizes_stages() {
        let task = QueueTask::new(
            1,
            42,
            Uuid::new_v4(),
            vec![StageKind::Thumbnail, StageKind::Metadata, StageKind::Metadata],
            2,
        );
        assert_eq!(
            task.task_types,
            vec![StageKind::Metadata, StageKind::Thumbnail]
        );
        assert!(!task.is_processing);
    }
}
