//! In-memory task queue with the same ordering semantics as the Postgres
//! view: priority descending, then the configured tie-break.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::config::TieBreak;
use crate::stages::{normalize_requested, StageKind};

use super::{QueueError, QueueTask, TaskQueue};

/// Task queue held entirely in process memory.
pub struct MemoryTaskQueue {
    rows: Mutex<Vec<QueueTask>>,
    next_id: AtomicI64,
    tie_break: TieBreak,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            tie_break: TieBreak::EnqueueTime,
        }
    }

    pub fn with_tie_break(tie_break: TieBreak) -> Self {
        Self {
            tie_break,
            ..Self::new()
        }
    }

    /// Whether a row exists for the dataset. Test helper.
    pub fn contains_dataset(&self, dataset_id: i64) -> bool {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .any(|t| t.dataset_id == dataset_id)
    }

    fn ranked(&self) -> Vec<QueueTask> {
        let mut rows = self.rows.lock().unwrap().clone();
        match self.tie_break {
            TieBreak::EnqueueTime => {
                rows.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)))
            }
            TieBreak::RowId => {
                rows.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)))
            }
        }
        rows
    }
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn next_task(&self) -> Result<Option<QueueTask>, QueueError> {
        Ok(self.ranked().into_iter().next())
    }

    async fn delete(&self, task_id: i64) -> Result<(), QueueError> {
        self.rows.lock().unwrap().retain(|t| t.id != task_id);
        Ok(())
    }

    async fn submit(
        &self,
        dataset_id: i64,
        user_id: Uuid,
        task_types: Vec<StageKind>,
        priority: i16,
    ) -> Result<QueueTask, QueueError> {
        let task = QueueTask {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            dataset_id,
            user_id,
            task_types: normalize_requested(&task_types),
            priority,
            is_processing: false,
            created_at: Utc::now(),
        };

        let mut rows = self.rows.lock().unwrap();
        rows.retain(|t| t.dataset_id != dataset_id);
        rows.push(task.clone());
        Ok(task)
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.rows.lock().unwrap().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn submit(queue: &MemoryTaskQueue, dataset: i64, priority: i16) -> QueueTask {
        queue
            .submit(dataset, Uuid::new_v4(), vec![StageKind::Cog], priority)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_priority_descending() {
        let queue = MemoryTaskQueue::new();
        submit(&queue, 1, 2).await;
        submit(&queue, 2, 5).await;
        submit(&queue, 3, 1).await;

        // [2, 5, 1] submitted in that order drains as 5, 2, 1.
        let mut seen = Vec::new();
        while let Some(task) = queue.next_task().await.unwrap() {
            seen.push(task.priority);
            queue.delete(task.id).await.unwrap();
        }
        assert_eq!(seen, vec![5, 2, 1]);
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let queue = MemoryTaskQueue::new();
        let first = submit(&queue, 1, 3).await;
        let second = submit(&queue, 2, 3).await;
        assert!(first.created_at <= second.created_at);

        let top = queue.next_task().await.unwrap().unwrap();
        assert_eq!(top.dataset_id, 1);
    }

    #[tokio::test]
    async fn test_row_id_tie_break() {
        let queue = MemoryTaskQueue::with_tie_break(TieBreak::RowId);
        submit(&queue, 1, 3).await;
        submit(&queue, 2, 3).await;

        let top = queue.next_task().await.unwrap().unwrap();
        assert_eq!(top.dataset_id, 1);
    }

    #[tokio::test]
    async fn test_resubmission_replaces_row() {
        let queue = MemoryTaskQueue::new();
        submit(&queue, 42, 1).await;
        submit(&queue, 42, 4).await;
        submit(&queue, 42, 2).await;

        assert_eq!(queue.len().await.unwrap(), 1);
        let top = queue.next_task().await.unwrap().unwrap();
        assert_eq!(top.priority, 2);
    }

    #[tokio::test]
    async fn test_empty_queue_is_none() {
        let queue = MemoryTaskQueue::new();
        assert!(queue.next_task().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let queue = MemoryTaskQueue::new();
        let task = submit(&queue, 1, 1).await;
        queue.delete(task.id).await.unwrap();
        queue.delete(task.id).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 0);
    }
}
