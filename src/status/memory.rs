//! In-memory status store.
//!
//! Backs the scheduler tests and local development runs where no database is
//! available. Behavior mirrors [`super::PgStatusStore`] exactly, including
//! the idle reset on error.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::stages::StageKind;

use super::{CurrentStatus, DatasetStatus, LogEntry, LogLevel, StatusError, StatusStore};

/// Status store held entirely in process memory.
#[derive(Default)]
pub struct MemoryStatusStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    rows: HashMap<i64, DatasetStatus>,
    logs: Vec<LogEntry>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a status row, replacing any existing one.
    pub fn insert(&self, status: DatasetStatus) {
        let mut inner = self.inner.lock().unwrap();
        inner.rows.insert(status.dataset_id, status);
    }

    /// All persisted log lines, oldest first. Test helper.
    pub fn all_logs(&self) -> Vec<LogEntry> {
        self.inner.lock().unwrap().logs.clone()
    }

    fn with_row<T>(
        &self,
        dataset_id: i64,
        f: impl FnOnce(&mut DatasetStatus) -> T,
    ) -> Result<T, StatusError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner
            .rows
            .get_mut(&dataset_id)
            .ok_or(StatusError::NotFound(dataset_id))?;
        row.updated_at = Utc::now();
        Ok(f(row))
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn get(&self, dataset_id: i64) -> Result<Option<DatasetStatus>, StatusError> {
        Ok(self.inner.lock().unwrap().rows.get(&dataset_id).cloned())
    }

    async fn ensure(&self, dataset_id: i64) -> Result<DatasetStatus, StatusError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .rows
            .entry(dataset_id)
            .or_insert_with(|| DatasetStatus::new(dataset_id))
            .clone())
    }

    async fn set_current(
        &self,
        dataset_id: i64,
        status: CurrentStatus,
    ) -> Result<(), StatusError> {
        self.with_row(dataset_id, |row| row.current_status = status)
    }

    async fn mark_done(&self, dataset_id: i64, stage: StageKind) -> Result<(), StatusError> {
        self.with_row(dataset_id, |row| row.set_done(stage, true))
    }

    async fn set_error(&self, dataset_id: i64, message: &str) -> Result<(), StatusError> {
        self.with_row(dataset_id, |row| {
            row.has_error = true;
            row.error_message = Some(message.to_string());
            row.current_status = CurrentStatus::Idle;
        })
    }

    async fn reset_for_stages(
        &self,
        dataset_id: i64,
        stages: &[StageKind],
    ) -> Result<(), StatusError> {
        self.with_row(dataset_id, |row| {
            for stage in stages {
                row.set_done(*stage, false);
            }
            row.has_error = false;
            row.error_message = None;
        })
    }

    async fn record_log(
        &self,
        dataset_id: i64,
        level: LogLevel,
        message: &str,
    ) -> Result<(), StatusError> {
        let mut inner = self.inner.lock().unwrap();
        inner.logs.push(LogEntry {
            dataset_id,
            level,
            message: message.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn recent_errors(
        &self,
        dataset_id: i64,
        limit: i64,
    ) -> Result<Vec<LogEntry>, StatusError> {
        let inner = self.inner.lock().unwrap();
        let mut errors: Vec<LogEntry> = inner
            .logs
            .iter()
            .filter(|e| e.dataset_id == dataset_id && e.level == LogLevel::Error)
            .cloned()
            .collect();
        errors.reverse();
        errors.truncate(limit as usize);
        Ok(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_creates_idle_row() {
        let store = MemoryStatusStore::new();
        let status = store.ensure(42).await.unwrap();
        assert!(status.current_status.is_idle());
        assert!(!status.has_error);
        assert!(store.get(42).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_set_error_returns_to_idle() {
        let store = MemoryStatusStore::new();
        store.ensure(42).await.unwrap();
        store
            .set_current(42, CurrentStatus::Processing(StageKind::Cog))
            .await
            .unwrap();

        store.set_error(42, "cog failed").await.unwrap();

        let status = store.get(42).await.unwrap().unwrap();
        assert!(status.has_error);
        assert_eq!(status.error_message.as_deref(), Some("cog failed"));
        assert!(status.current_status.is_idle());
    }

    #[tokio::test]
    async fn test_reset_clears_only_requested_stages() {
        let store = MemoryStatusStore::new();
        store.ensure(42).await.unwrap();
        store.mark_done(42, StageKind::Metadata).await.unwrap();
        store.mark_done(42, StageKind::Cog).await.unwrap();
        store.set_error(42, "thumbnail failed").await.unwrap();

        store
            .reset_for_stages(42, &[StageKind::Cog, StageKind::Thumbnail])
            .await
            .unwrap();

        let status = store.get(42).await.unwrap().unwrap();
        assert!(status.is_done(StageKind::Metadata), "untouched flag cleared");
        assert!(!status.is_done(StageKind::Cog));
        assert!(!status.has_error);
        assert!(status.error_message.is_none());
    }

    #[tokio::test]
    async fn test_recent_errors_newest_first() {
        let store = MemoryStatusStore::new();
        store.ensure(1).await.unwrap();
        store.record_log(1, LogLevel::Info, "starting").await.unwrap();
        store.record_log(1, LogLevel::Error, "first").await.unwrap();
        store.record_log(1, LogLevel::Error, "second").await.unwrap();
        store.record_log(2, LogLevel::Error, "other dataset").await.unwrap();

        let errors = store.recent_errors(1, 10).await.unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].message, "second");
        assert_eq!(errors[1].message, "first");

        let capped = store.recent_errors(1, 1).await.unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_row_is_not_found() {
        let store = MemoryStatusStore::new();
        assert!(matches!(
            store.mark_done(9, StageKind::Cog).await,
            Err(StatusError::NotFound(9))
        ));
    }
}
