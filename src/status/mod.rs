//! Per-dataset pipeline state.
//!
//! The dataset status row is the authoritative state machine for a dataset:
//! which stage (if any) is currently executing, which stages have completed,
//! and whether the dataset is in an error state. `current_status` must read
//! `idle` whenever no worker is actively executing a stage; any other value
//! observed at task-pickup time is evidence that a previous run died
//! mid-stage.
//!
//! Done flags are monotonic. They are only cleared by an explicit
//! re-submission that targets the corresponding stage
//! ([`StatusStore::reset_for_stages`]), never as a side effect of errors.

mod memory;
mod postgres;

pub use memory::MemoryStatusStore;
pub use postgres::PgStatusStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::stages::{StageKind, PIPELINE_ORDER};

/// Errors that can occur during status-store operations.
#[derive(Debug, Error)]
pub enum StatusError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// No status row exists for the dataset.
    #[error("No status row for dataset {0}")]
    NotFound(i64),
}

/// What the worker is doing with a dataset right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CurrentStatus {
    /// No stage in flight.
    Idle,
    /// The given stage is executing.
    Processing(StageKind),
}

impl CurrentStatus {
    /// Stable string form, as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            CurrentStatus::Idle => "idle",
            CurrentStatus::Processing(stage) => stage.processing_status(),
        }
    }

    /// Parses the stored string form. Unrecognized values map to `Idle`
    /// rather than failing: an unknown status is indistinguishable from a
    /// schema drift and must not wedge the scheduler.
    pub fn parse(s: &str) -> Self {
        match StageKind::from_processing_status(s) {
            Some(stage) => CurrentStatus::Processing(stage),
            None => CurrentStatus::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, CurrentStatus::Idle)
    }
}

impl fmt::Display for CurrentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dataset's persisted pipeline state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetStatus {
    pub dataset_id: i64,
    pub current_status: CurrentStatus,
    pub is_upload_done: bool,
    pub is_ortho_done: bool,
    pub is_metadata_done: bool,
    pub is_cog_done: bool,
    pub is_thumbnail_done: bool,
    pub is_deadwood_done: bool,
    pub is_forest_cover_done: bool,
    pub is_odm_done: bool,
    pub has_error: bool,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DatasetStatus {
    /// A fresh idle row for a dataset with nothing done yet.
    pub fn new(dataset_id: i64) -> Self {
        Self {
            dataset_id,
            current_status: CurrentStatus::Idle,
            is_upload_done: false,
            is_ortho_done: false,
            is_metadata_done: false,
            is_cog_done: false,
            is_thumbnail_done: false,
            is_deadwood_done: false,
            is_forest_cover_done: false,
            is_odm_done: false,
            has_error: false,
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether the given stage's done flag is set.
    pub fn is_done(&self, stage: StageKind) -> bool {
        match stage {
            StageKind::OdmProcessing => self.is_odm_done,
            StageKind::Geotiff => self.is_ortho_done,
            StageKind::Metadata => self.is_metadata_done,
            StageKind::Cog => self.is_cog_done,
            StageKind::Thumbnail => self.is_thumbnail_done,
            StageKind::Deadwood => self.is_deadwood_done,
            StageKind::Treecover => self.is_forest_cover_done,
        }
    }

    /// Sets the given stage's done flag.
    pub fn set_done(&mut self, stage: StageKind, done: bool) {
        let flag = match stage {
            StageKind::OdmProcessing => &mut self.is_odm_done,
            StageKind::Geotiff => &mut self.is_ortho_done,
            StageKind::Metadata => &mut self.is_metadata_done,
            StageKind::Cog => &mut self.is_cog_done,
            StageKind::Thumbnail => &mut self.is_thumbnail_done,
            StageKind::Deadwood => &mut self.is_deadwood_done,
            StageKind::Treecover => &mut self.is_forest_cover_done,
        };
        *flag = done;
    }

    /// Stages whose done flags are set, in canonical order.
    pub fn completed_stages(&self) -> Vec<StageKind> {
        PIPELINE_ORDER
            .into_iter()
            .filter(|s| self.is_done(*s))
            .collect()
    }
}

/// A persisted log line for a dataset, used to enrich failure reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub dataset_id: i64,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Severity of a persisted log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Error => "error",
        }
    }
}

/// Read/write access to the per-dataset status rows and processing logs.
///
/// Mutations are only issued by the scheduler instance that owns the dataset
/// while processing it; the trait exists so the scheduler core can run
/// against an in-memory store in tests.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Fetches the status row for a dataset, if one exists.
    async fn get(&self, dataset_id: i64) -> Result<Option<DatasetStatus>, StatusError>;

    /// Fetches the status row, creating a fresh idle row if missing.
    async fn ensure(&self, dataset_id: i64) -> Result<DatasetStatus, StatusError>;

    /// Sets `current_status` for a dataset.
    async fn set_current(
        &self,
        dataset_id: i64,
        status: CurrentStatus,
    ) -> Result<(), StatusError>;

    /// Flips the given stage's done flag to true.
    async fn mark_done(&self, dataset_id: i64, stage: StageKind) -> Result<(), StatusError>;

    /// Records an error: sets `has_error`, stores the message and returns
    /// `current_status` to idle so the dataset is re-submittable.
    async fn set_error(&self, dataset_id: i64, message: &str) -> Result<(), StatusError>;

    /// Clears the error state for a re-submission, resetting the done flags
    /// of exactly the re-requested stages.
    async fn reset_for_stages(
        &self,
        dataset_id: i64,
        stages: &[StageKind],
    ) -> Result<(), StatusError>;

    /// Appends a processing log line for the dataset.
    async fn record_log(
        &self,
        dataset_id: i64,
        level: LogLevel,
        message: &str,
    ) -> Result<(), StatusError>;

    /// Most recent error-level log lines for the dataset, newest first.
    async fn recent_errors(
        &self,
        dataset_id: i64,
        limit: i64,
    ) -> Result<Vec<LogEntry>, StatusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_status_roundtrip() {
        assert_eq!(CurrentStatus::parse("idle"), CurrentStatus::Idle);
        for stage in PIPELINE_ORDER {
            let status = CurrentStatus::Processing(stage);
            assert_eq!(CurrentStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn test_unknown_status_maps_to_idle() {
        assert_eq!(CurrentStatus::parse("uploading"), CurrentStatus::Idle);
        assert_eq!(CurrentStatus::parse(""), CurrentStatus::Idle);
    }

    #[test]
    fn test_done_flag_accessors() {
        let mut status = DatasetStatus::new(7);
        assert!(status.completed_stages().is_empty());

        status.set_done(StageKind::Metadata, true);
        status.set_done(StageKind::Geotiff, true);
        assert!(status.is_done(StageKind::Metadata));
        assert!(!status.is_done(StageKind::Cog));
        assert_eq!(
            status.completed_stages(),
            vec![StageKind::Geotiff, StageKind::Metadata]
        );
    }
}
