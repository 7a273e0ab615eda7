//! Stage pipeline execution.
//!
//! The executor runs a task's requested stages in the fixed pipeline order,
//! skipping stages whose done flag is already set. Every stage transition is
//! persisted before the stage runs, so a crash mid-stage is visible in
//! `current_status` at the next pickup. There are no retries: the first
//! failure records the error, reports it, and drops the task.

mod backend;

pub use backend::{StageBackend, ToolchainBackend};

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::docker::{StageLauncher, StageRun};
use crate::error::StageError;
use crate::queue::QueueTask;
use crate::report::{FailureReport, FailureReporter};
use crate::stages::{StageKind, PIPELINE_ORDER};
use crate::status::{CurrentStatus, DatasetStatus, LogLevel, StatusError, StatusStore};

#[derive(Error, Debug)]
pub enum PipelineError {
    /// The status store failed; the task cannot even record its outcome.
    #[error(transparent)]
    Status(#[from] StatusError),

    /// A stage failed. The error state has already been persisted.
    #[error(transparent)]
    Stage(#[from] StageError),
}

/// What one completed task execution did.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub dataset_id: i64,
    pub stages_run: Vec<StageKind>,
}

/// Runs tasks through the stage pipeline.
pub struct PipelineExecutor {
    config: Arc<WorkerConfig>,
    status: Arc<dyn StatusStore>,
    launcher: Arc<dyn StageLauncher>,
    backend: Arc<dyn StageBackend>,
    reporter: Arc<dyn FailureReporter>,
}

impl PipelineExecutor {
    pub fn new(
        config: Arc<WorkerConfig>,
        status: Arc<dyn StatusStore>,
        launcher: Arc<dyn StageLauncher>,
        backend: Arc<dyn StageBackend>,
        reporter: Arc<dyn FailureReporter>,
    ) -> Self {
        Self {
            config,
            status,
            launcher,
            backend,
            reporter,
        }
    }

    /// Executes a task's remaining stages in pipeline order.
    ///
    /// On stage failure the status row already carries `has_error` and the
    /// message, the failure has been reported, and `current_status` is back
    /// to idle. The caller only has to delete the queue row.
    pub async fn run(&self, task: &QueueTask) -> Result<ExecutionReport, PipelineError> {
        let dataset_id = task.dataset_id;
        let status = self.status.ensure(dataset_id).await?;
        let pending = pending_stages(&task.task_types, &status);

        if pending.is_empty() {
            debug!(dataset_id, "All requested stages already done");
            return Ok(ExecutionReport {
                dataset_id,
                stages_run: Vec::new(),
            });
        }

        self.wipe_scratch(dataset_id).await;

        let mut stages_run = Vec::new();
        for stage in pending {
            self.status
                .set_current(dataset_id, CurrentStatus::Processing(stage))
                .await?;
            self.status
                .record_log(dataset_id, LogLevel::Info, &format!("{stage} started"))
                .await?;
            info!(dataset_id, stage = %stage, "Stage started");

            if let Err(cause) = self.run_stage(dataset_id, stage).await {
                let error = StageError::new(stage, dataset_id, cause);
                self.fail(&error).await?;
                self.wipe_scratch(dataset_id).await;
                return Err(error.into());
            }

            self.status.mark_done(dataset_id, stage).await?;
            self.status
                .record_log(dataset_id, LogLevel::Info, &format!("{stage} complete"))
                .await?;
            info!(dataset_id, stage = %stage, "Stage complete");
            stages_run.push(stage);
        }

        self.status
            .set_current(dataset_id, CurrentStatus::Idle)
            .await?;
        self.wipe_scratch(dataset_id).await;

        Ok(ExecutionReport {
            dataset_id,
            stages_run,
        })
    }

    async fn run_stage(&self, dataset_id: i64, stage: StageKind) -> Result<(), String> {
        let input_dir = self.input_dir(dataset_id, stage).await;
        let output_dir = self.derived_dir(dataset_id, stage);

        if stage.is_containerized() {
            let input_files = collect_files(&input_dir)
                .await
                .map_err(|e| format!("listing inputs in {}: {e}", input_dir.display()))?;
            if input_files.is_empty() {
                return Err(format!("no input files in {}", input_dir.display()));
            }

            let run = StageRun {
                stage,
                dataset_id,
                input_files,
                image: self.stage_image(stage).to_string(),
                cmd: Vec::new(),
                env: vec![
                    format!("DATASET_ID={dataset_id}"),
                    format!("INPUT_DIR={}", crate::docker::INPUT_DIR),
                    format!("OUTPUT_DIR={}", crate::docker::OUTPUT_DIR),
                ],
                output_dir,
                gpu: self.config.prefer_gpu,
                retain_on_failure: self.config.should_retain(dataset_id),
            };
            self.launcher
                .run_stage(&run)
                .await
                .map(|_| ())
                .map_err(|e| e.to_string())
        } else {
            let work_dir = self.scratch_dir(dataset_id).join(stage.as_str());
            self.backend
                .run(stage, dataset_id, &input_dir, &output_dir, &work_dir)
                .await
                .map_err(|e| e.cause)
        }
    }

    /// Records the failure, reports it, and returns the dataset to idle.
    async fn fail(&self, error: &StageError) -> Result<(), StatusError> {
        let dataset_id = error.dataset_id;
        self.status.set_error(dataset_id, &error.cause).await?;
        self.status
            .record_log(dataset_id, LogLevel::Error, &error.to_string())
            .await?;

        let recent_errors = self
            .status
            .recent_errors(dataset_id, 10)
            .await
            .unwrap_or_default();
        let report = FailureReport {
            dataset_id,
            stage: error.stage,
            message: error.cause.clone(),
            recent_errors,
        };
        if let Err(e) = self.reporter.report(&report).await {
            warn!(dataset_id, error = %e, "Failure report could not be delivered");
        }
        Ok(())
    }

    fn stage_image(&self, stage: StageKind) -> &str {
        match stage {
            StageKind::OdmProcessing => &self.config.odm_image,
            StageKind::Deadwood => &self.config.deadwood_image,
            StageKind::Treecover => &self.config.treecover_image,
            _ => &self.config.helper_image,
        }
    }

    fn raw_dir(&self, dataset_id: i64) -> PathBuf {
        self.config.archive_dir.join(dataset_id.to_string())
    }

    fn derived_dir(&self, dataset_id: i64, stage: StageKind) -> PathBuf {
        self.raw_dir(dataset_id)
            .join("derived")
            .join(stage.as_str())
    }

    fn scratch_dir(&self, dataset_id: i64) -> PathBuf {
        self.config.scratch_dir.join(dataset_id.to_string())
    }

    /// Input directory for a stage: the derived output of the nearest
    /// earlier stage whose results exist on disk, falling back to the raw
    /// upload directory.
    async fn input_dir(&self, dataset_id: i64, stage: StageKind) -> PathBuf {
        let index = stage.pipeline_index();
        for earlier in PIPELINE_ORDER[..index].iter().rev() {
            let dir = self.derived_dir(dataset_id, *earlier);
            if tokio::fs::metadata(&dir).await.is_ok() {
                return dir;
            }
        }
        self.raw_dir(dataset_id)
    }

    async fn wipe_scratch(&self, dataset_id: i64) {
        let dir = self.scratch_dir(dataset_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(dataset_id, dir = %dir.display(), "Scratch wiped"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dataset_id, dir = %dir.display(), error = %e, "Scratch wipe failed"),
        }
    }
}

/// The requested stages that still need to run, in pipeline order.
pub fn pending_stages(requested: &[StageKind], status: &DatasetStatus) -> Vec<StageKind> {
    PIPELINE_ORDER
        .into_iter()
        .filter(|s| requested.contains(s) && !status.is_done(*s))
        .collect()
}

async fn collect_files(dir: &std::path::Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_stages_follow_pipeline_order() {
        let status = DatasetStatus::new(1);
        let requested = vec![StageKind::Thumbnail, StageKind::Metadata, StageKind::Cog];
        assert_eq!(
            pending_stages(&requested, &status),
            vec![StageKind::Metadata, StageKind::Cog, StageKind::Thumbnail]
        );
    }

    #[test]
    fn test_pending_stages_skip_done_flags() {
        let mut status = DatasetStatus::new(1);
        status.set_done(StageKind::Metadata, true);
        let requested = vec![StageKind::Metadata, StageKind::Cog];
        assert_eq!(pending_stages(&requested, &status), vec![StageKind::Cog]);
    }

    #[test]
    fn test_pending_stages_empty_when_all_done() {
        let mut status = DatasetStatus::new(1);
        status.set_done(StageKind::Cog, true);
        assert!(pending_stages(&[StageKind::Cog], &status).is_empty());
    }
}
