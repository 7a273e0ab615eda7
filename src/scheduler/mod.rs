//! Poll-driven scheduling loop.
//!
//! One worker, one task at a time: each cycle takes the head of the
//! priority-ordered queue, gates it on readiness, recovers from a previous
//! worker crash if the status row says the dataset is still mid-stage, and
//! otherwise hands the task to the pipeline executor. Terminal outcomes
//! always delete the queue row; only a skipped not-yet-ready task keeps its
//! place in line.

mod crash;

pub use crash::crashed_stage;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use uuid::Uuid;

use crate::pipeline::{PipelineError, PipelineExecutor};
use crate::queue::{QueueError, QueueTask, TaskQueue};
use crate::report::{FailureReport, FailureReporter};
use crate::stages::StageKind;
use crate::status::{CurrentStatus, LogLevel, StatusError, StatusStore};

#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Status(#[from] StatusError),
}

/// Why a picked-up task was not executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The upload has not finished; the task keeps its queue row.
    UploadPending,
    /// The dataset carries an unresolved error; the row is dropped.
    PriorError,
}

/// What one scheduling cycle did.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    /// Queue was empty.
    Idle,
    /// Head task was not ready to run.
    Skipped {
        dataset_id: i64,
        reason: SkipReason,
    },
    /// A previous worker died mid-stage; the dataset was marked errored
    /// without running anything.
    CrashRecovered {
        dataset_id: i64,
        stage: StageKind,
    },
    /// All pending stages ran to completion.
    Completed {
        dataset_id: i64,
        stages_run: Vec<StageKind>,
    },
    /// A stage failed; error state is persisted and the row is gone.
    Failed {
        dataset_id: i64,
        stage: StageKind,
    },
}

pub struct Scheduler {
    queue: Arc<dyn TaskQueue>,
    status: Arc<dyn StatusStore>,
    executor: Arc<PipelineExecutor>,
    reporter: Arc<dyn FailureReporter>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        status: Arc<dyn StatusStore>,
        executor: Arc<PipelineExecutor>,
        reporter: Arc<dyn FailureReporter>,
    ) -> Self {
        Self {
            queue,
            status,
            executor,
            reporter,
        }
    }

    /// Submits (or re-submits) a dataset for processing.
    ///
    /// A dataset sitting in error state is made runnable again: the
    /// re-requested stages' done flags and the error are cleared before the
    /// queue row is written. Without the reset the readiness gate would drop
    /// the new row on sight.
    pub async fn submit(
        &self,
        dataset_id: i64,
        user_id: Uuid,
        stages: Vec<StageKind>,
        priority: i16,
    ) -> Result<QueueTask, CycleError> {
        let status = self.status.ensure(dataset_id).await?;
        if status.has_error {
            info!(dataset_id, "Re-submission clears prior error state");
            self.status.reset_for_stages(dataset_id, &stages).await?;
        }
        Ok(self
            .queue
            .submit(dataset_id, user_id, stages, priority)
            .await?)
    }

    /// Runs one scheduling cycle: pick, gate, recover or execute.
    pub async fn run_one_cycle(&self) -> Result<CycleOutcome, CycleError> {
        let Some(task) = self.queue.next_task().await? else {
            return Ok(CycleOutcome::Idle);
        };
        let dataset_id = task.dataset_id;
        debug!(
            dataset_id,
            task_id = task.id,
            priority = task.priority,
            "Picked up queue head"
        );

        let status = self.status.ensure(dataset_id).await?;

        if status.has_error {
            info!(dataset_id, "Dataset carries an unresolved error, dropping queue row");
            self.queue.delete(task.id).await?;
            return Ok(CycleOutcome::Skipped {
                dataset_id,
                reason: SkipReason::PriorError,
            });
        }

        if !status.is_upload_done {
            debug!(dataset_id, "Upload not finished, leaving task queued");
            return Ok(CycleOutcome::Skipped {
                dataset_id,
                reason: SkipReason::UploadPending,
            });
        }

        if let Some(stage) = crashed_stage(&status, &task.task_types) {
            self.recover_crash(dataset_id, stage, &status).await?;
            self.queue.delete(task.id).await?;
            return Ok(CycleOutcome::CrashRecovered { dataset_id, stage });
        }

        let outcome = match self.executor.run(&task).await {
            Ok(report) => {
                info!(
                    dataset_id,
                    stages = report.stages_run.len(),
                    "Task completed"
                );
                CycleOutcome::Completed {
                    dataset_id,
                    stages_run: report.stages_run,
                }
            }
            Err(PipelineError::Stage(e)) => {
                warn!(dataset_id, stage = %e.stage, "Task failed: {}", e.cause);
                CycleOutcome::Failed {
                    dataset_id,
                    stage: e.stage,
                }
            }
            Err(PipelineError::Status(e)) => return Err(e.into()),
        };

        // Terminal either way: no retries.
        self.queue.delete(task.id).await?;
        Ok(outcome)
    }

    /// Marks a dataset that a dead worker left mid-stage as errored. Nothing
    /// is executed; the user decides whether to resubmit.
    async fn recover_crash(
        &self,
        dataset_id: i64,
        stage: StageKind,
        status: &crate::status::DatasetStatus,
    ) -> Result<(), StatusError> {
        let completed: Vec<&str> = status
            .completed_stages()
            .into_iter()
            .map(|s| s.as_str())
            .collect();
        let message = if completed.is_empty() {
            format!("worker crashed while '{stage}' was running, no stages completed")
        } else {
            format!(
                "worker crashed while '{stage}' was running, completed so far: {}",
                completed.join(", ")
            )
        };
        warn!(dataset_id, stage = %stage, "Stale processing state found, recovering");

        self.status.set_error(dataset_id, &message).await?;
        self.status
            .record_log(dataset_id, LogLevel::Error, &message)
            .await?;
        self.status
            .set_current(dataset_id, CurrentStatus::Idle)
            .await?;

        let recent_errors = self
            .status
            .recent_errors(dataset_id, 10)
            .await
            .unwrap_or_default();
        let report = FailureReport {
            dataset_id,
            stage,
            message,
            recent_errors,
        };
        if let Err(e) = self.reporter.report(&report).await {
            warn!(dataset_id, error = %e, "Crash report could not be delivered");
        }
        Ok(())
    }

    /// Drains the queue: cycles until the queue is empty, then returns.
    pub async fn drain(&self) -> Result<usize, CycleError> {
        let mut cycles = 0;
        loop {
            match self.run_one_cycle().await? {
                CycleOutcome::Idle => return Ok(cycles),
                CycleOutcome::Skipped {
                    reason: SkipReason::UploadPending,
                    ..
                } => {
                    // The head task keeps its row; cycling again would spin
                    // on it forever.
                    return Ok(cycles);
                }
                _ => cycles += 1,
            }
        }
    }

    /// Polls forever, sleeping between cycles whenever there is nothing
    /// runnable. Cycle errors are logged, not fatal.
    pub async fn watch(&self, poll_interval: Duration) {
        info!(interval_secs = poll_interval.as_secs(), "Watching queue");
        loop {
            match self.run_one_cycle().await {
                Ok(CycleOutcome::Idle)
                | Ok(CycleOutcome::Skipped {
                    reason: SkipReason::UploadPending,
                    ..
                }) => {
                    tokio::time::sleep(poll_interval).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Scheduling cycle failed");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }
}
