//! End-to-end scheduling cycle tests against in-memory stores and mocked
//! stage execution.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use canopy_processor::config::WorkerConfig;
use canopy_processor::docker::{StageLauncher, StageRun, StageRunOutput};
use canopy_processor::error::{DockerError, StageError};
use canopy_processor::pipeline::{PipelineExecutor, StageBackend};
use canopy_processor::queue::{MemoryTaskQueue, TaskQueue};
use canopy_processor::report::{FailureReport, FailureReporter, ReportError};
use canopy_processor::scheduler::{CycleOutcome, Scheduler, SkipReason};
use canopy_processor::stages::StageKind;
use canopy_processor::status::{
    CurrentStatus, DatasetStatus, MemoryStatusStore, StatusStore,
};

/// Launcher that records containerized stage runs instead of talking to a
/// daemon.
#[derive(Default)]
struct MockLauncher {
    runs: Mutex<Vec<(i64, StageKind)>>,
    fail: Mutex<HashSet<StageKind>>,
}

impl MockLauncher {
    fn fail_stage(&self, stage: StageKind) {
        self.fail.lock().unwrap().insert(stage);
    }

    fn runs(&self) -> Vec<(i64, StageKind)> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl StageLauncher for MockLauncher {
    async fn run_stage(&self, run: &StageRun) -> Result<StageRunOutput, DockerError> {
        self.runs
            .lock()
            .unwrap()
            .push((run.dataset_id, run.stage));
        if self.fail.lock().unwrap().contains(&run.stage) {
            return Err(DockerError::NonZeroExit {
                code: 1,
                detail: "mock stage failure".to_string(),
            });
        }
        Ok(StageRunOutput {
            exit_code: 0,
            output_dir: run.output_dir.clone(),
        })
    }
}

/// Backend that records local stage runs.
#[derive(Default)]
struct MockBackend {
    runs: Mutex<Vec<(i64, StageKind)>>,
    fail: Mutex<HashSet<StageKind>>,
}

impl MockBackend {
    fn fail_stage(&self, stage: StageKind) {
        self.fail.lock().unwrap().insert(stage);
    }

    fn runs(&self) -> Vec<(i64, StageKind)> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl StageBackend for MockBackend {
    async fn run(
        &self,
        stage: StageKind,
        dataset_id: i64,
        _input_dir: &Path,
        _output_dir: &Path,
        _work_dir: &Path,
    ) -> Result<(), StageError> {
        self.runs.lock().unwrap().push((dataset_id, stage));
        if self.fail.lock().unwrap().contains(&stage) {
            return Err(StageError::new(stage, dataset_id, "mock toolchain failure"));
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingReporter {
    reports: Mutex<Vec<FailureReport>>,
}

impl RecordingReporter {
    fn reports(&self) -> Vec<FailureReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl FailureReporter for RecordingReporter {
    async fn report(&self, failure: &FailureReport) -> Result<(), ReportError> {
        self.reports.lock().unwrap().push(failure.clone());
        Ok(())
    }
}

struct Harness {
    queue: Arc<MemoryTaskQueue>,
    status: Arc<MemoryStatusStore>,
    launcher: Arc<MockLauncher>,
    backend: Arc<MockBackend>,
    reporter: Arc<RecordingReporter>,
    scheduler: Scheduler,
    _tmp: tempfile::TempDir,
}

fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = WorkerConfig::default();
    config.archive_dir = tmp.path().join("archive");
    config.scratch_dir = tmp.path().join("scratch");
    config.debug_bundle_dir = tmp.path().join("debug");
    let config = Arc::new(config);

    let queue = Arc::new(MemoryTaskQueue::new());
    let status = Arc::new(MemoryStatusStore::new());
    let launcher = Arc::new(MockLauncher::default());
    let backend = Arc::new(MockBackend::default());
    let reporter = Arc::new(RecordingReporter::default());

    let executor = Arc::new(PipelineExecutor::new(
        config,
        status.clone() as Arc<dyn StatusStore>,
        launcher.clone() as Arc<dyn StageLauncher>,
        backend.clone() as Arc<dyn StageBackend>,
        reporter.clone() as Arc<dyn FailureReporter>,
    ));
    let scheduler = Scheduler::new(
        queue.clone() as Arc<dyn TaskQueue>,
        status.clone() as Arc<dyn StatusStore>,
        executor,
        reporter.clone() as Arc<dyn FailureReporter>,
    );

    Harness {
        queue,
        status,
        launcher,
        backend,
        reporter,
        scheduler,
        _tmp: tmp,
    }
}

fn uploaded_row(dataset_id: i64) -> DatasetStatus {
    let mut row = DatasetStatus::new(dataset_id);
    row.is_upload_done = true;
    row
}

async fn submit(
    h: &Harness,
    dataset_id: i64,
    stages: &[StageKind],
    priority: i16,
) {
    h.queue
        .submit(dataset_id, Uuid::nil(), stages.to_vec(), priority)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_local_stages_run_in_pipeline_order() {
    let h = harness();
    h.status.insert(uploaded_row(42));
    // Requested out of order on purpose.
    submit(
        &h,
        42,
        &[StageKind::Thumbnail, StageKind::Metadata, StageKind::Cog],
        0,
    )
    .await;

    let outcome = h.scheduler.run_one_cycle().await.unwrap();
    match outcome {
        CycleOutcome::Completed {
            dataset_id,
            stages_run,
        } => {
            assert_eq!(dataset_id, 42);
            assert_eq!(
                stages_run,
                vec![StageKind::Metadata, StageKind::Cog, StageKind::Thumbnail]
            );
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    assert_eq!(
        h.backend.runs(),
        vec![
            (42, StageKind::Metadata),
            (42, StageKind::Cog),
            (42, StageKind::Thumbnail)
        ]
    );

    let status = h.status.get(42).await.unwrap().unwrap();
    assert!(status.is_metadata_done);
    assert!(status.is_cog_done);
    assert!(status.is_thumbnail_done);
    assert!(!status.has_error);
    assert!(status.current_status.is_idle());
    assert_eq!(h.queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_higher_priority_runs_first() {
    let h = harness();
    for (dataset, priority) in [(1i64, 2i16), (2, 5), (3, 1)] {
        h.status.insert(uploaded_row(dataset));
        submit(&h, dataset, &[StageKind::Metadata], priority).await;
    }

    let cycles = h.scheduler.drain().await.unwrap();
    assert_eq!(cycles, 3);

    let order: Vec<i64> = h.backend.runs().iter().map(|(d, _)| *d).collect();
    assert_eq!(order, vec![2, 1, 3]);
}

#[tokio::test]
async fn test_stale_processing_state_recovers_without_execution() {
    let h = harness();
    let mut row = uploaded_row(7);
    row.current_status = CurrentStatus::Processing(StageKind::Metadata);
    h.status.insert(row);
    submit(&h, 7, &[StageKind::Metadata, StageKind::Cog], 0).await;

    let outcome = h.scheduler.run_one_cycle().await.unwrap();
    match outcome {
        CycleOutcome::CrashRecovered { dataset_id, stage } => {
            assert_eq!(dataset_id, 7);
            assert_eq!(stage, StageKind::Metadata);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    // Nothing ran; the dataset is errored, idle and resubmittable.
    assert!(h.backend.runs().is_empty());
    assert!(h.launcher.runs().is_empty());
    let status = h.status.get(7).await.unwrap().unwrap();
    assert!(status.has_error);
    assert!(status.current_status.is_idle());
    assert_eq!(h.queue.len().await.unwrap(), 0);
    assert_eq!(h.reporter.reports().len(), 1);
}

#[tokio::test]
async fn test_pending_upload_keeps_queue_row() {
    let h = harness();
    h.status.insert(DatasetStatus::new(9));
    submit(&h, 9, &[StageKind::Metadata], 0).await;

    let outcome = h.scheduler.run_one_cycle().await.unwrap();
    match outcome {
        CycleOutcome::Skipped { dataset_id, reason } => {
            assert_eq!(dataset_id, 9);
            assert_eq!(reason, SkipReason::UploadPending);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(h.queue.len().await.unwrap(), 1);
    assert!(h.backend.runs().is_empty());
}

#[tokio::test]
async fn test_prior_error_drops_queue_row() {
    let h = harness();
    let mut row = uploaded_row(11);
    row.has_error = true;
    row.error_message = Some("previous failure".to_string());
    h.status.insert(row);
    submit(&h, 11, &[StageKind::Cog], 0).await;

    let outcome = h.scheduler.run_one_cycle().await.unwrap();
    match outcome {
        CycleOutcome::Skipped { reason, .. } => {
            assert_eq!(reason, SkipReason::PriorError);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(h.queue.len().await.unwrap(), 0);
    assert!(h.backend.runs().is_empty());
}

#[tokio::test]
async fn test_stage_failure_stops_pipeline_and_reports() {
    let h = harness();
    h.status.insert(uploaded_row(42));
    h.backend.fail_stage(StageKind::Cog);
    submit(
        &h,
        42,
        &[StageKind::Metadata, StageKind::Cog, StageKind::Thumbnail],
        0,
    )
    .await;

    let outcome = h.scheduler.run_one_cycle().await.unwrap();
    match outcome {
        CycleOutcome::Failed { dataset_id, stage } => {
            assert_eq!(dataset_id, 42);
            assert_eq!(stage, StageKind::Cog);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    // Earlier progress survives, later stages never ran.
    let status = h.status.get(42).await.unwrap().unwrap();
    assert!(status.is_metadata_done);
    assert!(!status.is_cog_done);
    assert!(!status.is_thumbnail_done);
    assert!(status.has_error);
    assert!(status.current_status.is_idle());
    assert_eq!(h.queue.len().await.unwrap(), 0);

    let reports = h.reporter.reports();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].title().contains("[dataset-42]"));
}

#[tokio::test]
async fn test_already_done_stages_are_skipped() {
    let h = harness();
    let mut row = uploaded_row(13);
    row.set_done(StageKind::Metadata, true);
    h.status.insert(row);
    submit(&h, 13, &[StageKind::Metadata, StageKind::Cog], 0).await;

    let outcome = h.scheduler.run_one_cycle().await.unwrap();
    match outcome {
        CycleOutcome::Completed { stages_run, .. } => {
            assert_eq!(stages_run, vec![StageKind::Cog]);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(h.backend.runs(), vec![(13, StageKind::Cog)]);
}

#[tokio::test]
async fn test_containerized_stage_goes_through_launcher() {
    let h = harness();
    h.status.insert(uploaded_row(5));

    // Containerized stages read their inputs from the archive directory.
    let raw = h._tmp.path().join("archive").join("5");
    std::fs::create_dir_all(&raw).unwrap();
    std::fs::write(raw.join("ortho.tif"), b"not really a tiff").unwrap();

    submit(&h, 5, &[StageKind::Deadwood], 0).await;

    let outcome = h.scheduler.run_one_cycle().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Completed { .. }));
    assert_eq!(h.launcher.runs(), vec![(5, StageKind::Deadwood)]);
    assert!(h.backend.runs().is_empty());

    let status = h.status.get(5).await.unwrap().unwrap();
    assert!(status.is_deadwood_done);
}

#[tokio::test]
async fn test_containerized_failure_records_error() {
    let h = harness();
    h.status.insert(uploaded_row(6));
    h.launcher.fail_stage(StageKind::Treecover);

    let raw = h._tmp.path().join("archive").join("6");
    std::fs::create_dir_all(&raw).unwrap();
    std::fs::write(raw.join("ortho.tif"), b"input").unwrap();

    submit(&h, 6, &[StageKind::Treecover], 0).await;

    let outcome = h.scheduler.run_one_cycle().await.unwrap();
    assert!(matches!(
        outcome,
        CycleOutcome::Failed {
            stage: StageKind::Treecover,
            ..
        }
    ));

    let status = h.status.get(6).await.unwrap().unwrap();
    assert!(status.has_error);
    assert!(status
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("non-zero code 1"));
}

#[tokio::test]
async fn test_empty_queue_is_idle() {
    let h = harness();
    let outcome = h.scheduler.run_one_cycle().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Idle));
}

#[tokio::test]
async fn test_resubmission_after_error_reruns_reset_stages() {
    let h = harness();
    h.status.insert(uploaded_row(21));
    h.backend.fail_stage(StageKind::Cog);
    h.scheduler
        .submit(21, Uuid::nil(), vec![StageKind::Metadata, StageKind::Cog], 0)
        .await
        .unwrap();

    let outcome = h.scheduler.run_one_cycle().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Failed { .. }));
    let status = h.status.get(21).await.unwrap().unwrap();
    assert!(status.has_error);
    assert!(status.is_metadata_done, "stage before the failure must stick");

    // Resubmitting through the scheduler clears the error state; no manual
    // reset step exists.
    h.backend.fail.lock().unwrap().clear();
    h.scheduler
        .submit(21, Uuid::nil(), vec![StageKind::Cog], 0)
        .await
        .unwrap();

    let outcome = h.scheduler.run_one_cycle().await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Completed { .. }));
    let status = h.status.get(21).await.unwrap().unwrap();
    assert!(status.is_cog_done);
    assert!(status.is_metadata_done, "untouched flag survives re-submission");
    assert!(!status.has_error);
    assert_eq!(h.queue.len().await.unwrap(), 0);
}
