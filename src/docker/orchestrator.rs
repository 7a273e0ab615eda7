//! Per-stage container job lifecycle.
//!
//! [`StageLauncher::run_stage`] owns the whole arc of one containerized
//! stage: shared
//! volume creation, input transfer, the stage container run (with GPU
//! fallback), forensics on failure, result extraction, and teardown. Each
//! step is independently fault-tolerant; teardown always runs and retries
//! with backoff before handing irremovable resources to the reaper.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::DockerError;
use crate::forensics::ForensicsCollector;
use crate::stages::StageKind;

use super::client::{ContainerSpec, DockerClient};
use super::transfer;
use super::{job_labels, volume_name, ContainerRole, INPUT_DIR, OUTPUT_DIR, VOLUME_MOUNT};

/// How many times container/volume removal is retried during teardown.
const REMOVE_ATTEMPTS: u32 = 5;

/// Base delay between removal attempts; grows linearly per attempt.
const REMOVE_BACKOFF: Duration = Duration::from_millis(500);

/// One containerized stage invocation.
#[derive(Debug, Clone)]
pub struct StageRun {
    pub stage: StageKind,
    pub dataset_id: i64,
    /// Host files to stream into the shared volume's input directory.
    pub input_files: Vec<PathBuf>,
    /// Image for the stage container.
    pub image: String,
    /// Stage-specific command line.
    pub cmd: Vec<String>,
    /// Extra environment for the stage container.
    pub env: Vec<String>,
    /// Host directory the results are extracted into. Must not exist yet;
    /// its parent must.
    pub output_dir: PathBuf,
    /// Try an attached compute device first.
    pub gpu: bool,
    /// Keep the stage container around on failure for debugging.
    pub retain_on_failure: bool,
}

/// Result of a successful containerized stage.
#[derive(Debug, Clone)]
pub struct StageRunOutput {
    pub exit_code: i64,
    /// Where the extracted results landed.
    pub output_dir: PathBuf,
}

/// Seam between the pipeline executor and the container runtime.
#[async_trait]
pub trait StageLauncher: Send + Sync {
    /// Runs one containerized stage to completion.
    async fn run_stage(&self, run: &StageRun) -> Result<StageRunOutput, DockerError>;
}

/// Container orchestrator backed by the local Docker daemon.
pub struct ContainerOrchestrator {
    client: DockerClient,
    helper_image: String,
    forensics: Arc<ForensicsCollector>,
}

impl ContainerOrchestrator {
    pub fn new(
        client: DockerClient,
        helper_image: impl Into<String>,
        forensics: Arc<ForensicsCollector>,
    ) -> Self {
        Self {
            client,
            helper_image: helper_image.into(),
            forensics,
        }
    }

    /// Streams the input files into the shared volume through a throwaway
    /// transfer container. The transfer container is removed no matter how
    /// the copy went.
    async fn fill_volume(&self, volume: &str, run: &StageRun) -> Result<(), DockerError> {
        let name = format!("{volume}-transfer");
        let spec = ContainerSpec::new(&name, &self.helper_image)
            .with_cmd(vec!["sleep".to_string(), "3600".to_string()])
            .with_bind(format!("{volume}:{VOLUME_MOUNT}"))
            .with_labels(job_labels(
                ContainerRole::Transfer,
                run.dataset_id,
                run.stage,
                false,
            ));

        self.client.ensure_image(&self.helper_image).await?;
        let id = self.client.create_container(&spec).await?;
        self.client.start_container(&id).await?;

        let copied = self.copy_inputs(&id, run).await;

        if let Err(e) = self.client.remove_container(&id, true).await {
            warn!(container = %name, error = %e, "Transfer container removal failed");
        }
        copied
    }

    async fn copy_inputs(&self, container: &str, run: &StageRun) -> Result<(), DockerError> {
        transfer::make_dirs(container, &[INPUT_DIR, OUTPUT_DIR]).await?;
        for file in &run.input_files {
            debug!(dataset_id = run.dataset_id, stage = %run.stage, file = %file.display(),
                "Streaming input into shared volume");
            transfer::copy_into_container(container, file, INPUT_DIR).await?;
        }
        Ok(())
    }

    /// Creates and starts the stage container, falling back to a
    /// non-accelerated run when the device-specific start fails.
    async fn start_stage_container(
        &self,
        volume: &str,
        run: &StageRun,
    ) -> Result<String, DockerError> {
        self.client.ensure_image(&run.image).await?;

        let name = format!("{volume}-stage");
        let spec = ContainerSpec::new(&name, &run.image)
            .with_cmd(run.cmd.clone())
            .with_env(run.env.clone())
            .with_bind(format!("{volume}:{VOLUME_MOUNT}"))
            .with_labels(job_labels(
                ContainerRole::Stage,
                run.dataset_id,
                run.stage,
                run.retain_on_failure,
            ));

        if run.gpu {
            match self.try_start(&spec.clone().with_gpu(true)).await {
                Ok(id) => return Ok(id),
                Err(e) => {
                    warn!(dataset_id = run.dataset_id, stage = %run.stage, error = %e,
                        "GPU start failed, falling back to CPU");
                }
            }
        }

        self.try_start(&spec).await
    }

    async fn try_start(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        let id = self.client.create_container(spec).await?;
        if let Err(e) = self.client.start_container(&id).await {
            // Leave no half-created container behind before falling back.
            if let Err(rm) = self.client.remove_container(&id, true).await {
                warn!(container = %spec.name, error = %rm, "Cleanup of unstartable container failed");
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Extracts the volume's output directory to the host through a
    /// throwaway extract container.
    async fn extract_results(&self, volume: &str, run: &StageRun) -> Result<(), DockerError> {
        let name = format!("{volume}-extract");
        let spec = ContainerSpec::new(&name, &self.helper_image)
            .with_cmd(vec!["sleep".to_string(), "3600".to_string()])
            .with_bind(format!("{volume}:{VOLUME_MOUNT}"))
            .with_labels(job_labels(
                ContainerRole::Extract,
                run.dataset_id,
                run.stage,
                false,
            ));

        let id = self.client.create_container(&spec).await?;
        self.client.start_container(&id).await?;

        if let Some(parent) = run.output_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let copied = transfer::copy_from_container(&id, OUTPUT_DIR, &run.output_dir).await;

        if let Err(e) = self.client.remove_container(&id, true).await {
            warn!(container = %name, error = %e, "Extract container removal failed");
        }
        copied
    }

    /// Runs the job inside an already-created volume. Returns the result
    /// together with the id of a retained container, if the failure policy
    /// kept one alive.
    async fn execute_job(
        &self,
        volume: &str,
        run: &StageRun,
    ) -> (Result<StageRunOutput, DockerError>, Option<String>) {
        if let Err(e) = self.fill_volume(volume, run).await {
            return (Err(e), None);
        }

        let stage_id = match self.start_stage_container(volume, run).await {
            Ok(id) => id,
            Err(e) => return (Err(e), None),
        };
        let exit_code = match self.client.wait_container(&stage_id).await {
            Ok(code) => code,
            Err(e) => return (Err(e), None),
        };

        if exit_code != 0 {
            let record = self
                .forensics
                .collect(&self.client, &stage_id, run.dataset_id, run.stage)
                .await;
            let detail = record
                .map(|r| r.summary())
                .unwrap_or_else(|| "no forensics available".to_string());

            let kept = if run.retain_on_failure {
                info!(dataset_id = run.dataset_id, stage = %run.stage, container = %stage_id,
                    "Retaining failed stage container for debugging");
                Some(stage_id)
            } else {
                if let Err(e) = self.client.remove_container(&stage_id, true).await {
                    warn!(container = %stage_id, error = %e, "Failed stage container removal failed");
                }
                None
            };

            return (
                Err(DockerError::NonZeroExit {
                    code: exit_code,
                    detail,
                }),
                kept,
            );
        }

        if let Err(e) = self.client.remove_container(&stage_id, true).await {
            warn!(container = %stage_id, error = %e, "Stage container removal failed");
        }

        if let Err(e) = self.extract_results(volume, run).await {
            return (Err(e), None);
        }

        (
            Ok(StageRunOutput {
                exit_code,
                output_dir: run.output_dir.clone(),
            }),
            None,
        )
    }

    /// Removes every container still referencing the volume (except one the
    /// caller chose to keep), then the volume itself, retrying with backoff.
    /// Never escalates: an irremovable volume is logged and left for the
    /// reaper.
    async fn cleanup_job(&self, volume: &str, keep_container: Option<&str>) {
        match self.client.containers_referencing_volume(volume).await {
            Ok(containers) => {
                for c in containers {
                    if keep_container == Some(c.id.as_str()) {
                        continue;
                    }
                    if let Err(e) = self.client.remove_container(&c.id, true).await {
                        warn!(volume, container = %c.id, error = %e,
                            "Referencing container removal failed");
                    }
                }
            }
            Err(e) => {
                warn!(volume, error = %e, "Listing containers for volume cleanup failed");
            }
        }

        if keep_container.is_some() {
            debug!(volume, "Volume kept alive by retained container, deferring to reaper");
            return;
        }

        if let Err(e) = self.remove_volume_with_retry(volume).await {
            warn!(volume, error = %e, "Leaving shared volume for the reaper");
        }
    }

    async fn remove_volume_with_retry(&self, volume: &str) -> Result<(), DockerError> {
        let mut last_error = String::new();
        for attempt in 1..=REMOVE_ATTEMPTS {
            match self.client.remove_volume(volume, true).await {
                Ok(()) => {
                    debug!(volume, attempt, "Shared volume removed");
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    tokio::time::sleep(REMOVE_BACKOFF * attempt).await;
                }
            }
        }

        Err(DockerError::VolumeRemoveFailed {
            name: volume.to_string(),
            attempts: REMOVE_ATTEMPTS,
            message: last_error,
        })
    }
}

#[async_trait]
impl StageLauncher for ContainerOrchestrator {
    async fn run_stage(&self, run: &StageRun) -> Result<StageRunOutput, DockerError> {
        let volume = volume_name(run.dataset_id, run.stage);

        let mut labels = std::collections::HashMap::new();
        labels.insert(super::LABEL_DATASET.to_string(), run.dataset_id.to_string());
        labels.insert(super::LABEL_STAGE.to_string(), run.stage.as_str().to_string());
        self.client.create_volume(&volume, labels).await?;

        info!(dataset_id = run.dataset_id, stage = %run.stage, volume = %volume,
            image = %run.image, "Running containerized stage");

        let (result, kept) = self.execute_job(&volume, run).await;

        // A retained failure container keeps the volume referenced; the
        // reaper picks both up once the retention window expires.
        self.cleanup_job(&volume, kept.as_deref()).await;

        result
    }
}
