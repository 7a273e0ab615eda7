//! Container runtime integration.
//!
//! Containerized stages never touch the host filesystem: each job gets a
//! named shared volume, inputs are streamed in through a throwaway transfer
//! container, the stage container runs against the volume, and results are
//! streamed back out through a throwaway extract container. Everything the
//! scheduler creates carries `org.canopy.*` labels so the reaper can find
//! leftovers after a crash.

mod client;
mod orchestrator;
mod transfer;

pub use client::{
    parse_docker_timestamp, ContainerFinalState, ContainerSpec, DockerClient, FoundContainer,
    FoundVolume,
};
pub use orchestrator::{ContainerOrchestrator, StageLauncher, StageRun, StageRunOutput};

use std::collections::HashMap;

use crate::stages::StageKind;

/// Label carrying the container's role in a job.
pub const LABEL_ROLE: &str = "org.canopy.role";
/// Label carrying the owning dataset id.
pub const LABEL_DATASET: &str = "org.canopy.dataset";
/// Label carrying the stage name.
pub const LABEL_STAGE: &str = "org.canopy.stage";
/// Label marking a failed container kept for debugging.
pub const LABEL_RETAIN: &str = "org.canopy.retain";

/// Prefix of every volume the scheduler creates.
pub const VOLUME_PREFIX: &str = "canopy-";

/// Mount point of the shared volume inside every job container.
pub const VOLUME_MOUNT: &str = "/data";
/// Input directory inside the shared volume.
pub const INPUT_DIR: &str = "/data/input";
/// Output directory inside the shared volume.
pub const OUTPUT_DIR: &str = "/data/output";

/// Role of a container within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRole {
    /// Copies inputs into the shared volume.
    Transfer,
    /// Copies results back out of the shared volume.
    Extract,
    /// Runs the actual stage workload.
    Stage,
}

impl ContainerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerRole::Transfer => "transfer",
            ContainerRole::Extract => "extract",
            ContainerRole::Stage => "stage",
        }
    }

}

/// Builds the label set for a job resource.
pub fn job_labels(
    role: ContainerRole,
    dataset_id: i64,
    stage: StageKind,
    retain: bool,
) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(LABEL_ROLE.to_string(), role.as_str().to_string());
    labels.insert(LABEL_DATASET.to_string(), dataset_id.to_string());
    labels.insert(LABEL_STAGE.to_string(), stage.as_str().to_string());
    if retain {
        labels.insert(LABEL_RETAIN.to_string(), "true".to_string());
    }
    labels
}

/// Generates a unique shared-volume name for a job.
pub fn volume_name(dataset_id: i64, stage: StageKind) -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{VOLUME_PREFIX}{dataset_id}-{stage}-{}", &nonce[..8])
}

/// Whether the labels mark the resource as retained for debugging.
pub fn is_retained(labels: &HashMap<String, String>) -> bool {
    labels.get(LABEL_RETAIN).map(String::as_str) == Some("true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_labels() {
        let labels = job_labels(ContainerRole::Stage, 42, StageKind::Deadwood, true);
        assert_eq!(labels[LABEL_ROLE], "stage");
        assert_eq!(labels[LABEL_DATASET], "42");
        assert_eq!(labels[LABEL_STAGE], "deadwood");
        assert!(is_retained(&labels));

        let labels = job_labels(ContainerRole::Transfer, 7, StageKind::Cog, false);
        assert!(!labels.contains_key(LABEL_RETAIN));
        assert_eq!(labels[LABEL_ROLE], "transfer");
        assert!(!is_retained(&labels));
    }

    #[test]
    fn test_volume_name_shape() {
        let name = volume_name(42, StageKind::OdmProcessing);
        assert!(name.starts_with("canopy-42-odm_processing-"));

        let other = volume_name(42, StageKind::OdmProcessing);
        assert_ne!(name, other, "volume names must be unique per job");
    }
}
