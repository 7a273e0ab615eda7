//! Error types for canopy-processor operations.
//!
//! Defines the cross-cutting error types shared by the scheduler core:
//! - Docker container and volume management
//! - Stage execution failures (tagged with stage and dataset)
//!
//! Subsystem-local errors (queue, status store, reporting, configuration)
//! live next to their modules.

use thiserror::Error;

use crate::stages::StageKind;

/// Errors that can occur during Docker operations.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Failed to create container: {0}")]
    CreateFailed(String),

    #[error("Failed to start container: {0}")]
    StartFailed(String),

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("Container exited with non-zero code {code}: {detail}")]
    NonZeroExit { code: i64, detail: String },

    #[error("Failed to copy files through the shared volume: {0}")]
    TransferFailed(String),

    #[error("Failed to create volume '{name}': {message}")]
    VolumeCreateFailed { name: String, message: String },

    #[error("Failed to remove volume '{name}' after {attempts} attempts: {message}")]
    VolumeRemoveFailed {
        name: String,
        attempts: u32,
        message: String,
    },

    #[error("Docker API error: {0}")]
    Api(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bollard::errors::Error> for DockerError {
    fn from(e: bollard::errors::Error) -> Self {
        DockerError::Api(e.to_string())
    }
}

/// A stage failure, tagged with the stage and dataset it belongs to.
///
/// The pipeline executor converts any error raised by a stage implementation
/// into this type so the outer loop can report and drop the task without
/// inspecting the underlying cause.
#[derive(Debug, Error)]
#[error("Stage '{stage}' failed for dataset {dataset_id}: {cause}")]
pub struct StageError {
    /// The stage that failed.
    pub stage: StageKind,
    /// Dataset the task belongs to.
    pub dataset_id: i64,
    /// Human-readable cause, already flattened.
    pub cause: String,
}

impl StageError {
    /// Tags an arbitrary error with its stage and dataset.
    pub fn new(stage: StageKind, dataset_id: i64, cause: impl std::fmt::Display) -> Self {
        Self {
            stage,
            dataset_id,
            cause: cause.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_display() {
        let err = StageError::new(StageKind::Cog, 42, "gdal_translate exited with 1");
        let msg = err.to_string();
        assert!(msg.contains("cog"));
        assert!(msg.contains("42"));
        assert!(msg.contains("gdal_translate"));
    }

    #[test]
    fn test_docker_error_display() {
        let err = DockerError::NonZeroExit {
            code: 137,
            detail: "oom killed".to_string(),
        };
        assert!(err.to_string().contains("137"));

        let err = DockerError::VolumeRemoveFailed {
            name: "canopy-42-cog-abc".to_string(),
            attempts: 5,
            message: "volume is in use".to_string(),
        };
        assert!(err.to_string().contains("5 attempts"));
    }
}
