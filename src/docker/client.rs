//! Docker API wrapper using the bollard crate.
//!
//! Container and volume lifecycle for the pipeline: creating labeled
//! containers and named volumes, waiting for completion, reading bounded log
//! tails, and the label-filtered listings the reaper sweeps over. The
//! streaming file copy in and out of shared volumes lives in
//! [`super::transfer`].

use std::collections::HashMap;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;

use crate::error::DockerError;

/// Specification for creating a pipeline container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Unique container name.
    pub name: String,
    /// Docker image.
    pub image: String,
    /// Command to run; `None` uses the image default.
    pub cmd: Option<Vec<String>>,
    /// Environment variables (`KEY=value`).
    pub env: Vec<String>,
    /// Volume binds (`volume:/mountpoint` format).
    pub binds: Vec<String>,
    /// Resource labels (role, dataset, stage, retain).
    pub labels: HashMap<String, String>,
    /// Request a GPU device for the container.
    pub gpu: bool,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cmd: None,
            env: Vec::new(),
            binds: Vec::new(),
            labels: HashMap::new(),
            gpu: false,
        }
    }

    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = Some(cmd);
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.binds.push(bind.into());
        self
    }

    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_gpu(mut self, gpu: bool) -> Self {
        self.gpu = gpu;
        self
    }
}

/// Final observed state of a container, as captured for forensics.
#[derive(Debug, Clone, Default)]
pub struct ContainerFinalState {
    pub id: Option<String>,
    pub name: Option<String>,
    pub image: Option<String>,
    pub created_at: Option<String>,
    pub status: Option<String>,
    pub exit_code: Option<i64>,
    pub oom_killed: Option<bool>,
    pub error: Option<String>,
}

/// A container returned by a label-filtered listing.
#[derive(Debug, Clone)]
pub struct FoundContainer {
    pub id: String,
    pub name: String,
    pub state: String,
    pub created_at: Option<DateTime<Utc>>,
    pub labels: HashMap<String, String>,
}

/// A named volume returned by a listing.
#[derive(Debug, Clone)]
pub struct FoundVolume {
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub labels: HashMap<String, String>,
}

/// Docker client wrapper for container and volume operations.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connects to the local Docker daemon.
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::DaemonUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Wraps an existing bollard instance.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Creates a container, returning its id.
    pub async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        let device_requests = if spec.gpu {
            Some(vec![DeviceRequest {
                driver: Some("nvidia".to_string()),
                count: Some(-1),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }])
        } else {
            None
        };

        let host_config = HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            device_requests,
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.cmd.clone(),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| DockerError::CreateFailed(e.to_string()))?;

        Ok(response.id)
    }

    /// Starts a container by id.
    pub async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DockerError::StartFailed(e.to_string()))?;
        Ok(())
    }

    /// Waits for a container to stop and returns its exit code.
    pub async fn wait_container(&self, id: &str) -> Result<i64, DockerError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));

        if let Some(result) = stream.next().await {
            // The wait endpoint reports a non-zero status both through the
            // response body and as an error; either way the exit code is what
            // the caller needs.
            return match result {
                Ok(response) => Ok(response.status_code),
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => Ok(code),
                Err(e) => Err(e.into()),
            };
        }

        // Empty stream; fall back to inspect.
        let state = self.inspect_state(id).await?;
        state.exit_code.ok_or_else(|| {
            DockerError::Api("container wait returned no status".to_string())
        })
    }

    /// Removes a container. Force-removal also kills a running container.
    pub async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    /// Inspects a container's final state. Every field is optional because
    /// the container may already be partially gone.
    pub async fn inspect_state(&self, id: &str) -> Result<ContainerFinalState, DockerError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if e.to_string().contains("No such container") {
                    DockerError::ContainerNotFound { id: id.to_string() }
                } else {
                    DockerError::Api(e.to_string())
                }
            })?;

        let mut out = ContainerFinalState {
            id: info.id,
            name: info.name,
            image: info.image,
            created_at: info.created,
            ..Default::default()
        };

        if let Some(state) = info.state {
            out.status = state.status.map(|s| s.to_string());
            out.exit_code = state.exit_code;
            out.oom_killed = state.oom_killed;
            out.error = state.error.filter(|e| !e.is_empty());
        }

        Ok(out)
    }

    /// Reads a bounded tail of the container's combined output streams.
    pub async fn logs_tail(&self, id: &str, tail_lines: u32) -> Result<String, DockerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail_lines.to_string(),
            ..Default::default()
        };

        let mut logs = self.docker.logs(id, Some(options));
        let mut output = String::new();

        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                    output.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => return Err(DockerError::Api(e.to_string())),
            }
        }

        Ok(output)
    }

    /// Lists containers (running and exited) carrying the given label
    /// key=value pairs.
    pub async fn list_labeled(
        &self,
        label_filters: &[(&str, &str)],
    ) -> Result<Vec<FoundContainer>, DockerError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            label_filters
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>(),
        );

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(FoundContainer {
                    id: c.id?,
                    name: c
                        .names
                        .and_then(|n| n.first().cloned())
                        .unwrap_or_default()
                        .trim_start_matches('/')
                        .to_string(),
                    state: c.state.unwrap_or_default(),
                    created_at: c.created.and_then(|secs| DateTime::from_timestamp(secs, 0)),
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    /// Lists containers that reference the given named volume.
    pub async fn containers_referencing_volume(
        &self,
        volume: &str,
    ) -> Result<Vec<FoundContainer>, DockerError> {
        let mut filters = HashMap::new();
        filters.insert("volume".to_string(), vec![volume.to_string()]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(FoundContainer {
                    id: c.id?,
                    name: String::new(),
                    state: c.state.unwrap_or_default(),
                    created_at: c.created.and_then(|secs| DateTime::from_timestamp(secs, 0)),
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    /// Creates a named, labeled volume.
    pub async fn create_volume(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), DockerError> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            labels,
            ..Default::default()
        };
        self.docker
            .create_volume(options)
            .await
            .map_err(|e| DockerError::VolumeCreateFailed {
                name: name.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    /// Removes a named volume.
    pub async fn remove_volume(&self, name: &str, force: bool) -> Result<(), DockerError> {
        let options = RemoveVolumeOptions { force };
        self.docker.remove_volume(name, Some(options)).await?;
        Ok(())
    }

    /// Lists all named volumes.
    pub async fn list_volumes(&self) -> Result<Vec<FoundVolume>, DockerError> {
        let options = ListVolumesOptions::<String>::default();
        let response = self.docker.list_volumes(Some(options)).await?;

        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| FoundVolume {
                created_at: v
                    .created_at
                    .as_deref()
                    .and_then(parse_docker_timestamp),
                name: v.name,
                labels: v.labels,
            })
            .collect())
    }

    /// Pulls an image if it is not already present locally.
    pub async fn ensure_image(&self, image: &str) -> Result<(), DockerError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| DockerError::Api(format!("image pull failed: {e}")))?;
        }
        Ok(())
    }
}

/// Parses the RFC 3339 timestamps Docker attaches to volumes and containers.
pub fn parse_docker_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_spec_builder() {
        let mut labels = HashMap::new();
        labels.insert("org.canopy.role".to_string(), "stage".to_string());

        let spec = ContainerSpec::new("canopy-42-cog", "opendronemap/odm:3.5.4")
            .with_cmd(vec!["odm".to_string(), "--fast-orthophoto".to_string()])
            .with_env(vec!["DATASET=42".to_string()])
            .with_bind("canopy-42-odm-abc:/data")
            .with_labels(labels)
            .with_gpu(true);

        assert_eq!(spec.name, "canopy-42-cog");
        assert_eq!(spec.cmd.as_ref().unwrap().len(), 2);
        assert_eq!(spec.binds, vec!["canopy-42-odm-abc:/data"]);
        assert!(spec.gpu);
        assert_eq!(spec.labels["org.canopy.role"], "stage");
    }

    #[test]
    fn test_parse_docker_timestamp() {
        let ts = parse_docker_timestamp("2026-08-30T10:15:00Z").unwrap();
        assert_eq!(ts.timezone(), Utc);
        assert!(parse_docker_timestamp("not a time").is_none());
    }

    #[test]
    fn test_final_state_default_is_empty() {
        let state = ContainerFinalState::default();
        assert!(state.exit_code.is_none());
        assert!(state.oom_killed.is_none());
    }
}
