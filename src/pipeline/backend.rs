//! Local (non-containerized) stage execution.
//!
//! The lightweight raster stages shell out to the host toolchain instead of
//! paying for a container round trip. Command templates come from
//! configuration with `{input}`, `{output}`, `{work}` and `{dataset}`
//! placeholders substituted per invocation.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::ToolchainConfig;
use crate::error::StageError;
use crate::stages::StageKind;

/// Seam between the pipeline executor and local stage execution.
#[async_trait]
pub trait StageBackend: Send + Sync {
    /// Runs one local stage against `input_dir`, writing results into
    /// `output_dir`. `work_dir` is scratch space wiped by the caller.
    async fn run(
        &self,
        stage: StageKind,
        dataset_id: i64,
        input_dir: &Path,
        output_dir: &Path,
        work_dir: &Path,
    ) -> Result<(), StageError>;
}

/// Backend that invokes the configured host toolchain.
pub struct ToolchainBackend {
    toolchain: ToolchainConfig,
}

impl ToolchainBackend {
    pub fn new(toolchain: ToolchainConfig) -> Self {
        Self { toolchain }
    }

    fn template(&self, stage: StageKind) -> Option<&[String]> {
        let template = match stage {
            StageKind::Geotiff => &self.toolchain.geotiff,
            StageKind::Metadata => &self.toolchain.metadata,
            StageKind::Cog => &self.toolchain.cog,
            StageKind::Thumbnail => &self.toolchain.thumbnail,
            _ => return None,
        };
        Some(template.as_slice())
    }
}

/// Substitutes the per-invocation placeholders into one template argument.
fn substitute(arg: &str, dataset_id: i64, input: &Path, output: &Path, work: &Path) -> String {
    arg.replace("{input}", &input.to_string_lossy())
        .replace("{output}", &output.to_string_lossy())
        .replace("{work}", &work.to_string_lossy())
        .replace("{dataset}", &dataset_id.to_string())
}

#[async_trait]
impl StageBackend for ToolchainBackend {
    async fn run(
        &self,
        stage: StageKind,
        dataset_id: i64,
        input_dir: &Path,
        output_dir: &Path,
        work_dir: &Path,
    ) -> Result<(), StageError> {
        let template = self
            .template(stage)
            .ok_or_else(|| StageError::new(stage, dataset_id, "stage has no local toolchain"))?;
        let (program, args) = template
            .split_first()
            .ok_or_else(|| StageError::new(stage, dataset_id, "empty toolchain command"))?;

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| StageError::new(stage, dataset_id, e))?;

        let args: Vec<String> = args
            .iter()
            .map(|a| substitute(a, dataset_id, input_dir, output_dir, work_dir))
            .collect();

        debug!(dataset_id, stage = %stage, program, ?args, "Running local toolchain stage");

        let output = Command::new(program)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| StageError::new(stage, dataset_id, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(20)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(StageError::new(
                stage,
                dataset_id,
                format!("{program} exited with {}: {tail}", output.status),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_substitute_replaces_all_placeholders() {
        let arg = substitute(
            "gdal_translate {input}/ortho.tif {output}/d{dataset}.tif",
            7,
            &PathBuf::from("/in"),
            &PathBuf::from("/out"),
            &PathBuf::from("/tmp/work"),
        );
        assert_eq!(arg, "gdal_translate /in/ortho.tif /out/d7.tif");
    }

    #[test]
    fn test_containerized_stages_have_no_template() {
        let backend = ToolchainBackend::new(ToolchainConfig::default());
        assert!(backend.template(StageKind::OdmProcessing).is_none());
        assert!(backend.template(StageKind::Deadwood).is_none());
        assert!(backend.template(StageKind::Treecover).is_none());
        assert!(backend.template(StageKind::Cog).is_some());
    }
}
