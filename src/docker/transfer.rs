//! Streaming file movement between the host and job containers.
//!
//! Copies go through the `docker` CLI with piped standard streams, so file
//! contents never pass through this process's memory; the daemon streams the
//! archive itself. Input files can be multi-gigabyte orthophotos and result
//! sets can reach tens of gigabytes, so nothing here may buffer a whole
//! file.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::error::DockerError;

/// Copies a host file or directory into a container path.
///
/// The destination directory must already exist inside the container.
pub async fn copy_into_container(
    container: &str,
    host_src: &Path,
    container_dest: &str,
) -> Result<(), DockerError> {
    let src = host_src.to_string_lossy();
    let output = Command::new("docker")
        .args(["cp", src.as_ref(), &format!("{container}:{container_dest}")])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(DockerError::TransferFailed(format!(
            "copy of '{src}' into {container}:{container_dest} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Copies a container path out to a host directory.
pub async fn copy_from_container(
    container: &str,
    container_src: &str,
    host_dest: &Path,
) -> Result<(), DockerError> {
    let dest = host_dest.to_string_lossy();
    let output = Command::new("docker")
        .args(["cp", &format!("{container}:{container_src}"), dest.as_ref()])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(DockerError::TransferFailed(format!(
            "copy of {container}:{container_src} to '{dest}' failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Creates directories inside a running container.
pub async fn make_dirs(container: &str, dirs: &[&str]) -> Result<(), DockerError> {
    let mut args = vec!["exec", container, "mkdir", "-p"];
    args.extend(dirs);

    let output = Command::new("docker")
        .args(&args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(DockerError::TransferFailed(format!(
            "mkdir in {container} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
