//! Failure evidence capture for containerized stages.
//!
//! When a stage container exits non-zero (or is found dead), the collector
//! snapshots whatever it can still observe: inspect output (exit code, OOM
//! flag, error string) and a bounded tail of the combined logs. The snapshot
//! is written as a debug bundle on disk and a compact record is persisted to
//! the processing log so failure reports can embed a summary without
//! re-reading the bundle.
//!
//! Collection is infallible from the caller's perspective. Every step is
//! best-effort; anything that cannot be captured is logged and skipped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::docker::{ContainerFinalState, DockerClient};
use crate::stages::StageKind;
use crate::status::{LogLevel, StatusStore};

/// Upper bound on the captured log tail, in bytes.
pub const MAX_LOG_TAIL_BYTES: usize = 64 * 1024;

/// Number of log lines requested from the daemon before the byte cap.
const LOG_TAIL_LINES: u32 = 400;

/// Snapshot of a failed container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForensicsRecord {
    pub dataset_id: i64,
    pub stage: StageKind,
    pub captured_at: DateTime<Utc>,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub image: Option<String>,
    pub container_created_at: Option<String>,
    pub status: Option<String>,
    pub exit_code: Option<i64>,
    pub oom_killed: Option<bool>,
    pub error: Option<String>,
    /// Size of the captured log tail written next to the record.
    pub log_tail_bytes: usize,
}

impl ForensicsRecord {
    /// One-line summary suitable for error messages and reports.
    pub fn summary(&self) -> String {
        let exit = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let oom = if self.oom_killed == Some(true) {
            ", OOM-killed"
        } else {
            ""
        };
        format!(
            "container {} exited with code {exit}{oom}",
            self.container_name
                .as_deref()
                .or(self.container_id.as_deref())
                .unwrap_or("<gone>")
        )
    }
}

/// Collects and persists failure evidence.
pub struct ForensicsCollector {
    base_dir: PathBuf,
    store: Arc<dyn StatusStore>,
}

impl ForensicsCollector {
    pub fn new(base_dir: impl Into<PathBuf>, store: Arc<dyn StatusStore>) -> Self {
        Self {
            base_dir: base_dir.into(),
            store,
        }
    }

    /// Captures evidence for a (possibly already exited) container.
    ///
    /// Never fails; returns `None` only when nothing at all could be
    /// observed about the container.
    pub async fn collect(
        &self,
        client: &DockerClient,
        container_id: &str,
        dataset_id: i64,
        stage: StageKind,
    ) -> Option<ForensicsRecord> {
        let state = match client.inspect_state(container_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(container = container_id, dataset_id, %stage, error = %e,
                    "Forensics: container inspect failed");
                ContainerFinalState::default()
            }
        };

        let log_tail = match client.logs_tail(container_id, LOG_TAIL_LINES).await {
            Ok(logs) => bound_tail(&logs, MAX_LOG_TAIL_BYTES),
            Err(e) => {
                warn!(container = container_id, dataset_id, %stage, error = %e,
                    "Forensics: log capture failed");
                String::new()
            }
        };

        if state.id.is_none() && log_tail.is_empty() {
            warn!(container = container_id, dataset_id, %stage,
                "Forensics: nothing observable, skipping bundle");
            return None;
        }

        let record = ForensicsRecord {
            dataset_id,
            stage,
            captured_at: Utc::now(),
            container_id: state.id,
            container_name: state.name.map(|n| n.trim_start_matches('/').to_string()),
            image: state.image,
            container_created_at: state.created_at,
            status: state.status,
            exit_code: state.exit_code,
            oom_killed: state.oom_killed,
            error: state.error,
            log_tail_bytes: log_tail.len(),
        };

        if let Err(e) = self.write_bundle(&record, &log_tail).await {
            warn!(dataset_id, %stage, error = %e, "Forensics: bundle write failed");
        }

        let compact = serde_json::to_string(&record)
            .unwrap_or_else(|_| record.summary());
        if let Err(e) = self
            .store
            .record_log(dataset_id, LogLevel::Error, &compact)
            .await
        {
            warn!(dataset_id, %stage, error = %e, "Forensics: log-store write failed");
        }

        Some(record)
    }

    /// Directory the bundle for this record lands in.
    pub fn bundle_dir(&self, record: &ForensicsRecord) -> PathBuf {
        bundle_dir(&self.base_dir, record.dataset_id, record.stage, record.captured_at)
    }

    async fn write_bundle(
        &self,
        record: &ForensicsRecord,
        log_tail: &str,
    ) -> std::io::Result<()> {
        let dir = self.bundle_dir(record);
        tokio::fs::create_dir_all(&dir).await?;

        let json = serde_json::to_vec_pretty(record)
            .unwrap_or_else(|_| record.summary().into_bytes());
        tokio::fs::write(dir.join("forensics.json"), json).await?;
        tokio::fs::write(dir.join("logs_tail.txt"), log_tail).await?;
        Ok(())
    }
}

/// Bundle path layout: `<base>/<dataset_id>/<timestamp>_<stage>/`.
pub fn bundle_dir(
    base: &Path,
    dataset_id: i64,
    stage: StageKind,
    captured_at: DateTime<Utc>,
) -> PathBuf {
    base.join(dataset_id.to_string())
        .join(format!("{}_{stage}", captured_at.format("%Y%m%dT%H%M%S")))
}

/// Keeps at most the last `max_bytes` of the string, on a char boundary.
pub fn bound_tail(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) && start < s.len() {
        start += 1;
    }
    s[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::MemoryStatusStore;

    #[test]
    fn test_bound_tail_short_input() {
        assert_eq!(bound_tail("hello", 64), "hello");
        assert_eq!(bound_tail("", 64), "");
    }

    #[test]
    fn test_bound_tail_keeps_end() {
        let input = "a".repeat(100) + "TAIL";
        let bounded = bound_tail(&input, 10);
        assert_eq!(bounded.len(), 10);
        assert!(bounded.ends_with("TAIL"));
    }

    #[test]
    fn test_bound_tail_char_boundary() {
        let input = format!("{}é", "x".repeat(20));
        // Cutting mid-codepoint must not panic.
        for max in 1..=4 {
            let _ = bound_tail(&input, max);
        }
    }

    #[test]
    fn test_bundle_dir_layout() {
        let ts = DateTime::parse_from_rfc3339("2026-08-30T10:15:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let dir = bundle_dir(Path::new("/debug"), 42, StageKind::Cog, ts);
        assert_eq!(
            dir,
            PathBuf::from("/debug/42/20260830T101500_cog")
        );
    }

    #[test]
    fn test_record_summary() {
        let record = ForensicsRecord {
            dataset_id: 42,
            stage: StageKind::Deadwood,
            captured_at: Utc::now(),
            container_id: Some("abcdef".to_string()),
            container_name: Some("canopy-42-deadwood".to_string()),
            image: None,
            container_created_at: None,
            status: Some("exited".to_string()),
            exit_code: Some(137),
            oom_killed: Some(true),
            error: None,
            log_tail_bytes: 0,
        };
        let summary = record.summary();
        assert!(summary.contains("137"));
        assert!(summary.contains("OOM-killed"));
        assert!(summary.contains("canopy-42-deadwood"));
    }

    #[tokio::test]
    async fn test_bundle_written_to_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStatusStore::new());
        let collector = ForensicsCollector::new(tmp.path(), store);

        let record = ForensicsRecord {
            dataset_id: 7,
            stage: StageKind::Treecover,
            captured_at: Utc::now(),
            container_id: Some("deadbeef".to_string()),
            container_name: None,
            image: Some("canopy/treecover-inference:latest".to_string()),
            container_created_at: None,
            status: Some("exited".to_string()),
            exit_code: Some(1),
            oom_killed: Some(false),
            error: None,
            log_tail_bytes: 9,
        };

        collector.write_bundle(&record, "tail text").await.unwrap();

        let dir = collector.bundle_dir(&record);
        let json = std::fs::read_to_string(dir.join("forensics.json")).unwrap();
        assert!(json.contains("\"exit_code\": 1"));
        assert_eq!(
            std::fs::read_to_string(dir.join("logs_tail.txt")).unwrap(),
            "tail text"
        );
    }
}
