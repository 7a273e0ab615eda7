//! Startup sweep for leaked containers and volumes.
//!
//! A crash between container creation and teardown leaves helpers, stage
//! containers, and shared volumes behind. The reaper runs before the first
//! scheduling cycle and removes everything this worker labeled that has
//! outlived its purpose. Age decisions are pure functions so they can be
//! tested without a daemon.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::docker::{
    is_retained, ContainerRole, DockerClient, FoundContainer, FoundVolume, LABEL_ROLE,
    VOLUME_PREFIX,
};
use crate::error::DockerError;

/// Transfer and extract helpers never legitimately live this long.
const ZOMBIE_HELPER_HOURS: i64 = 2;

/// What one sweep removed and what it left alone.
#[derive(Debug, Clone, Default)]
pub struct ReapReport {
    pub containers_removed: usize,
    pub volumes_removed: usize,
    pub kept: usize,
}

pub struct ResourceReaper {
    client: DockerClient,
    /// How long retained and exited stage containers (and orphaned volumes)
    /// are kept around for inspection.
    retention_ttl: Duration,
}

impl ResourceReaper {
    pub fn new(client: DockerClient, retention_ttl: Duration) -> Self {
        Self {
            client,
            retention_ttl,
        }
    }

    /// Sweeps leaked containers and volumes. Individual removal failures are
    /// logged and skipped; only listing failures abort the sweep.
    pub async fn sweep(&self) -> Result<ReapReport, DockerError> {
        let now = Utc::now();
        let mut report = ReapReport::default();

        for role in [
            ContainerRole::Transfer,
            ContainerRole::Extract,
            ContainerRole::Stage,
        ] {
            let containers = self
                .client
                .list_labeled(&[(LABEL_ROLE, role.as_str())])
                .await?;
            for container in containers {
                if self.reap_container(role, &container, now).await {
                    report.containers_removed += 1;
                } else {
                    report.kept += 1;
                }
            }
        }

        report.volumes_removed = self.sweep_volumes(now).await?;

        info!(
            containers_removed = report.containers_removed,
            volumes_removed = report.volumes_removed,
            kept = report.kept,
            "Resource sweep complete"
        );
        Ok(report)
    }

    async fn reap_container(
        &self,
        role: ContainerRole,
        container: &FoundContainer,
        now: DateTime<Utc>,
    ) -> bool {
        let eligible = match role {
            ContainerRole::Transfer | ContainerRole::Extract => {
                helper_is_zombie(container.created_at, now)
            }
            ContainerRole::Stage => stage_is_expired(container, now, self.retention_ttl),
        };

        if !eligible {
            return false;
        }

        match self.client.remove_container(&container.id, true).await {
            Ok(()) => {
                info!(container = %container.name, role = %role.as_str(), "Reaped container");
                true
            }
            Err(e) => {
                warn!(container = %container.name, error = %e, "Container reap failed");
                false
            }
        }
    }

    async fn sweep_volumes(&self, now: DateTime<Utc>) -> Result<usize, DockerError> {
        let mut removed = 0;
        for volume in self.client.list_volumes().await? {
            if !volume.name.starts_with(VOLUME_PREFIX) {
                continue;
            }
            let referenced = !self
                .client
                .containers_referencing_volume(&volume.name)
                .await?
                .is_empty();
            if !volume_is_reapable(&volume, referenced, now, self.retention_ttl) {
                debug!(volume = %volume.name, referenced, "Volume kept");
                continue;
            }
            match self.client.remove_volume(&volume.name, false).await {
                Ok(()) => {
                    info!(volume = %volume.name, "Reaped orphaned volume");
                    removed += 1;
                }
                Err(e) => {
                    warn!(volume = %volume.name, error = %e, "Volume reap failed");
                }
            }
        }
        Ok(removed)
    }
}

/// A helper container past the fixed zombie threshold. Containers whose
/// creation time is unknown are left alone.
fn helper_is_zombie(created_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    past_ttl(created_at, now, Duration::hours(ZOMBIE_HELPER_HOURS))
}

/// A stage container that finished and outlived the retention window.
/// Running containers are always kept; they belong to an in-flight job.
/// Retain-labeled containers are only ever kept until the window expires,
/// whatever dataset they belong to.
fn stage_is_expired(container: &FoundContainer, now: DateTime<Utc>, ttl: Duration) -> bool {
    if is_retained(&container.labels) {
        return past_ttl(container.created_at, now, ttl);
    }
    match container.state.as_str() {
        "exited" | "dead" | "created" => past_ttl(container.created_at, now, ttl),
        _ => false,
    }
}

/// Volume sweep decision: only volumes this worker created, unreferenced by
/// any container and past the retention window, are removed.
fn volume_is_reapable(
    volume: &FoundVolume,
    referenced: bool,
    now: DateTime<Utc>,
    ttl: Duration,
) -> bool {
    volume.name.starts_with(VOLUME_PREFIX)
        && !referenced
        && past_ttl(volume.created_at, now, ttl)
}

fn past_ttl(created_at: Option<DateTime<Utc>>, now: DateTime<Utc>, ttl: Duration) -> bool {
    match created_at {
        Some(created) => now.signed_duration_since(created) > ttl,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::job_labels;
    use crate::stages::StageKind;
    use std::collections::HashMap;

    fn container(state: &str, age_hours: i64) -> FoundContainer {
        FoundContainer {
            id: "abc123".to_string(),
            name: "canopy-42-metadata-deadbeef-stage".to_string(),
            state: state.to_string(),
            created_at: Some(Utc::now() - Duration::hours(age_hours)),
            labels: HashMap::new(),
        }
    }

    #[test]
    fn test_fresh_helper_is_not_zombie() {
        let now = Utc::now();
        assert!(!helper_is_zombie(Some(now - Duration::minutes(30)), now));
    }

    #[test]
    fn test_old_helper_is_zombie() {
        let now = Utc::now();
        assert!(helper_is_zombie(Some(now - Duration::hours(3)), now));
    }

    #[test]
    fn test_unknown_age_is_never_reaped() {
        let now = Utc::now();
        assert!(!helper_is_zombie(None, now));
        assert!(!past_ttl(None, now, Duration::hours(1)));
    }

    #[test]
    fn test_running_stage_container_is_kept() {
        let c = container("running", 100);
        assert!(!stage_is_expired(&c, Utc::now(), Duration::hours(48)));
    }

    #[test]
    fn test_exited_stage_container_expires_after_ttl() {
        let now = Utc::now();
        let ttl = Duration::hours(48);
        assert!(!stage_is_expired(&container("exited", 24), now, ttl));
        assert!(stage_is_expired(&container("exited", 72), now, ttl));
        assert!(stage_is_expired(&container("dead", 72), now, ttl));
    }

    #[test]
    fn test_retained_container_expires_after_ttl() {
        let now = Utc::now();
        let ttl = Duration::hours(48);
        let mut kept = container("exited", 72);
        kept.labels = job_labels(ContainerRole::Stage, 42, StageKind::Deadwood, true);
        assert!(stage_is_expired(&kept, now, ttl), "retention is bounded by the ttl");

        kept.created_at = Some(now - Duration::hours(24));
        assert!(!stage_is_expired(&kept, now, ttl));
    }

    fn volume(name: &str, age_hours: i64) -> FoundVolume {
        FoundVolume {
            name: name.to_string(),
            created_at: Some(Utc::now() - Duration::hours(age_hours)),
            labels: HashMap::new(),
        }
    }

    #[test]
    fn test_volume_sweep_decision() {
        let now = Utc::now();
        let ttl = Duration::hours(48);
        let orphan = volume("canopy-42-cog-deadbeef", 72);

        assert!(volume_is_reapable(&orphan, false, now, ttl));
        assert!(!volume_is_reapable(&orphan, true, now, ttl), "referenced volumes stay");
        assert!(!volume_is_reapable(&volume("pgdata", 72), false, now, ttl));
        assert!(!volume_is_reapable(&volume("canopy-7-cog-beefdead", 24), false, now, ttl));
    }
}
