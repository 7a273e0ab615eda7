//! Crash detection from persisted state.
//!
//! The worker processes one task at a time and always returns
//! `current_status` to idle before finishing with a dataset. A non-idle
//! `current_status` at pickup can therefore only mean a previous worker died
//! mid-stage.

use crate::stages::{StageKind, PIPELINE_ORDER};
use crate::status::{CurrentStatus, DatasetStatus};

/// The stage a dead worker was in the middle of, if the status row shows a
/// crash. Returns `None` for a healthy idle row.
///
/// The stage recorded in `current_status` is authoritative. If that flag is
/// somehow inconsistent with the done flags (the stage already reads as
/// done), the first requested stage that is not done is blamed instead, so
/// the recovery message points at work that was actually lost.
pub fn crashed_stage(status: &DatasetStatus, requested: &[StageKind]) -> Option<StageKind> {
    let stage = match status.current_status {
        CurrentStatus::Idle => return None,
        CurrentStatus::Processing(stage) => stage,
    };

    if !status.is_done(stage) {
        return Some(stage);
    }

    PIPELINE_ORDER
        .into_iter()
        .find(|s| requested.contains(s) && !status.is_done(*s))
        .or(Some(stage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_row_is_not_a_crash() {
        let status = DatasetStatus::new(1);
        assert_eq!(crashed_stage(&status, &[StageKind::Cog]), None);
    }

    #[test]
    fn test_mid_stage_row_is_a_crash() {
        let mut status = DatasetStatus::new(1);
        status.current_status = CurrentStatus::Processing(StageKind::Metadata);
        assert_eq!(
            crashed_stage(&status, &[StageKind::Metadata, StageKind::Cog]),
            Some(StageKind::Metadata)
        );
    }

    #[test]
    fn test_done_current_stage_blames_next_pending() {
        let mut status = DatasetStatus::new(1);
        status.current_status = CurrentStatus::Processing(StageKind::Metadata);
        status.set_done(StageKind::Metadata, true);
        assert_eq!(
            crashed_stage(&status, &[StageKind::Metadata, StageKind::Cog]),
            Some(StageKind::Cog)
        );
    }

    #[test]
    fn test_everything_done_still_reports_the_stale_stage() {
        let mut status = DatasetStatus::new(1);
        status.current_status = CurrentStatus::Processing(StageKind::Cog);
        status.set_done(StageKind::Cog, true);
        assert_eq!(
            crashed_stage(&status, &[StageKind::Cog]),
            Some(StageKind::Cog)
        );
    }
}
