//! Stage definitions for the processing pipeline.
//!
//! The pipeline is a fixed, ordered sequence of stages. A submission may
//! request any subset of them, but execution always follows the canonical
//! order defined by [`PIPELINE_ORDER`]. Each stage maps to exactly one
//! done-flag column on the dataset status row and one "processing" value of
//! the status state machine, so the mapping is checked at compile time
//! instead of being keyed by strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One stage of the fixed processing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Raw-image to orthophoto reconstruction (OpenDroneMap).
    OdmProcessing,
    /// Standardize the uploaded orthophoto into a well-formed GeoTIFF.
    Geotiff,
    /// Extract acquisition metadata from the orthophoto.
    Metadata,
    /// Encode the orthophoto as a cloud-optimized GeoTIFF.
    Cog,
    /// Render the preview thumbnail.
    Thumbnail,
    /// Deadwood segmentation (ML inference).
    Deadwood,
    /// Forest-cover segmentation (ML inference).
    Treecover,
}

/// Canonical execution order of the pipeline.
///
/// Requested stages are always run in this order, regardless of the order
/// they were submitted in. The crash-detection walk iterates this slice, so
/// the ordering here is the single source of truth.
pub const PIPELINE_ORDER: [StageKind; 7] = [
    StageKind::OdmProcessing,
    StageKind::Geotiff,
    StageKind::Metadata,
    StageKind::Cog,
    StageKind::Thumbnail,
    StageKind::Deadwood,
    StageKind::Treecover,
];

/// Error returned when a stage identifier cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown stage '{0}'")]
pub struct UnknownStage(pub String);

impl StageKind {
    /// Stable identifier used in the queue table and on container labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::OdmProcessing => "odm_processing",
            StageKind::Geotiff => "geotiff",
            StageKind::Metadata => "metadata",
            StageKind::Cog => "cog",
            StageKind::Thumbnail => "thumbnail",
            StageKind::Deadwood => "deadwood",
            StageKind::Treecover => "treecover",
        }
    }

    /// Column name of this stage's done flag on the status row.
    pub fn done_column(&self) -> &'static str {
        match self {
            StageKind::OdmProcessing => "is_odm_done",
            StageKind::Geotiff => "is_ortho_done",
            StageKind::Metadata => "is_metadata_done",
            StageKind::Cog => "is_cog_done",
            StageKind::Thumbnail => "is_thumbnail_done",
            StageKind::Deadwood => "is_deadwood_done",
            StageKind::Treecover => "is_forest_cover_done",
        }
    }

    /// Value of `current_status` while this stage is executing.
    pub fn processing_status(&self) -> &'static str {
        match self {
            StageKind::OdmProcessing => "odm_processing",
            StageKind::Geotiff => "ortho_processing",
            StageKind::Metadata => "metadata_processing",
            StageKind::Cog => "cog_processing",
            StageKind::Thumbnail => "thumbnail_processing",
            StageKind::Deadwood => "deadwood_segmentation",
            StageKind::Treecover => "forest_cover_segmentation",
        }
    }

    /// Whether this stage runs inside an isolated container reached only
    /// through a shared volume. The remaining stages are local
    /// transformations delegated to the stage backend.
    pub fn is_containerized(&self) -> bool {
        matches!(
            self,
            StageKind::OdmProcessing | StageKind::Deadwood | StageKind::Treecover
        )
    }

    /// Resolves a `current_status` processing value back to its stage.
    ///
    /// Returns `None` for "idle" or anything unrecognized.
    pub fn from_processing_status(status: &str) -> Option<StageKind> {
        PIPELINE_ORDER
            .into_iter()
            .find(|s| s.processing_status() == status)
    }

    /// Position of this stage in the canonical pipeline order.
    pub fn pipeline_index(&self) -> usize {
        PIPELINE_ORDER
            .iter()
            .position(|s| s == self)
            .unwrap_or(usize::MAX)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "odm_processing" => Ok(StageKind::OdmProcessing),
            "geotiff" => Ok(StageKind::Geotiff),
            "metadata" => Ok(StageKind::Metadata),
            "cog" => Ok(StageKind::Cog),
            "thumbnail" => Ok(StageKind::Thumbnail),
            "deadwood" => Ok(StageKind::Deadwood),
            "treecover" => Ok(StageKind::Treecover),
            other => Err(UnknownStage(other.to_string())),
        }
    }
}

/// Deduplicates the requested stages and sorts them into canonical order.
///
/// Submission order carries no meaning; the pipeline order is authoritative.
pub fn normalize_requested(stages: &[StageKind]) -> Vec<StageKind> {
    let mut out: Vec<StageKind> = Vec::with_capacity(stages.len());
    for stage in PIPELINE_ORDER {
        if stages.contains(&stage) && !out.contains(&stage) {
            out.push(stage);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_order_is_total() {
        // Every variant appears exactly once.
        for stage in [
            StageKind::OdmProcessing,
            StageKind::Geotiff,
            StageKind::Metadata,
            StageKind::Cog,
            StageKind::Thumbnail,
            StageKind::Deadwood,
            StageKind::Treecover,
        ] {
            assert_eq!(
                PIPELINE_ORDER.iter().filter(|s| **s == stage).count(),
                1,
                "stage {stage} missing from pipeline order"
            );
        }
    }

    #[test]
    fn test_roundtrip_parse() {
        for stage in PIPELINE_ORDER {
            assert_eq!(stage.as_str().parse::<StageKind>().unwrap(), stage);
        }
        assert!("orthomosaic".parse::<StageKind>().is_err());
    }

    #[test]
    fn test_normalize_sorts_and_dedups() {
        let requested = vec![
            StageKind::Thumbnail,
            StageKind::Metadata,
            StageKind::Thumbnail,
            StageKind::Cog,
        ];
        assert_eq!(
            normalize_requested(&requested),
            vec![StageKind::Metadata, StageKind::Cog, StageKind::Thumbnail]
        );
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_requested(&[]).is_empty());
    }

    #[test]
    fn test_containerized_split() {
        assert!(StageKind::OdmProcessing.is_containerized());
        assert!(StageKind::Deadwood.is_containerized());
        assert!(StageKind::Treecover.is_containerized());
        assert!(!StageKind::Geotiff.is_containerized());
        assert!(!StageKind::Metadata.is_containerized());
        assert!(!StageKind::Cog.is_containerized());
        assert!(!StageKind::Thumbnail.is_containerized());
    }

    #[test]
    fn test_done_columns_unique() {
        let mut cols: Vec<&str> = PIPELINE_ORDER.iter().map(|s| s.done_column()).collect();
        cols.sort_unstable();
        cols.dedup();
        assert_eq!(cols.len(), PIPELINE_ORDER.len());
    }

    #[test]
    fn test_pipeline_index_matches_order() {
        assert_eq!(StageKind::OdmProcessing.pipeline_index(), 0);
        assert_eq!(StageKind::Treecover.pipeline_index(), 6);
        assert!(StageKind::Metadata.pipeline_index() < StageKind::Cog.pipeline_index());
    }
}
