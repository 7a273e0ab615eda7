//! Worker configuration.
//!
//! All configuration is environment-driven with sensible defaults, covering
//! the queue/status database, the scratch and archive directories, artifact
//! retention, container images for the containerized stages, the local stage
//! toolchain commands, and the failure-report tracker.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Secondary sort key for equal-priority queue rows.
///
/// The ordering view only guarantees the primary priority sort; the
/// within-priority order is an explicit choice here rather than an accident
/// of row order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    /// FIFO within a priority band (secondary sort by enqueue timestamp).
    EnqueueTime,
    /// Secondary sort by row id.
    RowId,
}

/// Tracker endpoint for human-visible failure reports.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Base URL of the issue-tracker API.
    pub api_base: String,
    /// Repository/project the tickets are filed against (e.g. "org/datasets").
    pub repo: String,
}

/// External commands for the local (non-containerized) stages.
///
/// Each command is a program plus arguments; `{input}`, `{output}`, `{work}`
/// and `{dataset}` placeholders are substituted at invocation time. The image
/// heuristics live entirely inside these tools.
#[derive(Debug, Clone)]
pub struct ToolchainConfig {
    pub geotiff: Vec<String>,
    pub metadata: Vec<String>,
    pub cog: Vec<String>,
    pub thumbnail: Vec<String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            geotiff: split_command("gdalwarp -of GTiff {input} {output}"),
            metadata: split_command("gdalinfo -json {input}"),
            cog: split_command(
                "gdal_translate -of COG -co COMPRESS=DEFLATE -co OVERVIEWS=AUTO {input} {output}",
            ),
            thumbnail: split_command(
                "gdal_translate -of JPEG -outsize 256 0 {input} {output}",
            ),
        }
    }
}

/// Configuration for the worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    // Storage
    /// PostgreSQL connection URL for the queue and status tables.
    pub database_url: String,
    /// Directory holding uploaded dataset archives (stage inputs).
    pub archive_dir: PathBuf,
    /// Per-run scratch space, wiped before and after every task.
    pub scratch_dir: PathBuf,

    // Scheduling
    /// Sleep between cycles when watching and the queue is empty.
    pub poll_interval: Duration,
    /// Secondary ordering for equal-priority tasks.
    pub tie_break: TieBreak,

    // Containers
    /// Image for the throwaway transfer/extract helper containers.
    pub helper_image: String,
    /// Image for the OpenDroneMap stage.
    pub odm_image: String,
    /// Image for the deadwood segmentation stage.
    pub deadwood_image: String,
    /// Image for the forest-cover segmentation stage.
    pub treecover_image: String,
    /// Try a GPU device request first; fall back to CPU if the start fails.
    pub prefer_gpu: bool,

    // Local stages
    /// Commands for the non-containerized stages.
    pub toolchain: ToolchainConfig,

    // Retention / debugging
    /// Keep failed stage containers around for inspection.
    pub retention_enabled: bool,
    /// Optional dataset allowlist for retention; `None` retains all.
    pub retention_datasets: Option<Vec<i64>>,
    /// Age after which retained and orphaned resources become removable.
    pub retention_hours: u64,
    /// Base directory for forensic debug bundles.
    pub debug_bundle_dir: PathBuf,

    // Reporting
    /// Tracker endpoint; `None` disables ticket creation (logs only).
    pub tracker: Option<TrackerConfig>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/canopy".to_string(),
            archive_dir: PathBuf::from("/var/lib/canopy/archive"),
            scratch_dir: PathBuf::from("/tmp/canopy-processing"),
            poll_interval: Duration::from_secs(10),
            tie_break: TieBreak::EnqueueTime,
            helper_image: "alpine:3.19".to_string(),
            odm_image: "opendronemap/odm:3.5.4".to_string(),
            deadwood_image: "canopy/deadwood-inference:latest".to_string(),
            treecover_image: "canopy/treecover-inference:latest".to_string(),
            prefer_gpu: true,
            toolchain: ToolchainConfig::default(),
            retention_enabled: false,
            retention_datasets: None,
            retention_hours: 48,
            debug_bundle_dir: PathBuf::from("/var/lib/canopy/debug"),
            tracker: None,
        }
    }
}

impl WorkerConfig {
    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DATABASE_URL`: PostgreSQL connection URL (required)
    /// - `CANOPY_ARCHIVE_DIR`: uploaded dataset directory (default: /var/lib/canopy/archive)
    /// - `CANOPY_SCRATCH_DIR`: scratch space (default: /tmp/canopy-processing)
    /// - `CANOPY_POLL_INTERVAL_SECS`: watch-mode poll interval (default: 10)
    /// - `CANOPY_QUEUE_TIE_BREAK`: `enqueue-time` or `row-id` (default: enqueue-time)
    /// - `CANOPY_HELPER_IMAGE`, `CANOPY_ODM_IMAGE`, `CANOPY_DEADWOOD_IMAGE`,
    ///   `CANOPY_TREECOVER_IMAGE`: container images
    /// - `CANOPY_PREFER_GPU`: request a GPU device first (default: true)
    /// - `CANOPY_CMD_GEOTIFF` / `_METADATA` / `_COG` / `_THUMBNAIL`: local stage commands
    /// - `CANOPY_RETAIN_ARTIFACTS`: keep failed containers (default: false)
    /// - `CANOPY_RETAIN_DATASETS`: comma-separated dataset-id allowlist
    /// - `CANOPY_RETENTION_HOURS`: retention TTL (default: 48)
    /// - `CANOPY_DEBUG_DIR`: debug-bundle base directory
    /// - `CANOPY_TRACKER_API` + `CANOPY_TRACKER_REPO`: failure-report tracker
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        if let Ok(val) = std::env::var("CANOPY_ARCHIVE_DIR") {
            config.archive_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("CANOPY_SCRATCH_DIR") {
            config.scratch_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("CANOPY_POLL_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "CANOPY_POLL_INTERVAL_SECS")?;
            config.poll_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("CANOPY_QUEUE_TIE_BREAK") {
            config.tie_break = parse_tie_break(&val)?;
        }

        if let Ok(val) = std::env::var("CANOPY_HELPER_IMAGE") {
            config.helper_image = val;
        }
        if let Ok(val) = std::env::var("CANOPY_ODM_IMAGE") {
            config.odm_image = val;
        }
        if let Ok(val) = std::env::var("CANOPY_DEADWOOD_IMAGE") {
            config.deadwood_image = val;
        }
        if let Ok(val) = std::env::var("CANOPY_TREECOVER_IMAGE") {
            config.treecover_image = val;
        }

        if let Ok(val) = std::env::var("CANOPY_PREFER_GPU") {
            config.prefer_gpu = parse_env_bool(&val, "CANOPY_PREFER_GPU")?;
        }

        if let Ok(val) = std::env::var("CANOPY_CMD_GEOTIFF") {
            config.toolchain.geotiff = split_command(&val);
        }
        if let Ok(val) = std::env::var("CANOPY_CMD_METADATA") {
            config.toolchain.metadata = split_command(&val);
        }
        if let Ok(val) = std::env::var("CANOPY_CMD_COG") {
            config.toolchain.cog = split_command(&val);
        }
        if let Ok(val) = std::env::var("CANOPY_CMD_THUMBNAIL") {
            config.toolchain.thumbnail = split_command(&val);
        }

        if let Ok(val) = std::env::var("CANOPY_RETAIN_ARTIFACTS") {
            config.retention_enabled = parse_env_bool(&val, "CANOPY_RETAIN_ARTIFACTS")?;
        }

        if let Ok(val) = std::env::var("CANOPY_RETAIN_DATASETS") {
            config.retention_datasets = Some(parse_dataset_list(&val)?);
        }

        if let Ok(val) = std::env::var("CANOPY_RETENTION_HOURS") {
            config.retention_hours = parse_env_value(&val, "CANOPY_RETENTION_HOURS")?;
        }

        if let Ok(val) = std::env::var("CANOPY_DEBUG_DIR") {
            config.debug_bundle_dir = PathBuf::from(val);
        }

        match (
            std::env::var("CANOPY_TRACKER_API"),
            std::env::var("CANOPY_TRACKER_REPO"),
        ) {
            (Ok(api_base), Ok(repo)) => {
                config.tracker = Some(TrackerConfig { api_base, repo });
            }
            (Ok(_), Err(_)) => {
                return Err(ConfigError::MissingEnvVar("CANOPY_TRACKER_REPO".to_string()));
            }
            _ => {}
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.poll_interval.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.retention_hours == 0 {
            return Err(ConfigError::ValidationFailed(
                "retention_hours must be greater than 0".to_string(),
            ));
        }

        for (name, image) in [
            ("helper_image", &self.helper_image),
            ("odm_image", &self.odm_image),
            ("deadwood_image", &self.deadwood_image),
            ("treecover_image", &self.treecover_image),
        ] {
            if image.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{name} cannot be empty"
                )));
            }
        }

        for (name, cmd) in [
            ("geotiff", &self.toolchain.geotiff),
            ("metadata", &self.toolchain.metadata),
            ("cog", &self.toolchain.cog),
            ("thumbnail", &self.toolchain.thumbnail),
        ] {
            if cmd.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "toolchain command for '{name}' cannot be empty"
                )));
            }
        }

        Ok(())
    }

    /// Retention TTL as a `chrono` duration.
    pub fn retention_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours as i64)
    }

    /// Whether a failed container for this dataset should be kept for
    /// debugging rather than removed.
    pub fn should_retain(&self, dataset_id: i64) -> bool {
        if !self.retention_enabled {
            return false;
        }
        match &self.retention_datasets {
            Some(allowlist) => allowlist.contains(&dataset_id),
            None => true,
        }
    }
}

fn parse_env_value<T: std::str::FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_env_bool(val: &str, key: &str) -> Result<bool, ConfigError> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}

fn parse_tie_break(val: &str) -> Result<TieBreak, ConfigError> {
    match val {
        "enqueue-time" => Ok(TieBreak::EnqueueTime),
        "row-id" => Ok(TieBreak::RowId),
        other => Err(ConfigError::InvalidValue {
            key: "CANOPY_QUEUE_TIE_BREAK".to_string(),
            message: format!("expected 'enqueue-time' or 'row-id', got '{other}'"),
        }),
    }
}

fn parse_dataset_list(val: &str) -> Result<Vec<i64>, ConfigError> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>().map_err(|e| ConfigError::InvalidValue {
                key: "CANOPY_RETAIN_DATASETS".to_string(),
                message: format!("'{s}': {e}"),
            })
        })
        .collect()
}

fn split_command(val: &str) -> Vec<String> {
    val.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_empty_database_url() {
        let config = WorkerConfig {
            database_url: String::new(),
            ..Default::default()
        };
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("database_url"));
    }

    #[test]
    fn test_validation_zero_retention() {
        let config = WorkerConfig {
            retention_hours: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_empty_toolchain_command() {
        let mut config = WorkerConfig::default();
        config.toolchain.cog.clear();
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("cog"));
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "K").unwrap());
        assert!(parse_env_bool("1", "K").unwrap());
        assert!(!parse_env_bool("no", "K").unwrap());
        assert!(parse_env_bool("maybe", "K").is_err());
    }

    #[test]
    fn test_parse_dataset_list() {
        assert_eq!(parse_dataset_list("1, 2,3").unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_dataset_list("42").unwrap(), vec![42]);
        assert!(parse_dataset_list("1,x").is_err());
    }

    #[test]
    fn test_parse_tie_break() {
        assert_eq!(parse_tie_break("enqueue-time").unwrap(), TieBreak::EnqueueTime);
        assert_eq!(parse_tie_break("row-id").unwrap(), TieBreak::RowId);
        assert!(parse_tie_break("random").is_err());
    }

    #[test]
    fn test_should_retain_respects_allowlist() {
        let mut config = WorkerConfig {
            retention_enabled: true,
            ..Default::default()
        };
        assert!(config.should_retain(42));

        config.retention_datasets = Some(vec![7, 42]);
        assert!(config.should_retain(42));
        assert!(!config.should_retain(99));

        config.retention_enabled = false;
        assert!(!config.should_retain(42));
    }

    #[test]
    fn test_split_command() {
        assert_eq!(
            split_command("gdal_translate -of COG {input} {output}"),
            vec!["gdal_translate", "-of", "COG", "{input}", "{output}"]
        );
    }
}
