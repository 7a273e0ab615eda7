//! canopy-processor: poll-driven processing worker for drone imagery
//! datasets.
//!
//! The worker picks tasks off a priority-ordered Postgres queue and runs
//! each dataset through a fixed stage pipeline, with the heavy stages in
//! containers against a shared volume.

// Core modules
pub mod cli;
pub mod config;
pub mod docker;
pub mod error;
pub mod forensics;
pub mod pipeline;
pub mod queue;
pub mod reaper;
pub mod report;
pub mod scheduler;
pub mod stages;
pub mod status;

// Re-export commonly used error types
pub use error::{DockerError, StageError};
