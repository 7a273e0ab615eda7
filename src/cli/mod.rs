//! Command-line interface for the processing worker.
//!
//! Provides the service entry points (`watch`, `run-once`) plus operator
//! commands for sweeping leaked resources, inspecting dataset status and
//! submitting tasks.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
