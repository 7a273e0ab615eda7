//! CLI command definitions for the processing worker.
//!
//! The worker is poll-driven: `watch` is the long-running service mode,
//! `run-once` drains whatever is runnable and exits, and the remaining
//! commands are operator tools for the same database and daemon.

use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::docker::{ContainerOrchestrator, DockerClient};
use crate::forensics::ForensicsCollector;
use crate::pipeline::{PipelineExecutor, ToolchainBackend};
use crate::queue::{PgTaskQueue, TaskQueue};
use crate::reaper::ResourceReaper;
use crate::report::{FailureReporter, LogReporter, StaticToken, TrackerReporter};
use crate::scheduler::Scheduler;
use crate::stages::{StageKind, PIPELINE_ORDER};
use crate::status::{PgStatusStore, StatusStore};

/// Drone imagery processing worker.
#[derive(Parser)]
#[command(name = "canopy-processor")]
#[command(about = "Poll-driven processing worker for drone imagery datasets")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Sweep leftovers, then process queued tasks until the queue is empty.
    #[command(name = "run-once")]
    RunOnce(RunArgs),

    /// Sweep leftovers, then poll the queue forever.
    Watch(RunArgs),

    /// Only sweep leaked containers and volumes, then exit.
    Reap,

    /// Print the processing status of a dataset.
    Status(StatusArgs),

    /// Submit (or re-submit) a dataset for processing.
    Submit(SubmitArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Skip the startup resource sweep.
    #[arg(long)]
    pub no_reap: bool,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Dataset to inspect.
    pub dataset_id: i64,

    /// How many recent error log lines to print.
    #[arg(long, default_value = "5")]
    pub errors: i64,
}

#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Dataset to process.
    pub dataset_id: i64,

    /// Comma-separated stages to run (default: the full pipeline).
    #[arg(long)]
    pub stages: Option<String>,

    /// Task priority; higher runs first.
    #[arg(short, long, default_value = "0")]
    pub priority: i16,

    /// Submitting user id.
    #[arg(long)]
    pub user_id: Option<Uuid>,
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Everything a running worker needs, wired against Postgres and the local
/// Docker daemon.
struct Worker {
    config: Arc<WorkerConfig>,
    status: Arc<dyn StatusStore>,
    scheduler: Scheduler,
    reaper: ResourceReaper,
}

async fn build_worker(config: WorkerConfig) -> anyhow::Result<Worker> {
    let config = Arc::new(config);

    let pg_status = PgStatusStore::connect(&config.database_url).await?;
    pg_status.ensure_schema().await?;
    let pg_queue = PgTaskQueue::from_pool(pg_status.pool().clone(), config.tie_break);
    pg_queue.ensure_schema().await?;

    let status: Arc<dyn StatusStore> = Arc::new(pg_status);
    let queue: Arc<dyn TaskQueue> = Arc::new(pg_queue);

    let docker = DockerClient::new()?;
    let forensics = Arc::new(ForensicsCollector::new(
        config.debug_bundle_dir.clone(),
        status.clone(),
    ));
    let launcher = Arc::new(ContainerOrchestrator::new(
        docker.clone(),
        config.helper_image.clone(),
        forensics,
    ));
    let backend = Arc::new(ToolchainBackend::new(config.toolchain.clone()));
    let reporter = build_reporter(&config);

    let executor = Arc::new(PipelineExecutor::new(
        config.clone(),
        status.clone(),
        launcher,
        backend,
        reporter.clone(),
    ));
    let scheduler = Scheduler::new(queue, status.clone(), executor, reporter);
    let reaper = ResourceReaper::new(docker, config.retention_ttl());

    Ok(Worker {
        config,
        status,
        scheduler,
        reaper,
    })
}

fn build_reporter(config: &WorkerConfig) -> Arc<dyn FailureReporter> {
    let Some(tracker) = &config.tracker else {
        return Arc::new(LogReporter);
    };
    match std::env::var("CANOPY_TRACKER_TOKEN") {
        Ok(token) => Arc::new(TrackerReporter::new(
            tracker.api_base.clone(),
            tracker.repo.clone(),
            Arc::new(StaticToken::new(token)),
        )),
        Err(_) => {
            warn!("CANOPY_TRACKER_TOKEN not set, tracker reporting disabled");
            Arc::new(LogReporter)
        }
    }
}

pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = WorkerConfig::from_env()?;
    let worker = build_worker(config).await?;

    match cli.command {
        Commands::RunOnce(args) => {
            if !args.no_reap {
                worker.reaper.sweep().await?;
            }
            let cycles = worker.scheduler.drain().await?;
            info!(cycles, "Queue drained");
        }
        Commands::Watch(args) => {
            if !args.no_reap {
                worker.reaper.sweep().await?;
            }
            worker.scheduler.watch(worker.config.poll_interval).await;
        }
        Commands::Reap => {
            let report = worker.reaper.sweep().await?;
            println!(
                "removed {} containers, {} volumes ({} kept)",
                report.containers_removed, report.volumes_removed, report.kept
            );
        }
        Commands::Status(args) => {
            print_status(&worker, &args).await?;
        }
        Commands::Submit(args) => {
            let stages = match &args.stages {
                Some(list) => parse_stage_list(list)?,
                None => PIPELINE_ORDER.to_vec(),
            };
            let user_id = args.user_id.unwrap_or_else(Uuid::nil);
            let task = worker
                .scheduler
                .submit(args.dataset_id, user_id, stages, args.priority)
                .await?;
            println!(
                "submitted task {} for dataset {} ({} stages, priority {})",
                task.id,
                task.dataset_id,
                task.task_types.len(),
                task.priority
            );
        }
    }
    Ok(())
}

async fn print_status(worker: &Worker, args: &StatusArgs) -> anyhow::Result<()> {
    let Some(status) = worker.status.get(args.dataset_id).await? else {
        println!("dataset {} has no status row", args.dataset_id);
        return Ok(());
    };

    println!("dataset {}", status.dataset_id);
    println!("  current:  {}", status.current_status.as_str());
    println!("  uploaded: {}", status.is_upload_done);
    for stage in PIPELINE_ORDER {
        println!("  {:<22} {}", stage.as_str(), status.is_done(stage));
    }
    if status.has_error {
        println!(
            "  error: {}",
            status.error_message.as_deref().unwrap_or("(no message)")
        );
    }

    let errors = worker
        .status
        .recent_errors(args.dataset_id, args.errors)
        .await?;
    if !errors.is_empty() {
        println!("recent errors:");
        for entry in errors {
            println!(
                "  {} {}",
                entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                entry.message
            );
        }
    }
    Ok(())
}

fn parse_stage_list(list: &str) -> anyhow::Result<Vec<StageKind>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<StageKind>().map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stage_list() {
        let stages = parse_stage_list("metadata, cog,thumbnail").unwrap();
        assert_eq!(
            stages,
            vec![StageKind::Metadata, StageKind::Cog, StageKind::Thumbnail]
        );
    }

    #[test]
    fn test_parse_stage_list_rejects_unknown() {
        assert!(parse_stage_list("metadata,sharpen").is_err());
    }
}
