//! jr - drive and inspect job execution from the command line

use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use kvstore::SqliteStorage;
use tracing::info;

use jobrunner::cli::{Cli, Commands};
use jobrunner::config::Config;
use jobrunner::runner::Runner;
use jobrunner::service::JobService;

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Worker {
            store,
            job_id,
            workers,
        } => {
            if let Some(workers) = workers {
                config.runner.max_workers = workers;
            }
            let storage = Arc::new(
                SqliteStorage::open(&store)
                    .context(format!("Failed to open store at {}", store.display()))?,
            );
            info!(job_id = %job_id, workers = config.runner.max_workers, "Starting worker pool");

            let runner = Runner::distributed(storage, config.runner.clone());
            let service = runner.service().clone();
            runner.drive_existing_job(&job_id).await?;

            let progress = service.get_progress(&job_id)?;
            println!(
                "{} {}/{} tasks completed, {} failed",
                "done:".bold(),
                progress.completed_tasks,
                progress.total_tasks,
                progress.failed_tasks
            );
        }

        Commands::Status { store, job_id } => {
            let storage = Arc::new(
                SqliteStorage::open(&store)
                    .context(format!("Failed to open store at {}", store.display()))?,
            );
            let service = JobService::new(storage);
            let progress = service.get_progress(&job_id)?;

            println!("{} {}", "job".bold(), job_id);
            println!("  state:      {}", progress.state.to_string().cyan());
            println!(
                "  interviews: {}/{} completed, {} failed",
                progress.completed_interviews, progress.total_interviews, progress.failed_interviews
            );
            println!(
                "  tasks:      {} completed, {} skipped, {} failed, {} blocked",
                progress.completed_tasks.to_string().green(),
                progress.skipped_tasks,
                progress.failed_tasks.to_string().red(),
                progress.blocked_tasks
            );
            println!(
                "              {} pending, {} ready, {} running",
                progress.pending_tasks, progress.ready_tasks, progress.running_tasks
            );
        }

        Commands::Errors { store, job_id } => {
            let storage = Arc::new(
                SqliteStorage::open(&store)
                    .context(format!("Failed to open store at {}", store.display()))?,
            );
            let service = JobService::new(storage);
            let errors = service.get_error_details(&job_id)?;

            if errors.is_empty() {
                println!("{}", "no failed tasks".green());
            }
            for error in errors {
                println!(
                    "{} {} ({}): {}",
                    error.task_id.red(),
                    error.question_name.as_deref().unwrap_or("?"),
                    error.error_kind,
                    error.error_message
                );
            }
        }
    }

    Ok(())
}
