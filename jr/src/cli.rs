//! Command-line interface definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Distributed job-execution engine for large batches of LLM calls
#[derive(Debug, Parser)]
#[command(name = "jr", version, about)]
pub struct Cli {
    /// Path to a config file (defaults to .jobrunner.yml lookup chain)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a worker pool against a shared store, driving one job
    Worker {
        /// Path to the shared SQLite store
        #[arg(short, long)]
        store: PathBuf,

        /// The job to execute
        #[arg(short, long)]
        job_id: String,

        /// Worker pool size (overrides config)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Print a progress snapshot for a job
    Status {
        /// Path to the shared SQLite store
        #[arg(short, long)]
        store: PathBuf,

        /// The job to inspect
        #[arg(short, long)]
        job_id: String,
    },

    /// List failed tasks for a job
    Errors {
        /// Path to the shared SQLite store
        #[arg(short, long)]
        store: PathBuf,

        /// The job to inspect
        #[arg(short, long)]
        job_id: String,
    },
}
