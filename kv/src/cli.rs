//! Command-line interface for inspecting a store file

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Inspect a kvstore SQLite database
#[derive(Debug, Parser)]
#[command(name = "kv", version, about = "Inspect a kvstore database")]
pub struct Cli {
    /// Path to the store database
    #[arg(short, long, default_value = "store.db")]
    pub store: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show key counts per surface
    Stats,

    /// Read one key
    Get {
        /// The key to read
        key: String,

        /// Read from the volatile surface instead of persistent
        #[arg(long)]
        volatile: bool,
    },

    /// List keys matching a glob pattern
    Scan {
        /// Glob-style pattern, e.g. "job:*:meta"
        pattern: String,

        /// Scan the volatile surface instead of persistent
        #[arg(long)]
        volatile: bool,
    },

    /// Show members of a set
    Members {
        /// The set key
        key: String,
    },
}
