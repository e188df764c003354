//! kv - inspect a kvstore database from the command line

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};

use kvstore::cli::{Cli, Commands};
use kvstore::{SqliteStorage, Storage};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = SqliteStorage::open(&cli.store)
        .context(format!("Failed to open store at {}", cli.store.display()))?;

    match cli.command {
        Commands::Stats => {
            let persistent = storage.scan_keys_persistent("*")?.len();
            let volatile = storage.scan_keys_volatile("*")?.len();
            println!("{}", "store surfaces".bold());
            println!("  persistent keys: {persistent}");
            println!("  volatile keys:   {volatile}");
        }
        Commands::Get { key, volatile } => {
            let value = if volatile {
                storage.read_volatile(&key)?
            } else {
                storage.read_persistent(&key)?
            };
            match value {
                Some(v) => println!("{}", serde_json::to_string_pretty(&v)?),
                None => println!("{}", format!("key not found: {key}").red()),
            }
        }
        Commands::Scan { pattern, volatile } => {
            let keys = if volatile {
                storage.scan_keys_volatile(&pattern)?
            } else {
                storage.scan_keys_persistent(&pattern)?
            };
            for key in keys {
                println!("{key}");
            }
        }
        Commands::Members { key } => {
            let mut members: Vec<String> = storage.set_members(&key)?.into_iter().collect();
            members.sort();
            for member in members {
                println!("{member}");
            }
        }
    }

    Ok(())
}
