//! Exposes the command line application.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use diskstore_service::config::Config;
use diskstore_service::store::{ClearStats, DiskStore, Value};

use crate::logging;

/// Store commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Print the value stored under KEY.
    ///
    /// Byte payloads go to stdout verbatim, everything else is printed as
    /// JSON. Exits with code 2 when there is no entry.
    Get { key: String },

    /// Store a value under KEY.
    Set {
        key: String,

        /// The value, as JSON.
        #[arg(required_unless_present = "raw", conflicts_with = "raw")]
        value: Option<String>,

        /// Store the contents of this file as a byte payload instead.
        #[arg(long, value_name = "FILE")]
        raw: Option<PathBuf>,

        /// How long the entry stays alive, e.g. "90s" or "2h 30m".
        ///
        /// Defaults to the configured ttl.
        #[arg(long, value_parser = humantime::parse_duration)]
        ttl: Option<Duration>,
    },

    /// Remove the entry stored under KEY.
    Delete { key: String },

    /// Remove all of the store's files, keeping foreign files alone.
    Clear,

    /// Print the file system location KEY maps to.
    Path { key: String },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "diskstore", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short = 'c', global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application, returning the process exit code.
pub fn execute() -> Result<i32> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    // SAFETY: We are in a single-threaded context here, the runtime is only
    // created below.
    unsafe { logging::init_logging(&config) };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("diskstore")
        .enable_all()
        .build()
        .context("failed to create the runtime")?;

    let store = DiskStore::new(config.store.clone()).context("failed to open the store")?;
    runtime.block_on(run_command(cli.command, store))
}

async fn run_command(command: Command, store: DiskStore) -> Result<i32> {
    match command {
        Command::Get { key } => {
            let Some(value) = store.get(&key).await? else {
                tracing::warn!(%key, "no entry");
                return Ok(2);
            };
            match value {
                Value::Bytes(bytes) => std::io::stdout()
                    .write_all(&bytes)
                    .context("failed writing payload to stdout")?,
                other => println!("{}", serde_json::to_string_pretty(&other.to_json())?),
            }
        }
        Command::Set { key, value, raw, ttl } => {
            let value = match raw {
                Some(path) => tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("failed to read `{}`", path.display()))?
                    .into(),
                None => {
                    // clap enforces that one of the two is present.
                    let text = value.unwrap_or_default();
                    let json = serde_json::from_str(&text)
                        .context("VALUE is not valid JSON (strings need quotes)")?;
                    Value::from_json(&json)
                }
            };
            store.set(&key, value, ttl).await?;
        }
        Command::Delete { key } => {
            if store.delete(&key).await? {
                println!("removed");
            } else {
                println!("no entry");
            }
        }
        Command::Clear => {
            let ClearStats {
                removed_files,
                removed_bytes,
                retained_files,
            } = store.clear().await?;
            println!("removed {removed_files} files ({removed_bytes} bytes), kept {retained_files} foreign files");
        }
        Command::Path { key } => {
            println!("{}", store.entry_path(&key).display());
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
