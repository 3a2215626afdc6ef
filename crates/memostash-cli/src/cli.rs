//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use memostash::{Config, EntryStore, LockManager, ProducerIdentity};

use crate::output;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Outputs all entries as a JSON array.
    Json,
    /// Outputs all entries as a table.
    Table,
}

/// Memostash commands.
#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// List all entries in the store.
    Inspect {
        /// The output format.
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Remove all entries of one producer.
    Uncache {
        /// The name of the producer.
        #[arg(long)]
        producer: String,

        /// The version tag of the producer.
        #[arg(long)]
        version: String,
    },

    /// Remove temporary files left behind by interrupted writers.
    ClearTmp {
        /// Only remove files older than this, as younger ones may still be written.
        #[arg(long, value_parser = humantime::parse_duration, default_value = "1h")]
        older_than: Duration,
    },
}

/// Inspects and maintains the durable store of memoized results.
#[derive(Clone, Debug, Parser)]
#[command(name = "memostash", author, version, about, long_about = None)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The store root, overriding the configuration file.
    #[arg(long, global = true, value_name = "DIR")]
    store_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config()).context("failed loading config")?;
    if let Some(store_root) = cli.store_root {
        config.store_root = store_root;
    }

    memostash::logging::init_logging(&config.logging);
    if let Some(ref statsd) = config.metrics.statsd {
        if let Err(e) = memostash::metrics::configure_statsd(
            &config.metrics.prefix,
            statsd,
            config.metrics.custom_tags.clone(),
        ) {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                "Failed to configure statsd"
            );
        }
    }

    run(&config, cli.command)
}

/// Runs a single command against the configured store.
fn run(config: &Config, command: Command) -> Result<()> {
    let store = EntryStore::open(&config.store_root).with_context(|| {
        format!("failed to open store at {}", config.store_root.display())
    })?;

    match command {
        Command::Inspect { format } => {
            let entries = store.entries().context("failed to list entries")?;
            match format {
                OutputFormat::Json => output::print_json(&entries)?,
                OutputFormat::Table => output::print_table(&entries),
            }
        }
        Command::Uncache { producer, version } => {
            let identity = ProducerIdentity::new(producer, version)?;
            let locks = LockManager::new(
                store.locks_dir(),
                config.lock_timeout,
                config.lock_poll_interval,
            );
            let removed = store
                .remove_producer(&identity, &locks)
                .with_context(|| format!("failed to uncache {identity}"))?;
            tracing::info!("Removed {removed} entries of {identity}");
        }
        Command::ClearTmp { older_than } => {
            let removed = store
                .clear_tmp(older_than)
                .context("failed to clear temporary files")?;
            tracing::info!("Removed {removed} temporary files");
        }
    }

    Ok(())
}
