//! Outbox CLI
//!
//! Command-line tools for inspecting and repairing an outbox queue log.
//!
//! # Commands
//!
//! - `inspect` - Queue counts by status and priority
//! - `list` - Active operations in dispatch order
//! - `dead-letters` - Operations that failed permanently
//! - `retry` / `cancel` / `purge-dead` - Queue repair
//! - `compact` - Rewrite the log down to live records
//! - `verify` - Check log framing and checksums

mod commands;

use clap::{Parser, Subcommand};
use commands::{CliError, OutputFormat};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Outbox queue maintenance tools.
#[derive(Parser)]
#[command(name = "outbox")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the queue log file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display queue counts by status and priority
    Inspect {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List active operations in dispatch order
    List {
        /// Only show operations for this entity type
        #[arg(short, long)]
        entity_type: Option<String>,

        /// Maximum number of operations to show
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List operations that failed permanently
    DeadLetters {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Move a dead letter back onto the queue
    Retry {
        /// Operation id
        id: String,
    },

    /// Remove a pending operation from the queue
    Cancel {
        /// Operation id
        id: String,
    },

    /// Delete every dead letter
    PurgeDead,

    /// Rewrite the log down to its live records
    Compact {
        /// Only report the current size
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Verify log framing and checksums
    Verify,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let path = || cli.path.clone().ok_or(CliError::MissingPath);

    match cli.command {
        Commands::Inspect { format } => commands::inspect::run(&path()?, format)?,
        Commands::List {
            entity_type,
            limit,
            format,
        } => commands::list::run(&path()?, entity_type.as_deref(), limit, format)?,
        Commands::DeadLetters { format } => commands::list::run_dead(&path()?, format)?,
        Commands::Retry { id } => commands::repair::retry(&path()?, &id)?,
        Commands::Cancel { id } => commands::repair::cancel(&path()?, &id)?,
        Commands::PurgeDead => commands::repair::purge(&path()?)?,
        Commands::Compact { dry_run } => commands::compact::run(&path()?, dry_run)?,
        Commands::Verify => commands::verify::run(&path()?)?,
        Commands::Version => {
            println!("outbox {}", env!("CARGO_PKG_VERSION"));
            println!("Outbox queue maintenance tools");
        }
    }

    Ok(())
}
