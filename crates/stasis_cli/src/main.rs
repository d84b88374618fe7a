//! Stasis CLI
//!
//! Command-line tools for the recovery files of Stasis managers.
//!
//! # Commands
//!
//! - `status` - List managers with recovery files and what their next start does
//! - `inspect` - Summarize a manager's bomb file
//! - `verify` - Check every bomb file and tmp marker in a data directory
//! - `discard-tmp` - Remove a tmp marker left by an interrupted bomb write

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Stasis recovery file tools.
#[derive(Parser)]
#[command(name = "stasis")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data directory
    #[arg(global = true, short, long, default_value = "data")]
    path: PathBuf,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List managers with recovery files
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Summarize a manager's bomb file
    Inspect {
        /// Manager persist name
        name: String,

        /// Show every pending change
        #[arg(short, long)]
        entries: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check every bomb file and tmp marker
    Verify,

    /// Remove a tmp marker left by an interrupted bomb write
    DiscardTmp {
        /// Manager persist name
        name: String,

        /// Actually delete the marker
        #[arg(long)]
        force: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Status { format } => {
            commands::status::run(&cli.path, &format)?;
        }
        Commands::Inspect {
            name,
            entries,
            format,
        } => {
            commands::inspect::run(&cli.path, &name, entries, &format)?;
        }
        Commands::Verify => {
            commands::verify::run(&cli.path)?;
        }
        Commands::DiscardTmp { name, force } => {
            commands::discard_tmp::run(&cli.path, &name, force)?;
        }
        Commands::Version => {
            println!("Stasis CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Stasis Core v{}", stasis_core::VERSION);
        }
    }

    Ok(())
}
