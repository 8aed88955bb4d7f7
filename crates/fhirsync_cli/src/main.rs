//! fhirsync CLI
//!
//! Command-line tools for the sync state a device keeps on disk.
//!
//! # Commands
//!
//! - `status` - Display watermarks and the current sync lease
//! - `reset-watermark` - Forget watermarks to force a full download
//! - `lease` - Show or break the sync lease

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// fhirsync command-line sync state tools.
#[derive(Parser)]
#[command(name = "fhirsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the sync state directory
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
    /// Display watermarks and the current sync lease
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Forget watermarks so the next pass downloads everything again
    ResetWatermark {
        /// Resource types to reset
        resource_types: Vec<String>,

        /// Reset every resource type
        #[arg(short, long)]
        all: bool,
    },

    /// Show the sync lease
    Lease {
        /// Remove the lease whoever holds it
        #[arg(short, long = "break")]
        break_lease: bool,
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
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Status { format } => {
            let path = cli.path.ok_or("State path required for status")?;
            commands::status::run(&path, &format)?;
        }
        Commands::ResetWatermark {
            resource_types,
            all,
        } => {
            let path = cli.path.ok_or("State path required for reset-watermark")?;
            if !all && resource_types.is_empty() {
                return Err("Name at least one resource type or pass --all".into());
            }
            commands::reset::run(&path, &resource_types, all)?;
        }
        Commands::Lease { break_lease } => {
            let path = cli.path.ok_or("State path required for lease")?;
            commands::lease::run(&path, break_lease)?;
        }
        Commands::Version => {
            println!("fhirsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
