//! sessiontxn CLI
//!
//! Command-line tools for session transaction data directories.
//!
//! # Commands
//!
//! - `inspect` - List session transaction records and oplog metadata
//! - `dump-oplog` - Dump oplog entries, or one session's statement chain
//! - `verify` - Check both logs and every session's history
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use sessiontxn_core::CoreError;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Exit code used when the data shows a statement executed twice.
const EXIT_UNRECOVERABLE: u8 = 2;

/// Session transaction inspection tools.
#[derive(Parser)]
#[command(name = "sessiontxn")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data directory
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
    /// List session transaction records and oplog metadata
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump oplog entries
    DumpOplog {
        /// Maximum number of entries to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only walk the statement chain of sessions with this UUID
        #[arg(short, long)]
        session: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify both logs and every session's statement history
    Verify,

    /// Show version information
    Version,
}

fn main() -> ExitCode {
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

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(core) = e.downcast_ref::<CoreError>() {
                if core.is_unrecoverable() {
                    error!(error = %core, "data directory is inconsistent");
                    eprintln!("fatal: {core}");
                    return ExitCode::from(EXIT_UNRECOVERABLE);
                }
            }
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Data directory path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::DumpOplog {
            limit,
            session,
            format,
        } => {
            let path = cli.path.ok_or("Data directory path required for dump-oplog")?;
            commands::dump_oplog::run(&path, limit, session.as_deref(), &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Data directory path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Version => {
            println!("sessiontxn CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("sessiontxn core v{}", sessiontxn_core::VERSION);
        }
    }
    Ok(())
}
