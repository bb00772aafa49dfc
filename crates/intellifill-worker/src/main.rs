//! IntelliFill worker - queue workers and job administration
//!
//! # Usage
//!
//! ```bash
//! # Run the workers for every queue until Ctrl+C / SIGTERM
//! intellifill-worker run
//!
//! # Submit a job; the payload's "type" picks the queue
//! intellifill-worker submit '{"type":"ocr","document_id":"d1","user_id":"u1","file_path":"scan.txt","mime_type":"text/plain"}'
//!
//! # Inspect or cancel a job
//! intellifill-worker status 6f1c...
//! intellifill-worker remove 6f1c...
//!
//! # Queue counts, timings and health
//! intellifill-worker stats --prometheus
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

mod commands;
mod settings;

use commands::{jobs, run, stats, submit};
use settings::{LogFormat, Settings};

/// IntelliFill document processing worker
#[derive(Parser)]
#[command(
    name = "intellifill-worker",
    version,
    about = "IntelliFill worker - background document processing",
    long_about = "Runs the knowledge, OCR, document and batch queues and\n\
                  administers their jobs from the command line."
)]
struct Cli {
    /// Settings file (default: ./intellifill.toml if present)
    #[arg(short, long, global = true, env = "INTELLIFILL_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run workers for all queues
    #[command(name = "run")]
    Run(run::RunArgs),

    /// Submit a job
    #[command(name = "submit")]
    Submit(submit::SubmitArgs),

    /// Show a job's status
    #[command(name = "status")]
    Status(jobs::JobArgs),

    /// Remove a waiting or delayed job
    #[command(name = "remove")]
    Remove(jobs::JobArgs),

    /// Queue metrics and health
    #[command(name = "stats")]
    Stats(stats::StatsArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    setup_logging(cli.verbose, settings.log_format);

    match cli.command {
        Commands::Run(args) => run::run(args, settings).await,
        Commands::Submit(args) => submit::run(args, settings).await,
        Commands::Status(args) => jobs::status(args, settings).await,
        Commands::Remove(args) => jobs::remove(args, settings).await,
        Commands::Stats(args) => stats::run(args, settings).await,
    }
}

/// Setup logging; `RUST_LOG` wins over `-v`
fn setup_logging(verbosity: u8, format: LogFormat) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "info,intellifill=debug",
        1 => "debug",
        _ => "trace",
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(true);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Print a success message with a checkmark
pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".yellow().bold(), msg);
}
