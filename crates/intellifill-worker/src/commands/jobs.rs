//! Status and remove commands
//!
//! Usage:
//! ```bash
//! intellifill-worker status <job-id>
//! intellifill-worker status <job-id> --json
//! intellifill-worker remove <job-id>
//! ```

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use intellifill_queue::{JobState, JobStatusReport};

use super::{open_runtime, parse_job_id};
use crate::settings::Settings;

/// Arguments for commands addressing a single job
#[derive(Args)]
pub struct JobArgs {
    /// Job id
    id: String,

    /// Print the raw status as JSON
    #[arg(long)]
    json: bool,
}

pub async fn status(args: JobArgs, settings: Settings) -> Result<()> {
    let id = parse_job_id(&args.id)?;
    let (db, runtime) = open_runtime(&settings).await?;
    let report = runtime.status(id).await;
    db.close().await;
    let report = report?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

pub async fn remove(args: JobArgs, settings: Settings) -> Result<()> {
    let id = parse_job_id(&args.id)?;
    let (db, runtime) = open_runtime(&settings).await?;
    let removed = runtime.remove(id).await;
    db.close().await;

    if removed? {
        crate::print_success(&format!("Removed {}", id));
    } else {
        crate::print_warning(&format!("{} was already gone", id));
    }
    Ok(())
}

fn print_report(report: &JobStatusReport) {
    let state = match report.state {
        JobState::Completed => report.state.as_str().green(),
        JobState::Failed => report.state.as_str().red(),
        JobState::Active => report.state.as_str().cyan(),
        _ => report.state.as_str().yellow(),
    };

    println!("{} {}", "Job".bold(), report.id.to_string().bold());
    println!("  {} {}", "Queue:".dimmed(), report.queue);
    println!("  {} {}", "State:".dimmed(), state);
    println!(
        "  {} {}/{}",
        "Attempts:".dimmed(),
        report.attempts_made,
        report.max_attempts
    );
    println!("  {} {}", "Created:".dimmed(), report.created_at.to_rfc3339());
    if let Some(at) = report.processed_at {
        println!("  {} {}", "Started:".dimmed(), at.to_rfc3339());
    }
    if let Some(at) = report.finished_at {
        println!("  {} {}", "Finished:".dimmed(), at.to_rfc3339());
    }
    if let Some(reason) = &report.failed_reason {
        println!("  {} {}", "Reason:".dimmed(), reason.red());
    }
    if let Some(result) = &report.result {
        println!("  {} {}", "Result:".dimmed(), result);
    }
}
