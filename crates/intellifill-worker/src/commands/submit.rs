//! Submit command - enqueue a job from JSON
//!
//! Usage:
//! ```bash
//! intellifill-worker submit '{"type":"batch","batch_id":"b1","user_id":"u1","items":[]}'
//! intellifill-worker submit @job.json --priority high --delay-ms 5000
//! ```

use anyhow::{Context, Result};
use clap::Args;
use std::time::Duration;

use intellifill_pipeline::JobPayload;
use intellifill_queue::{JobOptions, Priority};

use super::open_runtime;
use crate::settings::Settings;

/// Arguments for the submit command
#[derive(Args)]
pub struct SubmitArgs {
    /// Job payload as JSON, or @path to read it from a file
    payload: String,

    /// high, normal, low or a numeric rank
    #[arg(short, long)]
    priority: Option<Priority>,

    /// Hold the job for this many milliseconds before it can run
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Total attempts including the first
    #[arg(long)]
    attempts: Option<u32>,
}

impl SubmitArgs {
    fn read_payload(&self) -> Result<JobPayload> {
        let raw = match self.payload.strip_prefix('@') {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read payload file {}", path))?,
            None => self.payload.clone(),
        };
        serde_json::from_str(&raw).context("Invalid job payload")
    }

    /// Queue defaults with the command-line overrides applied
    fn options(&self, defaults: &JobOptions) -> JobOptions {
        let mut options = defaults.clone();
        if let Some(priority) = self.priority {
            options = options.with_priority(priority);
        }
        if let Some(ms) = self.delay_ms.filter(|ms| *ms > 0) {
            options = options.with_delay(Duration::from_millis(ms));
        }
        if let Some(attempts) = self.attempts {
            options = options.with_attempts(attempts.max(1));
        }
        options
    }
}

pub async fn run(args: SubmitArgs, settings: Settings) -> Result<()> {
    let payload = args.read_payload()?;
    let (db, runtime) = open_runtime(&settings).await?;

    let queue = runtime.queue(payload.kind())?;
    let options = args.options(queue.defaults());
    let handle = runtime.submit(&payload, Some(options)).await?;

    crate::print_success(&format!("Submitted {} to {}", handle.id, queue.name()));
    println!("{}", handle.id);

    db.close().await;
    Ok(())
}
