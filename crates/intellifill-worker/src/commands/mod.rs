//! Subcommands

pub mod jobs;
pub mod run;
pub mod stats;
pub mod submit;

use anyhow::{Context, Result};

use intellifill_persist::{Database, SqliteConfig};
use intellifill_pipeline::{QueueKind, Runtime, RuntimeBuilder};

use crate::settings::Settings;

/// Connect to the database and wire every queue onto it
pub async fn open_runtime(settings: &Settings) -> Result<(Database, Runtime)> {
    let db = Database::connect_with(SqliteConfig::from(&settings.database))
        .await
        .context("Failed to open database")?;

    let mut builder = RuntimeBuilder::sqlite(&db)
        .with_config(settings.pipeline.clone())
        .with_gate(intellifill_llm::CallGate::new(settings.llm.gate.clone()))
        .with_embedder(settings.llm.embedder()?)
        .with_field_extractor(settings.llm.extractor()?);

    for kind in QueueKind::ALL {
        if let Some(concurrency) = settings.workers.concurrency(kind) {
            builder = builder.with_worker_config(kind, kind.worker_config().with_concurrency(concurrency));
        }
    }

    Ok((db, builder.build()))
}

/// Parse a job id argument
pub fn parse_job_id(value: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(value.trim()).with_context(|| format!("'{}' is not a job id", value))
}
