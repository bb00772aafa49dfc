//! Layered settings: defaults, then `intellifill.toml` (or `--config`),
//! then `INTELLIFILL__*` environment variables

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use intellifill_llm::LlmConfig;
use intellifill_persist::SqliteConfig;
use intellifill_pipeline::{PipelineConfig, QueueKind};
use intellifill_queue::HealthThresholds;

const DEFAULT_FILE: &str = "intellifill";
const ENV_PREFIX: &str = "INTELLIFILL";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub wal_mode: bool,
    pub busy_timeout_secs: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        let defaults = SqliteConfig::default();
        Self {
            url: defaults.url,
            max_connections: defaults.max_connections,
            wal_mode: defaults.wal_mode,
            busy_timeout_secs: defaults.busy_timeout_secs,
        }
    }
}

impl From<&DatabaseSettings> for SqliteConfig {
    fn from(db: &DatabaseSettings) -> Self {
        SqliteConfig {
            url: db.url.clone(),
            max_connections: db.max_connections,
            wal_mode: db.wal_mode,
            busy_timeout_secs: db.busy_timeout_secs,
        }
    }
}

/// Per-queue concurrency overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub knowledge: Option<usize>,
    pub ocr: Option<usize>,
    pub document: Option<usize>,
    pub batch: Option<usize>,
}

impl WorkerSettings {
    pub fn concurrency(&self, kind: QueueKind) -> Option<usize> {
        match kind {
            QueueKind::Knowledge => self.knowledge,
            QueueKind::Ocr => self.ocr,
            QueueKind::Document => self.document,
            QueueKind::Batch => self.batch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_format: LogFormat,
    /// How long `run` waits for active jobs on shutdown
    pub shutdown_timeout_secs: u64,
    /// Finished jobs sampled for `stats`
    pub metrics_window: usize,
    pub database: DatabaseSettings,
    pub workers: WorkerSettings,
    pub pipeline: PipelineConfig,
    pub llm: LlmConfig,
    pub health: HealthThresholds,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            shutdown_timeout_secs: 30,
            metrics_window: 100,
            database: DatabaseSettings::default(),
            workers: WorkerSettings::default(),
            pipeline: PipelineConfig::default(),
            llm: LlmConfig::default(),
            health: HealthThresholds::default(),
        }
    }
}

impl Settings {
    /// Load settings; an explicit `path` must exist, the default file may not
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_FILE).required(false),
        };

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read settings")?
            .try_deserialize::<Settings>()
            .context("Invalid settings")?;

        settings.llm.validate().context("Invalid LLM settings")?;
        Ok(settings)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
