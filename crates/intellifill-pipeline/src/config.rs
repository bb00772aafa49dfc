//! Pipeline tuning

use serde::{Deserialize, Serialize};
use std::env;

use crate::chunking::ChunkerConfig;
use crate::field_mapping::MappingConfig;
use crate::memory_guard::MemoryGuardConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub chunking: ChunkerConfig,
    /// Chunks embedded per provider call and per checkpoint write
    pub embedding_batch_size: usize,
    /// Chunks written per store transaction
    pub storage_batch_size: usize,
    pub memory: MemoryGuardConfig,
    pub mapping: MappingConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkerConfig::default(),
            embedding_batch_size: 50,
            storage_batch_size: 100,
            memory: MemoryGuardConfig::default(),
            mapping: MappingConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

impl PipelineConfig {
    /// Overlay `CHUNK_MAX_CHARS`, `CHUNK_OVERLAP_CHARS`, `EMBEDDING_BATCH_SIZE`,
    /// `STORAGE_BATCH_SIZE` and `MEMORY_THRESHOLD_MB` on the defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse("CHUNK_MAX_CHARS") {
            config.chunking.max_chars = v;
        }
        if let Some(v) = env_parse("CHUNK_OVERLAP_CHARS") {
            config.chunking.overlap_chars = v;
        }
        if let Some(v) = env_parse::<usize>("EMBEDDING_BATCH_SIZE") {
            config.embedding_batch_size = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("STORAGE_BATCH_SIZE") {
            config.storage_batch_size = v.max(1);
        }
        if let Some(v) = env_parse("MEMORY_THRESHOLD_MB") {
            config.memory.threshold_mb = v;
        }
        config
    }

    pub fn with_embedding_batch_size(mut self, size: usize) -> Self {
        self.embedding_batch_size = size.max(1);
        self
    }

    pub fn with_chunking(mut self, chunking: ChunkerConfig) -> Self {
        self.chunking = chunking;
        self
    }
}
