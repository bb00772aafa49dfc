//! Provider configuration
//!
//! Only the deterministic mock providers ship with this crate. Real clients
//! implement the provider traits elsewhere and are injected at startup.

use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;

use crate::gate::GateConfig;
use crate::mock::{MockEmbedder, MockFieldExtractor};
use crate::provider::{EmbeddingProvider, FieldExtractionProvider};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name (env: LLM_PROVIDER)
    pub provider: String,
    /// Embedding model (env: EMBEDDING_MODEL)
    pub embedding_model: String,
    /// Embedding vector size (env: EMBEDDING_DIMENSIONS)
    pub embedding_dimensions: usize,
    /// API key for hosted providers (env: LLM_API_KEY)
    pub api_key: Option<String>,
    pub gate: GateConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            embedding_model: "mock-embedding".to_string(),
            embedding_dimensions: 768,
            api_key: None,
            gate: GateConfig::default(),
        }
    }
}

impl LlmConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            provider: env::var("LLM_PROVIDER").unwrap_or(defaults.provider),
            embedding_model: env::var("EMBEDDING_MODEL").unwrap_or(defaults.embedding_model),
            embedding_dimensions: env::var("EMBEDDING_DIMENSIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.embedding_dimensions),
            api_key: env::var("LLM_API_KEY").ok(),
            gate: GateConfig::from_env(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding_dimensions == 0 {
            return Err(ConfigError::Invalid("embedding_dimensions must be > 0".into()));
        }
        if self.gate.permits == 0 {
            return Err(ConfigError::Invalid("gate.permits must be > 0".into()));
        }
        if self.provider != "mock" && self.api_key.is_none() {
            return Err(ConfigError::MissingEnvVar("LLM_API_KEY".into()));
        }
        Ok(())
    }

    /// Build the configured embedding provider
    pub fn embedder(&self) -> Result<Arc<dyn EmbeddingProvider>, ConfigError> {
        self.validate()?;
        match self.provider.as_str() {
            "mock" => Ok(Arc::new(MockEmbedder::new(self.embedding_dimensions))),
            other => Err(ConfigError::Invalid(format!(
                "no built-in embedding provider '{}'",
                other
            ))),
        }
    }

    /// Build the configured field extraction provider
    pub fn extractor(&self) -> Result<Arc<dyn FieldExtractionProvider>, ConfigError> {
        self.validate()?;
        match self.provider.as_str() {
            "mock" => Ok(Arc::new(MockFieldExtractor::new())),
            other => Err(ConfigError::Invalid(format!(
                "no built-in extraction provider '{}'",
                other
            ))),
        }
    }
}
