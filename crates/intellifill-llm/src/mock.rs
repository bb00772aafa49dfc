//! Deterministic providers for tests and offline runs

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::provider::{EmbeddingProvider, FieldExtractionProvider, FieldExtractionRequest, LlmError};

/// Queue of errors returned by the next calls, in order
#[derive(Debug, Default)]
struct FailureScript(Mutex<VecDeque<LlmError>>);

impl FailureScript {
    fn push(&self, error: LlmError, times: usize) {
        if let Ok(mut queue) = self.0.lock() {
            queue.extend((0..times).map(|_| error.clone()));
        }
    }

    fn next(&self) -> Option<LlmError> {
        self.0.lock().ok().and_then(|mut queue| queue.pop_front())
    }
}

/// Embeds text by hashing it, so equal inputs always get equal vectors
#[derive(Debug)]
pub struct MockEmbedder {
    dimensions: usize,
    latency: Duration,
    calls: AtomicU64,
    texts: AtomicU64,
    failures: FailureScript,
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new(32)
    }
}

impl MockEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            latency: Duration::ZERO,
            calls: AtomicU64::new(0),
            texts: AtomicU64::new(0),
            failures: FailureScript::default(),
        }
    }

    /// Simulated latency per batch
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `times` calls fail with `error`
    pub fn fail_next(&self, error: LlmError, times: usize) {
        self.failures.push(error, times);
    }

    /// Batches embedded successfully or not
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Texts embedded successfully
    pub fn texts_embedded(&self) -> u64 {
        self.texts.load(Ordering::SeqCst)
    }

    /// Unit vector derived from the SHA-256 of `text`
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut values = Vec::with_capacity(self.dimensions);
        let mut counter: u32 = 0;
        while values.len() < self.dimensions {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update(counter.to_le_bytes());
            for byte in hasher.finalize() {
                if values.len() == self.dimensions {
                    break;
                }
                values.push(byte as f32 / 127.5 - 1.0);
            }
            counter += 1;
        }

        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            values.iter_mut().for_each(|v| *v /= norm);
        }
        values
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    fn name(&self) -> &str {
        "mock-embedder"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(error) = self.failures.next() {
            return Err(error);
        }
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(LlmError::InvalidRequest("cannot embed empty text".into()));
        }

        self.texts.fetch_add(texts.len() as u64, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Reads `Label: value` lines from the text and reports them as fields
#[derive(Debug, Default)]
pub struct MockFieldExtractor {
    canned: Option<String>,
    calls: AtomicU64,
    failures: FailureScript,
}

impl MockFieldExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer with `response`, verbatim
    pub fn constant(response: impl Into<String>) -> Self {
        Self {
            canned: Some(response.into()),
            ..Self::default()
        }
    }

    pub fn fail_next(&self, error: LlmError, times: usize) {
        self.failures.push(error, times);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn scan(text: &str) -> serde_json::Value {
        let fields: Vec<serde_json::Value> = text
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(label, value)| (label.trim(), value.trim()))
            .filter(|(label, value)| {
                !label.is_empty() && !value.is_empty() && label.split_whitespace().count() <= 4
            })
            .map(|(label, value)| {
                serde_json::json!({
                    "name": label,
                    "value": value,
                    "type": guess_type(value),
                    "confidence": 0.9,
                })
            })
            .collect();
        serde_json::json!({ "document_type": "form", "fields": fields })
    }
}

fn guess_type(value: &str) -> &'static str {
    let digits = value.chars().filter(|c| c.is_ascii_digit()).count();
    if value.contains('@') {
        "email"
    } else if value.starts_with('$') {
        "currency"
    } else if (10..=12).contains(&digits) && !value.chars().any(|c| c.is_alphabetic()) {
        "phone"
    } else if digits > 0 && value.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',') {
        "number"
    } else {
        "text"
    }
}

#[async_trait]
impl FieldExtractionProvider for MockFieldExtractor {
    fn name(&self) -> &str {
        "mock-extractor"
    }

    async fn extract_fields(&self, request: &FieldExtractionRequest) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.next() {
            return Err(error);
        }
        if let Some(canned) = &self.canned {
            return Ok(canned.clone());
        }
        Ok(Self::scan(&request.text).to_string())
    }
}
