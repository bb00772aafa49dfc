//! Text extraction from uploaded files
//!
//! Real OCR and PDF engines plug in behind [`Extractor`]. The built-in
//! [`PlainTextExtractor`] handles text-based formats directly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::PipelineError;

/// Page separator used by text exports of paged documents
const FORM_FEED: char = '\u{0C}';

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub path: PathBuf,
    pub mime_type: String,
    /// OCR language hint, e.g. "eng" or "ara"
    pub language: Option<String>,
}

impl ExtractionRequest {
    pub fn new(path: impl AsRef<Path>, mime_type: impl Into<String>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            mime_type: mime_type.into(),
            language: None,
        }
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedText {
    pub text: String,
    pub page_count: u32,
    /// Engine confidence, 0.0 to 1.0
    pub confidence: f64,
}

#[async_trait]
pub trait Extractor: Send + Sync + std::fmt::Debug {
    fn supports(&self, mime_type: &str) -> bool;

    async fn extract(&self, request: &ExtractionRequest) -> Result<ExtractedText, PipelineError>;
}

/// Reads plain text, markdown, CSV and JSON files
#[derive(Debug, Default, Clone)]
pub struct PlainTextExtractor;

impl PlainTextExtractor {
    const SUPPORTED: [&'static str; 5] = [
        "text/plain",
        "text/markdown",
        "text/csv",
        "application/json",
        "text/x-markdown",
    ];

    /// Flatten JSON into `path: value` lines
    fn flatten_json(value: &serde_json::Value, prefix: &str, out: &mut Vec<String>) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, v) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", prefix, key)
                    };
                    Self::flatten_json(v, &path, out);
                }
            }
            serde_json::Value::Array(items) => {
                for (i, v) in items.iter().enumerate() {
                    Self::flatten_json(v, &format!("{}[{}]", prefix, i), out);
                }
            }
            serde_json::Value::Null => {}
            serde_json::Value::String(s) => out.push(format!("{}: {}", prefix, s)),
            other => out.push(format!("{}: {}", prefix, other)),
        }
    }
}

#[async_trait]
impl Extractor for PlainTextExtractor {
    fn supports(&self, mime_type: &str) -> bool {
        Self::SUPPORTED.contains(&mime_type)
    }

    async fn extract(&self, request: &ExtractionRequest) -> Result<ExtractedText, PipelineError> {
        if !self.supports(&request.mime_type) {
            return Err(PipelineError::UnsupportedType(request.mime_type.clone()));
        }

        let raw = match tokio::fs::read_to_string(&request.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::FileNotFound(request.path.display().to_string()));
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Err(PipelineError::UnsupportedType(format!(
                    "{} (not valid UTF-8)",
                    request.mime_type
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let text = match request.mime_type.as_str() {
            "application/json" => {
                let value: serde_json::Value = serde_json::from_str(&raw)
                    .map_err(|e| PipelineError::InvalidPayload(format!("malformed JSON: {}", e)))?;
                let mut lines = Vec::new();
                Self::flatten_json(&value, "", &mut lines);
                lines.join("\n")
            }
            "text/csv" => raw
                .lines()
                .map(|line| line.split(',').map(str::trim).collect::<Vec<_>>().join(" | "))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => raw,
        };

        let page_count = text.split(FORM_FEED).count() as u32;
        debug!(
            path = %request.path.display(),
            chars = text.len(),
            pages = page_count,
            "Extracted text"
        );

        Ok(ExtractedText {
            text,
            page_count,
            confidence: 1.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plain_text_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, "page one\u{0C}page two").unwrap();

        let extracted = PlainTextExtractor
            .extract(&ExtractionRequest::new(&path, "text/plain"))
            .await
            .unwrap();
        assert_eq!(extracted.page_count, 2);
        assert!(extracted.text.starts_with("page one"));
    }

    #[tokio::test]
    async fn test_json_is_flattened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, r#"{"name":"Ada","address":{"city":"Dubai"},"tags":["a"]}"#).unwrap();

        let extracted = PlainTextExtractor
            .extract(&ExtractionRequest::new(&path, "application/json"))
            .await
            .unwrap();
        assert!(extracted.text.contains("name: Ada"));
        assert!(extracted.text.contains("address.city: Dubai"));
        assert!(extracted.text.contains("tags[0]: a"));
    }

    #[tokio::test]
    async fn test_missing_and_unsupported() {
        let missing = PlainTextExtractor
            .extract(&ExtractionRequest::new("/nonexistent/file.txt", "text/plain"))
            .await;
        assert!(matches!(missing, Err(PipelineError::FileNotFound(_))));

        let unsupported = PlainTextExtractor
            .extract(&ExtractionRequest::new("/tmp/scan.png", "image/png"))
            .await;
        assert!(matches!(unsupported, Err(PipelineError::UnsupportedType(_))));
    }
}
