//! Validation of provider responses
//!
//! Providers return free-form text. It is parsed into a typed response and
//! checked before use. A response that does not fit is a permanent failure.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::provider::LlmError;

/// Semantic checks applied after a response deserializes
pub trait ValidateResponse {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

impl ValidateResponse for serde_json::Value {}

/// One field found in a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedField {
    pub name: String,
    pub value: serde_json::Value,
    /// Declared type such as "email", "date" or "currency"
    #[serde(default, rename = "type")]
    pub field_type: Option<String>,
    #[serde(default = "full_confidence")]
    pub confidence: f64,
}

fn full_confidence() -> f64 {
    1.0
}

/// Field extraction response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFields {
    #[serde(default)]
    pub document_type: Option<String>,
    pub fields: Vec<ExtractedField>,
}

impl ExtractedFields {
    pub fn get(&self, name: &str) -> Option<&ExtractedField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

impl ValidateResponse for ExtractedFields {
    fn validate(&self) -> Result<(), String> {
        for (i, field) in self.fields.iter().enumerate() {
            if field.name.trim().is_empty() {
                return Err(format!("field {} has an empty name", i));
            }
            if !(0.0..=1.0).contains(&field.confidence) {
                return Err(format!(
                    "field '{}' has confidence {} outside 0..=1",
                    field.name, field.confidence
                ));
            }
        }
        Ok(())
    }
}

/// Strip a surrounding markdown code fence, if present
fn unfence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.strip_prefix("json").unwrap_or(rest);
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Parse and check a raw provider response
pub fn parse_validated<T>(raw: &str) -> Result<T, LlmError>
where
    T: DeserializeOwned + ValidateResponse,
{
    let parsed: T =
        serde_json::from_str(unfence(raw)).map_err(|e| LlmError::Validation(e.to_string()))?;
    parsed.validate().map_err(LlmError::Validation)?;
    Ok(parsed)
}
