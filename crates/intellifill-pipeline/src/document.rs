//! Document jobs: extract text, pull structured fields, map them to a form

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use intellifill_llm::{CallGate, ExtractedField, ExtractedFields, FieldExtractionProvider, FieldExtractionRequest};
use intellifill_persist::{DocumentStore, StatusUpdate};
use intellifill_queue::{JobContext, JobError, ProcessingStage, Processor};

use crate::error::staged;
use crate::extract::{ExtractionRequest, Extractor};
use crate::field_mapping::{FieldMapper, FieldMapping};
use crate::payload::{FormField, JobPayload, QueueKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentOutcome {
    pub document_id: String,
    pub document_type: Option<String>,
    pub fields: Vec<ExtractedField>,
    pub mappings: Vec<FieldMapping>,
}

/// One document's trip through extraction and field mapping
pub struct DocumentFlow {
    documents: Arc<dyn DocumentStore>,
    extractor: Arc<dyn Extractor>,
    fields: Arc<dyn FieldExtractionProvider>,
    gate: CallGate,
    mapper: FieldMapper,
}

/// What a single document run needs to know
#[derive(Debug, Clone, Copy)]
pub struct DocumentTarget<'a> {
    pub document_id: &'a str,
    pub user_id: &'a str,
    pub file_path: &'a str,
    pub mime_type: &'a str,
    pub form_fields: &'a [FormField],
}

impl DocumentFlow {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        extractor: Arc<dyn Extractor>,
        fields: Arc<dyn FieldExtractionProvider>,
        gate: CallGate,
    ) -> Self {
        Self {
            documents,
            extractor,
            fields,
            gate,
            mapper: FieldMapper::default(),
        }
    }

    pub fn with_mapper(mut self, mapper: FieldMapper) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    pub async fn run(&self, target: DocumentTarget<'_>) -> Result<DocumentOutcome, JobError> {
        self.documents
            .set_status(target.document_id, target.user_id, StatusUpdate::processing())
            .await
            .map_err(staged("status"))?;

        let extracted = self
            .extractor
            .extract(&ExtractionRequest::new(target.file_path, target.mime_type))
            .await
            .map_err(staged("extraction"))?;

        let hints = target.form_fields.iter().map(|f| f.name.clone()).collect();
        let request = FieldExtractionRequest::new(extracted.text).with_hints(hints);
        let ExtractedFields {
            document_type,
            fields,
        } = self
            .gate
            .call_validated(self.fields.extract_fields(&request))
            .await
            .map_err(staged("field_extraction"))?;
        debug!(
            document_id = %target.document_id,
            provider = self.fields.name(),
            fields = fields.len(),
            "Fields extracted"
        );

        let mappings = if target.form_fields.is_empty() {
            Vec::new()
        } else {
            self.mapper.map(&fields, target.form_fields)
        };

        let outcome = DocumentOutcome {
            document_id: target.document_id.to_string(),
            document_type,
            fields,
            mappings,
        };
        let value = serde_json::to_value(&outcome)?;
        self.documents
            .set_status(target.document_id, target.user_id, StatusUpdate::completed(value))
            .await
            .map_err(staged("status"))?;

        info!(
            document_id = %target.document_id,
            fields = outcome.fields.len(),
            mapped = outcome.mappings.len(),
            "Document processed"
        );
        Ok(outcome)
    }
}

pub struct DocumentProcessor {
    flow: Arc<DocumentFlow>,
}

impl DocumentProcessor {
    pub fn new(flow: Arc<DocumentFlow>) -> Self {
        Self { flow }
    }
}

#[async_trait]
impl Processor for DocumentProcessor {
    async fn process(&self, ctx: JobContext) -> Result<serde_json::Value, JobError> {
        let job = match ctx.payload::<JobPayload>()? {
            JobPayload::Document(job) => job,
            other => return Err(other.misrouted(QueueKind::Document)),
        };

        ctx.progress
            .report(ProcessingStage::Extraction, 10, "Processing document")
            .await;
        let outcome = self
            .flow
            .run(DocumentTarget {
                document_id: &job.document_id,
                user_id: &job.user_id,
                file_path: &job.file_path,
                mime_type: &job.mime_type,
                form_fields: &job.form_fields,
            })
            .await?;
        ctx.progress
            .report(ProcessingStage::Completed, 100, "Document processed")
            .await;

        Ok(serde_json::to_value(outcome)?)
    }
}
