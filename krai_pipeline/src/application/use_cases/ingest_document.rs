// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Document Ingest Use Case
//!
//! Takes a file from the outside world into the pipeline: validates the
//! upload against the security policy, hashes the bytes, resolves
//! duplicates to the existing document, creates the document record, and
//! hands the run to the stage sequencer.
//!
//! Resubmitting identical bytes never creates a second document and never
//! re-runs stages; the content hash resolves to the existing record and
//! the per-stage completion markers make every stage a no-op.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use krai_pipeline_domain::{
    ContentHash, DatabasePort, Document, DocumentId, PipelineError, ProcessingContext,
};

use crate::application::services::document_pipeline::{PipelineRunOutcome, StageSequencer};
use crate::presentation::validation::RequestValidator;

/// Outcome of one ingest request.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// A new document was created and processed
    Processed {
        document_id: DocumentId,
        run: PipelineRunOutcome,
    },
    /// Identical content already exists; nothing ran
    Duplicate { document_id: DocumentId },
}

/// Ingest boundary for local files (the CLI path) and uploaded bytes.
pub struct IngestDocument {
    port: Arc<dyn DatabasePort>,
    sequencer: Arc<StageSequencer>,
    validator: Arc<RequestValidator>,
}

impl IngestDocument {
    pub fn new(port: Arc<dyn DatabasePort>, sequencer: Arc<StageSequencer>, validator: Arc<RequestValidator>) -> Self {
        Self {
            port,
            sequencer,
            validator,
        }
    }

    /// Ingests a file from disk
    pub async fn ingest_file(
        &self,
        path: &Path,
        document_type: &str,
        language: &str,
    ) -> Result<IngestOutcome, PipelineError> {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| PipelineError::validation_error("path has no usable filename"))?
            .to_string();

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| PipelineError::validation_error(format!("cannot read '{}': {}", path.display(), e)))?;

        self.ingest_bytes(&filename, "application/pdf", &bytes, document_type, language, path)
            .await
    }

    /// Ingests already-loaded bytes (the upload path)
    pub async fn ingest_bytes(
        &self,
        filename: &str,
        declared_type: &str,
        bytes: &[u8],
        document_type: &str,
        language: &str,
        source_path: &Path,
    ) -> Result<IngestOutcome, PipelineError> {
        // The validation front door runs before any document exists
        if let Err(failure) = self.validator.validate_upload(filename, declared_type, bytes) {
            return Err(PipelineError::validation_error(format!(
                "{}: {}",
                failure.error_code.as_str(),
                failure.detail
            )));
        }

        let content_hash = ContentHash::of_bytes(bytes);

        if let Some(existing) = self.port.get_document_by_hash(&content_hash).await? {
            info!(document_id = %existing.id, filename, "duplicate content; resolving to existing document");
            return Ok(IngestOutcome::Duplicate {
                document_id: existing.id,
            });
        }

        let document = Document::new(filename, bytes.len() as u64, content_hash.clone(), document_type, language);
        let document_id = self.port.create_document(&document).await?;
        info!(%document_id, filename, size = bytes.len(), "document created");

        let mut context = ProcessingContext::new(document_id, source_path, document_type)
            .with_language(language)
            .with_file_hash(content_hash.as_str())
            .with_file_size(bytes.len() as u64);

        let run = self.sequencer.process_document(&mut context).await;
        Ok(IngestOutcome::Processed { document_id, run })
    }
}
