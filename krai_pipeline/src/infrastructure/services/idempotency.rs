// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Idempotency Checker
//!
//! Completion marker management and input hashing for pipeline stages. A
//! stage that already completed for the current input hash is skipped; a
//! stage whose input changed gets its stale marker purged before the rerun.
//!
//! ## Hash Stability
//!
//! The context hash is a SHA-256 over the key-sorted JSON serialization of
//! a fixed field subset: document id, file path, file hash, file size,
//! manufacturer, model, series, and version. Identical projections hash
//! identically across processes and runs; nothing else on the context
//! participates.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use krai_pipeline_domain::{
    CompletionMarker, DatabasePort, DocumentId, PipelineError, ProcessingContext, Stage,
};

/// Computes the stable input hash for a processing context.
///
/// Standalone so it can be used without a database handle.
pub fn compute_context_hash(context: &ProcessingContext) -> String {
    // BTreeMap keeps key order fixed regardless of insertion order.
    let mut fields = std::collections::BTreeMap::new();
    fields.insert("document_id", serde_json::json!(context.document_id().to_string()));
    fields.insert("file_path", serde_json::json!(context.file_path().display().to_string()));
    fields.insert("file_hash", serde_json::json!(context.file_hash()));
    fields.insert("file_size", serde_json::json!(context.file_size()));
    fields.insert("manufacturer", serde_json::json!(context.manufacturer()));
    fields.insert("model", serde_json::json!(context.model()));
    fields.insert("series", serde_json::json!(context.series()));
    fields.insert("version", serde_json::json!(context.version()));

    let canonical = serde_json::to_string(&fields).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Service managing idempotency for pipeline processing.
#[derive(Clone)]
pub struct IdempotencyChecker {
    port: Arc<dyn DatabasePort>,
}

impl IdempotencyChecker {
    pub fn new(port: Arc<dyn DatabasePort>) -> Self {
        Self { port }
    }

    /// Input hash for a context; delegates to [`compute_context_hash`]
    pub fn compute_data_hash(&self, context: &ProcessingContext) -> String {
        let hash = compute_context_hash(context);
        debug!(document_id = %context.document_id(), hash, "computed context data hash");
        hash
    }

    /// Looks up the completion marker for a `(document, stage)` pair.
    ///
    /// Propagates persistence errors so the caller can distinguish "no
    /// marker" from "database unreachable".
    pub async fn check_completion_marker(
        &self,
        document_id: DocumentId,
        stage: Stage,
    ) -> Result<Option<CompletionMarker>, PipelineError> {
        let marker = self.port.get_completion_marker(document_id, stage).await?;
        match &marker {
            Some(_) => debug!(%document_id, %stage, "completion marker found"),
            None => debug!(%document_id, %stage, "no completion marker"),
        }
        Ok(marker)
    }

    /// Upserts the completion marker after a successful stage run.
    ///
    /// Concurrent completions converge to one row through the store's
    /// natural-key conflict policy on `(document_id, stage)`.
    pub async fn set_completion_marker(
        &self,
        document_id: DocumentId,
        stage: Stage,
        data_hash: String,
        metadata: serde_json::Value,
    ) -> Result<(), PipelineError> {
        let marker = CompletionMarker {
            document_id,
            stage,
            data_hash,
            completed_at: chrono::Utc::now(),
            metadata,
        };
        self.port.upsert_completion_marker(&marker).await?;
        info!(%document_id, %stage, "completion marker set");
        Ok(())
    }

    /// Removes the marker so the stage re-runs. Stage-specific artifact
    /// deletion is the processor's job through its cleanup hook.
    pub async fn cleanup_old_data(&self, document_id: DocumentId, stage: Stage) -> Result<(), PipelineError> {
        match self.port.delete_completion_marker(document_id, stage).await {
            Ok(()) => {
                info!(%document_id, %stage, "cleaned up stale completion marker");
                Ok(())
            }
            Err(e) => {
                warn!(%document_id, %stage, error = %e, "failed to delete stale completion marker");
                Err(e)
            }
        }
    }
}
