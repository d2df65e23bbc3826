// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Stage Tracker
//!
//! Persistent per-document stage state, maintained through the stage
//! transition stored procedures (`start_stage`, `update_stage_progress`,
//! `complete_stage`, `fail_stage`, `skip_stage`) and queried through the
//! progress functions and the stage statistics view.
//!
//! ## Graceful Degradation
//!
//! On a fresh install the tracking migration may not be applied yet. The
//! first `MissingFunction` error latches RPC off for the tracker's
//! lifetime: every mutator then returns success without touching the
//! database and every query returns an empty or zero value, so the
//! pipeline keeps processing documents with tracking disabled. The latch
//! is required behavior, not an optimization.
//!
//! ## Progress Normalization
//!
//! `update_progress` accepts either fractions in `(0, 1]` or percentages
//! in `[0, 100]`. Fractions are scaled up and annotated with
//! `progress_scale_adjusted=true`; every value is clamped to `[0, 100]`;
//! a missing value coerces to `0` with a warning.
//!
//! ## Event Emission
//!
//! Every state change invokes the injected broadcaster with the event
//! kind, stage, document, and new status, plus a `processor_state_change`
//! frame carrying the canonical processor name for the stage.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tracing::{error, warn};

use krai_pipeline_domain::{
    BroadcastEventKind, DatabasePort, DocumentId, EventBroadcaster, PipelineError, Stage, StageState,
    StageStatistics,
};

/// Tracks processing stages for documents.
pub struct StageTracker {
    port: Arc<dyn DatabasePort>,
    broadcaster: Option<Arc<dyn EventBroadcaster>>,
    schema_prefix: String,
    rpc_enabled: AtomicBool,
}

impl StageTracker {
    pub fn new(port: Arc<dyn DatabasePort>, schema_prefix: impl Into<String>) -> Self {
        Self {
            port,
            broadcaster: None,
            schema_prefix: schema_prefix.into(),
            rpc_enabled: AtomicBool::new(true),
        }
    }

    /// Attaches the broadcast callback invoked on every state change
    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn EventBroadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Whether RPC tracking is still active (false after degradation)
    pub fn rpc_enabled(&self) -> bool {
        self.rpc_enabled.load(Ordering::SeqCst)
    }

    fn function(&self, name: &str) -> String {
        format!("{}_core.{}", self.schema_prefix, name)
    }

    /// Latches RPC off when the failure says the function is missing.
    /// Returns true when this call disabled (or already found disabled)
    /// tracking for that reason.
    fn maybe_disable_rpc(&self, error: &PipelineError, function: &str) -> bool {
        if let PipelineError::MissingFunction(msg) = error {
            if self
                .rpc_enabled
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                warn!(
                    function,
                    reason = %msg,
                    "stage tracking RPC disabled (missing DB function); pipeline continues without DB updates. \
                     Apply migration: database/migrations/10_stage_status_tracking.sql"
                );
            }
            return true;
        }
        false
    }

    fn emit(&self, kind: BroadcastEventKind, stage: Stage, document_id: Option<DocumentId>, status: &str) {
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.stage_event(kind, stage, document_id, status);
        }
    }

    /// Marks a stage as started
    pub async fn start_stage(&self, document_id: DocumentId, stage: Stage) -> Result<(), PipelineError> {
        if !self.rpc_enabled() {
            return Ok(());
        }

        let function = self.function("start_stage");
        let params = json!({
            "p_document_id": document_id.to_string(),
            "p_stage_name": stage.as_str(),
        });

        match self.port.execute_rpc(&function, params).await {
            Ok(_) => {
                self.emit(
                    BroadcastEventKind::ProcessorStateChange,
                    stage,
                    Some(document_id),
                    "processing",
                );
                Ok(())
            }
            Err(e) if self.maybe_disable_rpc(&e, &function) => Ok(()),
            Err(e) => {
                error!(%document_id, %stage, error = %e, "error starting stage");
                Err(e)
            }
        }
    }

    /// Updates stage progress.
    ///
    /// `progress` may be a fraction in `(0, 1]` or a percentage; `None`
    /// coerces to zero.
    pub async fn update_progress(
        &self,
        document_id: DocumentId,
        stage: Stage,
        progress: Option<f64>,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), PipelineError> {
        if !self.rpc_enabled() {
            return Ok(());
        }

        let mut metadata = match metadata {
            Some(serde_json::Value::Object(map)) => map,
            Some(other) => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
            None => serde_json::Map::new(),
        };

        let (normalized, _) = Self::normalize_progress(document_id, stage, progress, &mut metadata);

        let function = self.function("update_stage_progress");
        let params = json!({
            "p_document_id": document_id.to_string(),
            "p_stage_name": stage.as_str(),
            "p_progress": normalized,
            "p_metadata": serde_json::Value::Object(metadata),
        });

        match self.port.execute_rpc(&function, params).await {
            Ok(_) => Ok(()),
            Err(e) if self.maybe_disable_rpc(&e, &function) => Ok(()),
            Err(e) => {
                error!(%document_id, %stage, error = %e, "error updating stage progress");
                Err(e)
            }
        }
    }

    /// Applies the normalization rules and annotates the metadata when a
    /// fraction was scaled. Returns `(value, scale_adjusted)`.
    fn normalize_progress(
        document_id: DocumentId,
        stage: Stage,
        progress: Option<f64>,
        metadata: &mut serde_json::Map<String, serde_json::Value>,
    ) -> (f64, bool) {
        let mut value = match progress {
            Some(value) => value,
            None => {
                warn!(%document_id, %stage, "received missing progress; defaulting to 0");
                0.0
            }
        };

        let mut adjusted = false;
        if value > 0.0 && value <= 1.0 {
            warn!(%document_id, %stage, fraction = value, "progress provided as fraction; scaling to percentage");
            value *= 100.0;
            adjusted = true;
            metadata
                .entry("progress_scale_adjusted".to_string())
                .or_insert(serde_json::Value::Bool(true));
        }

        (value.clamp(0.0, 100.0), adjusted)
    }

    /// Marks a stage as completed
    pub async fn complete_stage(
        &self,
        document_id: DocumentId,
        stage: Stage,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), PipelineError> {
        if !self.rpc_enabled() {
            return Ok(());
        }

        let function = self.function("complete_stage");
        let params = json!({
            "p_document_id": document_id.to_string(),
            "p_stage_name": stage.as_str(),
            "p_metadata": metadata.unwrap_or_else(|| json!({})),
        });

        match self.port.execute_rpc(&function, params).await {
            Ok(_) => {
                self.emit(BroadcastEventKind::StageCompleted, stage, Some(document_id), "completed");
                self.emit(BroadcastEventKind::ProcessorStateChange, stage, None, "idle");
                Ok(())
            }
            Err(e) if self.maybe_disable_rpc(&e, &function) => Ok(()),
            Err(e) => {
                error!(%document_id, %stage, error = %e, "error completing stage");
                Err(e)
            }
        }
    }

    /// Marks a stage as failed
    pub async fn fail_stage(
        &self,
        document_id: DocumentId,
        stage: Stage,
        error_message: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), PipelineError> {
        if !self.rpc_enabled() {
            return Ok(());
        }

        let function = self.function("fail_stage");
        let params = json!({
            "p_document_id": document_id.to_string(),
            "p_stage_name": stage.as_str(),
            "p_error": error_message,
            "p_metadata": metadata.unwrap_or_else(|| json!({})),
        });

        match self.port.execute_rpc(&function, params).await {
            Ok(_) => {
                self.emit(BroadcastEventKind::StageFailed, stage, Some(document_id), "failed");
                self.emit(
                    BroadcastEventKind::ProcessorStateChange,
                    stage,
                    Some(document_id),
                    "failed",
                );
                Ok(())
            }
            Err(e) if self.maybe_disable_rpc(&e, &function) => Ok(()),
            Err(e) => {
                error!(%document_id, %stage, error = %e, "error marking stage failed");
                Err(e)
            }
        }
    }

    /// Marks a stage as skipped
    pub async fn skip_stage(
        &self,
        document_id: DocumentId,
        stage: Stage,
        reason: &str,
    ) -> Result<(), PipelineError> {
        if !self.rpc_enabled() {
            return Ok(());
        }

        let function = self.function("skip_stage");
        let params = json!({
            "p_document_id": document_id.to_string(),
            "p_stage_name": stage.as_str(),
            "p_reason": reason,
        });

        match self.port.execute_rpc(&function, params).await {
            Ok(_) => Ok(()),
            Err(e) if self.maybe_disable_rpc(&e, &function) => Ok(()),
            Err(e) => {
                error!(%document_id, %stage, error = %e, "error skipping stage");
                Err(e)
            }
        }
    }

    /// Overall document progress in `[0, 100]`; zero in degraded mode
    pub async fn get_progress(&self, document_id: DocumentId) -> f64 {
        if !self.rpc_enabled() {
            return 0.0;
        }

        let function = self.function("get_document_progress");
        let params = json!({"p_document_id": document_id.to_string()});

        match self.port.execute_rpc(&function, params).await {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.get("progress").or(Some(row)))
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0),
            Err(e) => {
                if !self.maybe_disable_rpc(&e, &function) {
                    error!(%document_id, error = %e, "error getting document progress");
                }
                0.0
            }
        }
    }

    /// Current stage name, `"completed"` past the end, or `"unknown"` in
    /// degraded mode
    pub async fn get_current_stage(&self, document_id: DocumentId) -> String {
        if !self.rpc_enabled() {
            return "unknown".to_string();
        }

        let function = self.function("get_current_stage");
        let params = json!({"p_document_id": document_id.to_string()});

        match self.port.execute_rpc(&function, params).await {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.get("stage").or(Some(row)))
                .and_then(serde_json::Value::as_str)
                .unwrap_or("upload")
                .to_string(),
            Err(e) => {
                if !self.maybe_disable_rpc(&e, &function) {
                    error!(%document_id, error = %e, "error getting current stage");
                }
                "unknown".to_string()
            }
        }
    }

    /// Whether the stage's prerequisites are satisfied. Degraded mode
    /// answers true so the pipeline keeps moving.
    pub async fn can_start_stage(&self, document_id: DocumentId, stage: Stage) -> bool {
        if !self.rpc_enabled() {
            return true;
        }

        let function = self.function("can_start_stage");
        let params = json!({
            "p_document_id": document_id.to_string(),
            "p_stage_name": stage.as_str(),
        });

        match self.port.execute_rpc(&function, params).await {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.get("can_start").or(Some(row)))
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false),
            Err(e) => {
                if self.maybe_disable_rpc(&e, &function) {
                    return true;
                }
                error!(%document_id, %stage, error = %e, "error checking stage prerequisites");
                false
            }
        }
    }

    /// Complete stage status map for a document; empty in degraded mode or
    /// on error
    pub async fn get_stage_status(&self, document_id: DocumentId) -> BTreeMap<Stage, StageState> {
        match self.port.get_document(document_id).await {
            Ok(Some(document)) => document.stage_status,
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                error!(%document_id, error = %e, "error getting stage status");
                BTreeMap::new()
            }
        }
    }

    /// Per-stage execution counters from the statistics view
    pub async fn get_statistics(&self) -> BTreeMap<String, StageStatistics> {
        match self.port.stage_statistics().await {
            Ok(rows) => rows
                .into_iter()
                .map(|row| (row.stage.as_str().to_string(), row))
                .collect(),
            Err(e) => {
                error!(error = %e, "error getting stage statistics");
                BTreeMap::new()
            }
        }
    }
}

/// Guard that tracks one stage execution and records the outcome.
///
/// Starts the stage on construction and completes or fails it when the
/// owner reports the outcome. Progress updates accumulate metadata that is
/// attached to the terminal transition.
pub struct StageContext<'a> {
    tracker: &'a StageTracker,
    document_id: DocumentId,
    stage: Stage,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl<'a> StageContext<'a> {
    /// Starts the stage and returns the guard
    pub async fn enter(
        tracker: &'a StageTracker,
        document_id: DocumentId,
        stage: Stage,
    ) -> Result<StageContext<'a>, PipelineError> {
        tracker.start_stage(document_id, stage).await?;
        Ok(Self {
            tracker,
            document_id,
            stage,
            metadata: serde_json::Map::new(),
        })
    }

    /// Records a metadata entry attached to the terminal transition
    pub fn set_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
    }

    /// Updates progress mid-stage
    pub async fn update_progress(&mut self, progress: f64, metadata: Option<serde_json::Value>) {
        if let Some(serde_json::Value::Object(map)) = &metadata {
            for (key, value) in map {
                self.metadata.insert(key.clone(), value.clone());
            }
        }
        if let Err(e) = self
            .tracker
            .update_progress(self.document_id, self.stage, Some(progress), metadata)
            .await
        {
            warn!(document_id = %self.document_id, stage = %self.stage, error = %e, "progress update failed");
        }
    }

    /// Marks the stage completed with the accumulated metadata
    pub async fn complete(self) -> Result<(), PipelineError> {
        self.tracker
            .complete_stage(self.document_id, self.stage, Some(serde_json::Value::Object(self.metadata)))
            .await
    }

    /// Marks the stage failed with the accumulated metadata
    pub async fn fail(self, error_message: &str) -> Result<(), PipelineError> {
        self.tracker
            .fail_stage(
                self.document_id,
                self.stage,
                error_message,
                Some(serde_json::Value::Object(self.metadata)),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fractions_scale_to_percentages_with_annotation() {
        let mut metadata = serde_json::Map::new();
        let (value, adjusted) =
            StageTracker::normalize_progress(DocumentId::new(), Stage::TextExtraction, Some(0.75), &mut metadata);
        assert_eq!(value, 75.0);
        assert!(adjusted);
        assert_eq!(metadata.get("progress_scale_adjusted"), Some(&serde_json::Value::Bool(true)));
    }

    #[test]
    fn percentages_pass_through_and_clamp() {
        let mut metadata = serde_json::Map::new();
        let (value, adjusted) =
            StageTracker::normalize_progress(DocumentId::new(), Stage::TextExtraction, Some(75.0), &mut metadata);
        assert_eq!(value, 75.0);
        assert!(!adjusted);
        assert!(metadata.is_empty());

        let (clamped, _) =
            StageTracker::normalize_progress(DocumentId::new(), Stage::TextExtraction, Some(250.0), &mut metadata);
        assert_eq!(clamped, 100.0);

        let (negative, _) =
            StageTracker::normalize_progress(DocumentId::new(), Stage::TextExtraction, Some(-5.0), &mut metadata);
        assert_eq!(negative, 0.0);
    }

    #[test]
    fn missing_progress_coerces_to_zero() {
        let mut metadata = serde_json::Map::new();
        let (value, adjusted) =
            StageTracker::normalize_progress(DocumentId::new(), Stage::Embedding, None, &mut metadata);
        assert_eq!(value, 0.0);
        assert!(!adjusted);
    }
}
