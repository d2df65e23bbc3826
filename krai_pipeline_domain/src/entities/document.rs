// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Document Aggregate
//!
//! A document is the unit of work for the whole pipeline. Its identity and
//! content hash are immutable; its processing status and per-stage status
//! map are mutated only by the pipeline core (stage tracker procedures on
//! the persistence side, this aggregate in memory).
//!
//! ## Invariants
//!
//! - `content_hash` uniquely identifies a document; two submissions with the
//!   same bytes resolve to the same document
//! - stage progress stays in `[0, 100]`
//! - once a stage is `completed` or `skipped` it is terminal for the current
//!   input hash
//! - a stage is never `processing` on two workers at once (enforced by the
//!   advisory lock, not by this struct)

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value_objects::{ContentHash, DocumentId, Stage};
use crate::PipelineError;

/// Document-level processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::InProgress => "in_progress",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses admit no further pipeline work
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingStatus::Completed | ProcessingStatus::Failed | ProcessingStatus::Cancelled
        )
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "in_progress" => Ok(ProcessingStatus::InProgress),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            "cancelled" => Ok(ProcessingStatus::Cancelled),
            other => Err(PipelineError::validation_error(format!(
                "unknown processing status '{}'",
                other
            ))),
        }
    }
}

/// Per-stage status within a document's stage map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Processing => "processing",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
        }
    }

    /// Completed and skipped stages satisfy prerequisite checks
    pub fn satisfies_prerequisite(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Skipped)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The tracked state of one stage for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageStatus,
    pub progress_percent: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl StageState {
    pub fn pending() -> Self {
        Self {
            status: StageStatus::Pending,
            progress_percent: 0.0,
            started_at: None,
            completed_at: None,
            error: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Seconds between start and completion, when both are known
    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

impl Default for StageState {
    fn default() -> Self {
        Self::pending()
    }
}

/// A unit of work moving through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub filename: String,
    pub file_size: u64,
    pub content_hash: ContentHash,
    pub document_type: String,
    pub language: String,
    pub processing_status: ProcessingStatus,
    /// Stage name -> tracked state. BTreeMap keeps the serialized JSONB
    /// deterministic.
    #[serde(default)]
    pub stage_status: BTreeMap<Stage, StageState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Creates a new pending document
    pub fn new(
        filename: impl Into<String>,
        file_size: u64,
        content_hash: ContentHash,
        document_type: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DocumentId::new(),
            filename: filename.into(),
            file_size,
            content_hash,
            document_type: document_type.into(),
            language: language.into(),
            processing_status: ProcessingStatus::Pending,
            stage_status: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Current state of a stage, defaulting to pending when untracked
    pub fn stage_state(&self, stage: Stage) -> StageState {
        self.stage_status.get(&stage).cloned().unwrap_or_default()
    }

    /// True when every prerequisite of `stage` is completed or skipped
    pub fn can_start_stage(&self, stage: Stage) -> bool {
        stage
            .prerequisites()
            .iter()
            .all(|prereq| self.stage_state(*prereq).status.satisfies_prerequisite())
    }

    /// Overall progress as the mean of per-stage progress across the
    /// canonical list, in `[0, 100]`
    pub fn overall_progress(&self) -> f64 {
        let total: f64 = Stage::ALL
            .iter()
            .map(|stage| match self.stage_state(*stage).status {
                StageStatus::Completed | StageStatus::Skipped => 100.0,
                _ => self.stage_state(*stage).progress_percent,
            })
            .sum();
        total / Stage::ALL.len() as f64
    }

    /// First stage that is not yet terminal, or `None` when the pipeline
    /// has run to the end
    pub fn current_stage(&self) -> Option<Stage> {
        Stage::ALL
            .iter()
            .find(|stage| !self.stage_state(**stage).status.satisfies_prerequisite())
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document() -> Document {
        Document::new(
            "CX3500_SM.pdf",
            2 * 1024 * 1024,
            ContentHash::of_bytes(b"pdf bytes"),
            "service_manual",
            "en",
        )
    }

    #[test]
    fn new_document_is_pending_everywhere() {
        let doc = document();
        assert_eq!(doc.processing_status, ProcessingStatus::Pending);
        assert_eq!(doc.current_stage(), Some(Stage::Upload));
        assert!(doc.can_start_stage(Stage::Upload));
        assert!(!doc.can_start_stage(Stage::TextExtraction));
    }

    #[test]
    fn skipped_stages_satisfy_prerequisites() {
        let mut doc = document();
        let mut upload = StageState::pending();
        upload.status = StageStatus::Skipped;
        doc.stage_status.insert(Stage::Upload, upload);
        assert!(doc.can_start_stage(Stage::TextExtraction));
    }

    #[test]
    fn overall_progress_counts_terminal_stages_as_full() {
        let mut doc = document();
        let mut upload = StageState::pending();
        upload.status = StageStatus::Completed;
        doc.stage_status.insert(Stage::Upload, upload);

        let mut text = StageState::pending();
        text.status = StageStatus::Processing;
        text.progress_percent = 50.0;
        doc.stage_status.insert(Stage::TextExtraction, text);

        let expected = (100.0 + 50.0) / 15.0;
        assert!((doc.overall_progress() - expected).abs() < 1e-9);
    }
}
