// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Result value returned by every stage run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::document::ProcessingStatus;

/// Outcome of one stage execution.
///
/// Produced either directly by a processor or by the stage runner when it
/// resolves the run without invoking the processor (idempotent skip, lock
/// contention, scheduled retry). `processing_time` is always populated by
/// the runner before the result leaves `safe_process`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub success: bool,
    pub processor: String,
    pub status: ProcessingStatus,
    pub data: serde_json::Value,
    pub metadata: serde_json::Value,
    pub error: Option<String>,
    pub processing_time: f64,
    pub timestamp: DateTime<Utc>,
    pub error_id: Option<String>,
    pub correlation_id: Option<String>,
    pub retry_attempt: u32,
}

impl ProcessingResult {
    /// A successful completion
    pub fn success(processor: impl Into<String>, data: serde_json::Value, metadata: serde_json::Value) -> Self {
        Self {
            success: true,
            processor: processor.into(),
            status: ProcessingStatus::Completed,
            data,
            metadata,
            error: None,
            processing_time: 0.0,
            timestamp: Utc::now(),
            error_id: None,
            correlation_id: None,
            retry_attempt: 0,
        }
    }

    /// A terminal failure
    pub fn failure(processor: impl Into<String>, error: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self {
            success: false,
            processor: processor.into(),
            status: ProcessingStatus::Failed,
            data: serde_json::Value::Null,
            metadata,
            error: Some(error.into()),
            processing_time: 0.0,
            timestamp: Utc::now(),
            error_id: None,
            correlation_id: None,
            retry_attempt: 0,
        }
    }

    /// Work continues elsewhere: another worker holds the lock, or a
    /// background retry has been scheduled
    pub fn in_progress(processor: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: false,
            processor: processor.into(),
            status: ProcessingStatus::InProgress,
            data,
            metadata: serde_json::Value::Null,
            error: None,
            processing_time: 0.0,
            timestamp: Utc::now(),
            error_id: None,
            correlation_id: None,
            retry_attempt: 0,
        }
    }

    /// Wraps a loosely structured payload produced by a processor that does
    /// not build a full result itself
    pub fn from_data(processor: impl Into<String>, data: serde_json::Value) -> Self {
        let success = data
            .get("success")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true);
        let metadata = data.get("metadata").cloned().unwrap_or(serde_json::Value::Null);
        Self {
            success,
            processor: processor.into(),
            status: if success {
                ProcessingStatus::Completed
            } else {
                ProcessingStatus::Failed
            },
            data,
            metadata,
            error: None,
            processing_time: 0.0,
            timestamp: Utc::now(),
            error_id: None,
            correlation_id: None,
            retry_attempt: 0,
        }
    }
}
