// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Processing queue records backing the queue metrics view.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value_objects::DocumentId;
use crate::PipelineError;

/// Status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueItemStatus::Pending => "pending",
            QueueItemStatus::Processing => "processing",
            QueueItemStatus::Completed => "completed",
            QueueItemStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueItemStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueItemStatus::Pending),
            "processing" => Ok(QueueItemStatus::Processing),
            "completed" => Ok(QueueItemStatus::Completed),
            "failed" => Ok(QueueItemStatus::Failed),
            other => Err(PipelineError::validation_error(format!(
                "unknown queue status '{}'",
                other
            ))),
        }
    }
}

/// One scheduled unit of background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub task_type: String,
    pub status: QueueItemStatus,
    pub priority: i32,
    pub document_id: Option<DocumentId>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error_message: Option<String>,
}

impl QueueItem {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            status: QueueItemStatus::Pending,
            priority: 5,
            document_id: None,
            scheduled_at: Utc::now(),
            started_at: None,
            retry_count: 0,
            error_message: None,
        }
    }

    pub fn for_document(task_type: impl Into<String>, document_id: DocumentId) -> Self {
        let mut item = Self::new(task_type);
        item.document_id = Some(document_id);
        item
    }

    /// Seconds the item has waited, against a reference instant
    pub fn wait_seconds(&self, now: DateTime<Utc>) -> f64 {
        let end = self.started_at.unwrap_or(now);
        ((end - self.scheduled_at).num_milliseconds() as f64 / 1000.0).max(0.0)
    }
}
