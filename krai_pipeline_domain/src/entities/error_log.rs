// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Error Log Records
//!
//! Every classified stage failure is persisted as an error record carrying
//! the correlation id of the attempt that produced it. The alert service
//! consumes this stream for rule matching and aggregation; operators use it
//! to trace a failure across log, metric, and alert systems.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value_objects::{DocumentId, Stage};

/// How the retry engine classified an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    /// Temporary condition; retrying may succeed
    Transient,
    /// Deterministic failure; retrying cannot help
    Permanent,
    /// Unrecognized; treated as transient with capped retries
    Unknown,
}

impl ErrorClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClassification::Transient => "transient",
            ErrorClassification::Permanent => "permanent",
            ErrorClassification::Unknown => "unknown",
        }
    }

    /// Whether this classification admits a retry
    pub fn is_retriable(&self) -> bool {
        matches!(self, ErrorClassification::Transient | ErrorClassification::Unknown)
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted record of one classified failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogRecord {
    pub id: Uuid,
    pub correlation_id: String,
    pub stage: Stage,
    pub document_id: Option<DocumentId>,
    pub classification: ErrorClassification,
    pub message: String,
    pub stack: Option<String>,
    pub retry_count: u32,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
}

impl ErrorLogRecord {
    pub fn new(
        correlation_id: impl Into<String>,
        stage: Stage,
        classification: ErrorClassification,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            correlation_id: correlation_id.into(),
            stage,
            document_id: None,
            classification,
            message: message.into(),
            stack: None,
            retry_count: 0,
            first_occurrence: now,
            last_occurrence: now,
        }
    }
}
