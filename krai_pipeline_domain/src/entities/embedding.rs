// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Unified Embedding Records
//!
//! One table holds embeddings for every modality. A row is addressed by
//! `(source_id, source_type, model_name)` and that triple is unique: storing
//! the same source twice with the same model converges to one row. The
//! vector dimension is fixed per model; mixing dimensions under one model
//! name is a data error the persistence layer rejects.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::PipelineError;

/// The modality an embedding was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Text,
    Image,
    Table,
    Link,
    Video,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Text => "text",
            SourceType::Image => "image",
            SourceType::Table => "table",
            SourceType::Link => "link",
            SourceType::Video => "video",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(SourceType::Text),
            "image" => Ok(SourceType::Image),
            "table" => Ok(SourceType::Table),
            "link" => Ok(SourceType::Link),
            "video" => Ok(SourceType::Video),
            other => Err(PipelineError::validation_error(format!(
                "unknown embedding source type '{}'",
                other
            ))),
        }
    }
}

/// A stored embedding vector with its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: Uuid,
    pub source_id: Uuid,
    pub source_type: SourceType,
    pub embedding: Vec<f32>,
    pub model_name: String,
    pub embedding_context: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl EmbeddingRecord {
    pub fn new(source_id: Uuid, source_type: SourceType, embedding: Vec<f32>, model_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id,
            source_type,
            embedding,
            model_name: model_name.into(),
            embedding_context: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.embedding.len()
    }
}

/// Outcome of storing one item within an embedding batch.
///
/// Batch writes never collapse to a single boolean: the caller needs to
/// know which items landed so a partial success can be reported and the
/// failed remainder retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemOutcome {
    pub source_id: Uuid,
    pub stored_id: Option<Uuid>,
    pub error: Option<String>,
}

impl BatchItemOutcome {
    pub fn stored(source_id: Uuid, stored_id: Uuid) -> Self {
        Self {
            source_id,
            stored_id: Some(stored_id),
            error: None,
        }
    }

    pub fn failed(source_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            source_id,
            stored_id: None,
            error: Some(error.into()),
        }
    }

    pub fn is_stored(&self) -> bool {
        self.stored_id.is_some()
    }
}
