// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Canonical Pipeline Stages
//!
//! The fixed, ordered list of processing stages every document moves
//! through. The order is load-bearing: a stage may only start once every
//! earlier stage is `completed` or `skipped`, and the sequencer iterates
//! this list front to back.
//!
//! Stages are stored as strings in the database for portability but modeled
//! as a closed enum in code. Unknown stage names read back from storage are
//! a parse error at the persistence boundary, never a silent passthrough.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::PipelineError;

/// One fixed step in the canonical document pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Upload,
    TextExtraction,
    TableExtraction,
    SvgProcessing,
    ImageProcessing,
    VisualEmbedding,
    LinkExtraction,
    ChunkPrep,
    Classification,
    MetadataExtraction,
    PartsExtraction,
    SeriesDetection,
    Storage,
    Embedding,
    SearchIndexing,
}

impl Stage {
    /// All stages in canonical execution order.
    pub const ALL: [Stage; 15] = [
        Stage::Upload,
        Stage::TextExtraction,
        Stage::TableExtraction,
        Stage::SvgProcessing,
        Stage::ImageProcessing,
        Stage::VisualEmbedding,
        Stage::LinkExtraction,
        Stage::ChunkPrep,
        Stage::Classification,
        Stage::MetadataExtraction,
        Stage::PartsExtraction,
        Stage::SeriesDetection,
        Stage::Storage,
        Stage::Embedding,
        Stage::SearchIndexing,
    ];

    /// The storage representation of this stage
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Upload => "upload",
            Stage::TextExtraction => "text_extraction",
            Stage::TableExtraction => "table_extraction",
            Stage::SvgProcessing => "svg_processing",
            Stage::ImageProcessing => "image_processing",
            Stage::VisualEmbedding => "visual_embedding",
            Stage::LinkExtraction => "link_extraction",
            Stage::ChunkPrep => "chunk_prep",
            Stage::Classification => "classification",
            Stage::MetadataExtraction => "metadata_extraction",
            Stage::PartsExtraction => "parts_extraction",
            Stage::SeriesDetection => "series_detection",
            Stage::Storage => "storage",
            Stage::Embedding => "embedding",
            Stage::SearchIndexing => "search_indexing",
        }
    }

    /// Human-facing processor name for monitoring displays
    /// (e.g. `text_extraction` reports as `TextProcessor`).
    pub fn processor_name(&self) -> &'static str {
        match self {
            Stage::Upload => "UploadProcessor",
            Stage::TextExtraction => "TextProcessor",
            Stage::TableExtraction => "TableProcessor",
            Stage::SvgProcessing => "SVGProcessor",
            Stage::ImageProcessing => "ImageProcessor",
            Stage::VisualEmbedding => "VisualEmbeddingProcessor",
            Stage::LinkExtraction => "LinkProcessor",
            Stage::ChunkPrep => "ChunkPrepProcessor",
            Stage::Classification => "ClassificationProcessor",
            Stage::MetadataExtraction => "MetadataProcessor",
            Stage::PartsExtraction => "PartsProcessor",
            Stage::SeriesDetection => "SeriesDetectionProcessor",
            Stage::Storage => "StorageProcessor",
            Stage::Embedding => "EmbeddingProcessor",
            Stage::SearchIndexing => "SearchIndexingProcessor",
        }
    }

    /// Zero-based position within the canonical order
    pub fn ordinal(&self) -> usize {
        Stage::ALL.iter().position(|s| s == self).unwrap_or(0)
    }

    /// Stages that must be `completed` or `skipped` before this one starts
    pub fn prerequisites(&self) -> &'static [Stage] {
        let idx = self.ordinal();
        &Stage::ALL[..idx]
    }

    /// The stage after this one, if any
    pub fn next(&self) -> Option<Stage> {
        Stage::ALL.get(self.ordinal() + 1).copied()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| PipelineError::validation_error(format!("unknown stage '{}'", s)))
    }
}
