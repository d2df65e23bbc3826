// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Domain entities and persisted records.
//!
//! The document aggregate with its per-stage status map sits at the center;
//! around it are the per-run processing context and result, the media and
//! embedding records owned by a document, catalog records, the processing
//! queue, the error log, and the monitoring read models.

pub mod catalog;
pub mod document;
pub mod embedding;
pub mod error_log;
pub mod media;
pub mod monitoring;
pub mod processing_context;
pub mod processing_result;
pub mod queue;

pub use catalog::{ErrorCodeRecord, Manufacturer, Product, ProductSeries};
pub use document::{Document, ProcessingStatus, StageState, StageStatus};
pub use embedding::{BatchItemOutcome, EmbeddingRecord, SourceType};
pub use error_log::{ErrorClassification, ErrorLogRecord};
pub use media::{Chunk, ImageRecord, LinkRecord, TableRecord, VideoRecord};
pub use monitoring::{
    Alert, AlertRule, AlertSeverity, AlertStatus, DataQualityMetrics, DuplicateGroup, DuplicateMetrics,
    ErrorEvent, HardwareStatus, PerformanceBaseline, PipelineMetrics, ProcessingBreakdown, QueueMetrics,
    StageAggregates, StageStatistics, ThresholdOperator, ValidationMetrics,
};
pub use processing_context::ProcessingContext;
pub use processing_result::ProcessingResult;
pub use queue::{QueueItem, QueueItemStatus};
