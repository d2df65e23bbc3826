// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

// Production code safety enforced via CI and `make lint-strict`
// (lib/bins checked separately from tests - tests may use unwrap/expect)

//! # KRAI Pipeline Domain
//!
//! Domain layer for the KRAI multi-stage document processing engine. This
//! crate holds the pure business model: what a document is, which stages it
//! moves through, what a stage run produces, and the ports the rest of the
//! system implements.
//!
//! ## Architecture Position
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Application Layer                          │
//! │  (Stage sequencer, ingest use case, CLI)                    │
//! └─────────────────────────────────────────────────────────────┘
//!                                │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Domain Layer (this crate)                │
//! │  (Entities, Value Objects, Ports, Events)                   │
//! └─────────────────────────────────────────────────────────────┘
//!                                ▲
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Infrastructure Layer                         │
//! │  (Postgres port, stage runner, metrics, alerts, broadcast)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Concepts
//!
//! ### Documents and Stages
//! A document is the unit of work, identified forever by its id and
//! deduplicated by its content hash. Every document moves through the same
//! fifteen canonical stages in order; each stage tracks its own status,
//! progress, and metadata in the document's stage map.
//!
//! ### Ports
//! The domain defines two load-bearing ports: [`DatabasePort`] for all
//! persistence (including advisory locks, stored procedures, and vector
//! search) and [`StageProcessor`] for the domain logic of a single stage.
//! Infrastructure implements them; tests substitute in-memory versions.
//!
//! ### Tracing Identity
//! Each processing request carries a request id; each attempt of each stage
//! carries a correlation id of the form `req_<id>.<stage>.retry_<N>`.
//! Every error record, metric sample, and alert produced by an attempt
//! carries that correlation id.

pub mod entities;
pub mod error;
pub mod events;
pub mod repositories;
pub mod services;
pub mod value_objects;

pub use entities::{
    Alert, AlertRule, AlertSeverity, AlertStatus, BatchItemOutcome, Chunk, DataQualityMetrics, Document,
    DuplicateGroup, DuplicateMetrics, EmbeddingRecord, ErrorClassification, ErrorCodeRecord, ErrorEvent,
    ErrorLogRecord, HardwareStatus, ImageRecord, LinkRecord, Manufacturer, PerformanceBaseline,
    PipelineMetrics, ProcessingBreakdown, ProcessingContext, ProcessingResult, ProcessingStatus, Product,
    ProductSeries, QueueItem, QueueItemStatus, QueueMetrics, SourceType, StageAggregates, StageState,
    StageStatistics, StageStatus, TableRecord, ThresholdOperator, ValidationMetrics, VideoRecord,
};
pub use error::PipelineError;
pub use events::{BroadcastEventKind, BroadcastFrame, EventBroadcaster, NullBroadcaster};
pub use repositories::{
    advisory_lock_key, CompletionMarker, DatabasePort, PipelineMetricsView, QueueMetricsView, SimilarityMatch,
};
pub use services::{AuthenticatedUser, StageProcessor, TokenVerifier};
pub use value_objects::{ContentHash, CorrelationId, DocumentId, RequestId, Stage};
