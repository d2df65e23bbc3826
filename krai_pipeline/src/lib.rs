// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

// Production code safety enforced via CI and `make lint-strict`
// (lib/bins checked separately from tests - tests may use unwrap/expect)

//! # KRAI Pipeline
//!
//! A multi-stage document processing engine that ingests technical PDFs
//! (service manuals, parts catalogs) and produces a searchable,
//! multi-modal knowledge store. This crate holds the application and
//! infrastructure layers; the pure business model lives in
//! `krai-pipeline-domain`.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Presentation Layer                       │
//! │  (CLI, Request Validation Front Door)                       │
//! └─────────────────────────────────────────────────────────────┘
//!                                │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Application Layer                          │
//! │  (Ingest Use Case, Stage Sequencer)                         │
//! └─────────────────────────────────────────────────────────────┘
//!                                │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Domain Layer                             │
//! │  (Entities, Value Objects, Ports - separate crate)          │
//! └─────────────────────────────────────────────────────────────┘
//!                                ▲
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Infrastructure Layer                         │
//! │  (Postgres/Memory Ports, Stage Runner, Retry Engine,        │
//! │   Stage Tracker, Metrics, Alerts, Broadcast Hub)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Concepts
//!
//! ### Stage Execution
//! Every stage run goes through `StageRunner::safe_process`: completion
//! markers make stages idempotent, advisory locks serialize concurrent
//! runs of the same `(document, stage)` pair across workers, and failures
//! are classified into transient, permanent, and unknown. The first
//! transient retry happens synchronously in the request path; later
//! retries move to background tasks that re-acquire the lock.
//!
//! ### Tracking and Degradation
//! The stage tracker keeps the per-document stage map current through
//! stored procedures and keeps working (as a no-op) when those
//! procedures are missing. The stage runner likewise degrades to a
//! single unlocked run when the database is unreachable. Both behaviors
//! are tested, not incidental.
//!
//! ### Monitoring
//! The metrics service aggregates pipeline, queue, stage, hardware, and
//! data quality metrics behind a short-TTL cache; the alert service
//! evaluates rules against those metrics and aggregates recurring error
//! events; the broadcast hub pushes updates, stage events, and alerts to
//! subscribed monitoring clients.

pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use application::services::document_pipeline::{PipelineRunOutcome, ProcessorRegistry, StageSequencer};
pub use application::use_cases::ingest_document::{IngestDocument, IngestOutcome};
pub use infrastructure::broadcast::{BroadcastHub, StaticTokenVerifier};
pub use infrastructure::config::PipelineConfig;
pub use infrastructure::repositories::{MemoryDatabasePort, PostgresDatabasePort};
pub use infrastructure::runtime::StageRunner;
pub use infrastructure::services::{
    AlertService, IdempotencyChecker, MetricsService, PerformanceCollector, StageTracker,
};
pub use presentation::validation::{RequestValidator, ValidationErrorCode, ValidationFailure};
