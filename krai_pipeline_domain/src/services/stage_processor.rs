// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Stage Processor Interface
//!
//! Every domain stage (text extraction, classification, embedding, and so
//! on) implements this trait. The framework owns everything around the
//! call: idempotency checks, advisory locking, retry orchestration, metric
//! collection, and event emission all happen in the stage runner, so a
//! processor only implements its transformation.
//!
//! Processors are called with a mutable context and append their declared
//! outputs to it. They must not write completion markers or touch advisory
//! locks themselves.
//!
//! ## Criticality and Retries
//!
//! A processor declares a default criticality and a retry policy id. The
//! pipeline configuration publishes the authoritative per-stage criticality
//! table; the declaration here is the fallback when a stage is absent from
//! that table.
//!
//! ## Cleanup
//!
//! When the input hash of a completed stage changes, the runner deletes the
//! stale completion marker and then calls `cleanup` so the processor can
//! delete artifacts it produced for the old input (chunks, embeddings,
//! stored images). Cleanup is best-effort: an error is logged and
//! re-processing proceeds.

use async_trait::async_trait;

use crate::entities::{ProcessingContext, ProcessingResult};
use crate::value_objects::Stage;
use crate::PipelineError;

/// Interface implemented by every pipeline stage.
///
/// Implementations must be thread-safe (`Send + Sync`); the framework may
/// call `process` for different documents concurrently. Calls for the same
/// `(document, stage)` pair are serialized by the advisory lock.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    /// The canonical stage this processor implements
    fn stage(&self) -> Stage;

    /// Processor version recorded in completion marker metadata. Bump it
    /// when output semantics change.
    fn version(&self) -> &str {
        "1.0.0"
    }

    /// Default criticality when the configuration table does not list this
    /// stage. A critical stage failure fails the whole document.
    fn is_critical(&self) -> bool {
        false
    }

    /// Retry policy id resolved against the retry configuration
    fn retry_policy_id(&self) -> &str {
        "default"
    }

    /// Runs the stage's domain logic
    async fn process(&self, context: &mut ProcessingContext) -> Result<ProcessingResult, PipelineError>;

    /// Deletes artifacts produced for a previous input hash. Called after
    /// the stale completion marker was removed.
    async fn cleanup(&self, _context: &ProcessingContext) -> Result<(), PipelineError> {
        Ok(())
    }
}
