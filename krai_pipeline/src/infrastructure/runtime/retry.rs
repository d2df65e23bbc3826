// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Error Classification and Retry Policy
//!
//! The classifier maps failures onto three buckets:
//!
//! - **transient**: lost connections, timeouts, unavailable dependencies,
//!   rate limiting. Worth retrying.
//! - **permanent**: validation failures, deterministic processing errors,
//!   constraint violations. Never retried.
//! - **unknown**: anything unrecognized. Treated as transient with capped
//!   retries.
//!
//! Backoff is exponential with full jitter: the delay before attempt `k`
//! is drawn uniformly from `[0, base * 2^k]` and capped at the policy's
//! maximum. Full jitter keeps a burst of failures from re-converging into
//! a synchronized thundering herd.
//!
//! ## Hybrid Execution
//!
//! The first retry after a transient failure runs synchronously in the
//! same request path while the advisory lock is still held. Subsequent
//! retries run on background tasks; each background attempt re-acquires
//! the advisory lock and yields to whichever worker already holds it. The
//! stage runner implements the loop; this module supplies the policy
//! machinery and the listener interface through which the sequencer learns
//! about recovered or exhausted stages.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use krai_pipeline_domain::{ErrorClassification, PipelineError, ProcessingContext, Stage};

use crate::infrastructure::config::RetryPolicyConfig;

/// Maps errors onto retry classifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classifies one failure
    pub fn classify(&self, error: &PipelineError) -> ErrorClassification {
        match error {
            PipelineError::ConnectionLost(_)
            | PipelineError::Timeout(_)
            | PipelineError::DependencyUnavailable(_)
            | PipelineError::RateLimited(_) => ErrorClassification::Transient,

            PipelineError::ValidationError(_)
            | PipelineError::ProcessingFailed(_)
            | PipelineError::ConstraintViolation(_)
            | PipelineError::NotFound(_)
            | PipelineError::InvalidConfiguration(_)
            | PipelineError::SerializationError(_)
            | PipelineError::MissingFunction(_)
            | PipelineError::Cancelled(_) => ErrorClassification::Permanent,

            PipelineError::DatabaseError(_)
            | PipelineError::MetricsError(_)
            | PipelineError::InternalError(_) => ErrorClassification::Unknown,
        }
    }
}

/// Delay before retry attempt `attempt` (zero-based) under `policy`.
///
/// With jitter enabled the delay is `rand(0, base * 2^attempt)` capped at
/// the policy maximum; without jitter it is the capped exponential itself.
pub fn backoff_delay(policy: &RetryPolicyConfig, attempt: u32) -> Duration {
    let exponent = attempt.min(16);
    let ceiling = policy
        .base_delay()
        .saturating_mul(1u32 << exponent)
        .min(policy.max_delay());

    if !policy.jitter || ceiling.is_zero() {
        return ceiling;
    }

    let ceiling_ms = ceiling.as_millis() as u64;
    let jittered = rand::rng().random_range(0..=ceiling_ms);
    Duration::from_millis(jittered)
}

/// Receives the terminal outcome of a background retry sequence.
///
/// The sequencer registers itself here: a recovered stage re-enters the
/// sequencer so the document advances; an exhausted stage is marked failed
/// at the document level when it is critical.
#[async_trait]
pub trait RetryListener: Send + Sync {
    /// A background retry completed the stage
    async fn stage_recovered(&self, context: ProcessingContext, stage: Stage);

    /// Retries were exhausted (or a later attempt failed permanently)
    async fn stage_exhausted(&self, context: ProcessingContext, stage: Stage, error: String);
}

/// Listener that drops both notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRetryListener;

#[async_trait]
impl RetryListener for NullRetryListener {
    async fn stage_recovered(&self, _context: ProcessingContext, _stage: Stage) {}

    async fn stage_exhausted(&self, _context: ProcessingContext, _stage: Stage, _error: String) {}
}
