// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Stage Runner
//!
//! `safe_process` is the generic wrapper every stage execution goes
//! through. The sequence:
//!
//! 1. Ensure the context carries a request id.
//! 2. Consult the completion marker: an unchanged input hash skips the
//!    stage entirely; a changed hash purges the stale marker and gives the
//!    processor a chance to clean its artifacts before the rerun.
//! 3. Resolve the retry policy and take the advisory lock for
//!    `(document, stage)`. A busy lock means another worker is already on
//!    it, and the runner reports `in_progress` without running.
//! 4. Invoke the processor. A failure is classified: the first transient
//!    failure retries synchronously in the same request path; further
//!    transient failures move to a background task; permanent failures are
//!    recorded immediately.
//! 5. On success, write the completion marker (with processing time,
//!    retry count, and processor version in its metadata), release the
//!    lock, and record metrics. Metric failures never fail the stage.
//! 6. Normalize the result so `processing_time`, correlation id, and
//!    retry attempt are always populated.
//!
//! ## Degraded Mode
//!
//! When the database is unreachable, the runner executes the processor
//! once without locks, markers, or retries and logs a warning. The stage
//! outcome still propagates to the sequencer.

use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, error, info, warn};

use krai_pipeline_domain::{
    advisory_lock_key, AlertSeverity, CompletionMarker, DatabasePort, ErrorClassification, ErrorEvent,
    ErrorLogRecord, PipelineError, ProcessingContext, ProcessingResult, Stage, StageProcessor,
};

use crate::infrastructure::config::{RetryConfig, RetryPolicyConfig};
use crate::infrastructure::metrics::exporter::PipelineMetricsExporter;
use crate::infrastructure::runtime::cancellation::CancellationRegistry;
use crate::infrastructure::runtime::retry::{backoff_delay, ErrorClassifier, RetryListener};
use crate::infrastructure::services::alert_service::AlertService;
use crate::infrastructure::services::idempotency::IdempotencyChecker;
use crate::infrastructure::services::performance_collector::PerformanceCollector;

/// Generic stage execution engine.
///
/// Cloning is cheap (every field is shared state behind an `Arc`); the
/// background retry task captures a clone of the runner it was spawned
/// from.
#[derive(Clone)]
pub struct StageRunner {
    port: Arc<dyn DatabasePort>,
    idempotency: IdempotencyChecker,
    classifier: ErrorClassifier,
    retry_config: RetryConfig,
    cancellations: Arc<CancellationRegistry>,
    collector: Option<Arc<PerformanceCollector>>,
    alerts: Option<Arc<AlertService>>,
    exporter: Option<Arc<PipelineMetricsExporter>>,
    /// Held weakly; the listener (the sequencer) owns the runner
    listener: Arc<RwLock<Option<Weak<dyn RetryListener>>>>,
}

impl StageRunner {
    pub fn new(port: Arc<dyn DatabasePort>, retry_config: RetryConfig, cancellations: Arc<CancellationRegistry>) -> Self {
        Self {
            idempotency: IdempotencyChecker::new(port.clone()),
            port,
            classifier: ErrorClassifier::new(),
            retry_config,
            cancellations,
            collector: None,
            alerts: None,
            exporter: None,
            listener: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_collector(mut self, collector: Arc<PerformanceCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<AlertService>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn with_exporter(mut self, exporter: Arc<PipelineMetricsExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Registers the listener notified when background retries finish
    pub fn set_retry_listener(&self, listener: Weak<dyn RetryListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Executes one stage with idempotency, locking, retries, and metrics.
    pub async fn safe_process(
        &self,
        processor: Arc<dyn StageProcessor>,
        context: &mut ProcessingContext,
    ) -> ProcessingResult {
        let stage = processor.stage();
        let started = Instant::now();
        context.ensure_request_id();

        let current_hash = self.idempotency.compute_data_hash(context);

        // Idempotency decision: run, skip, or purge-then-run
        match self.idempotency.check_completion_marker(context.document_id(), stage).await {
            Ok(Some(marker)) if marker.data_hash == current_hash => {
                debug!(document_id = %context.document_id(), %stage, "stage already completed for this input");
                let mut result = ProcessingResult::success(
                    stage.as_str(),
                    json!({"skipped": "already_processed"}),
                    json!({"data_hash": current_hash}),
                );
                self.finalize(&mut result, context, started);
                return result;
            }
            Ok(Some(_)) => {
                info!(document_id = %context.document_id(), %stage, "input changed; purging stale marker");
                if let Err(e) = self.idempotency.cleanup_old_data(context.document_id(), stage).await {
                    warn!(%stage, error = %e, "marker cleanup failed; re-processing anyway");
                }
                if let Err(e) = processor.cleanup(context).await {
                    warn!(%stage, error = %e, "processor cleanup failed; re-processing anyway");
                }
            }
            Ok(None) => {}
            Err(e) if matches!(e, PipelineError::ConnectionLost(_) | PipelineError::Timeout(_)) => {
                return self.degraded_run(processor.as_ref(), context, started, &e).await;
            }
            Err(e) => {
                warn!(%stage, error = %e, "marker lookup failed; running without idempotency");
            }
        }

        let policy = self.retry_config.resolve(stage, processor.retry_policy_id());
        let lock_key = advisory_lock_key(context.document_id(), stage);

        match self.port.try_advisory_lock(lock_key).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(document_id = %context.document_id(), %stage, "advisory lock busy; another worker is on it");
                let mut result =
                    ProcessingResult::in_progress(stage.as_str(), json!({"reason": "stage_lock_held"}));
                self.finalize(&mut result, context, started);
                return result;
            }
            Err(e) => {
                return self.degraded_run(processor.as_ref(), context, started, &e).await;
            }
        }

        // Re-check under the lock: another worker may have completed the
        // stage between the first marker read and the lock acquisition
        if let Ok(Some(marker)) = self.port.get_completion_marker(context.document_id(), stage).await {
            if marker.data_hash == current_hash {
                let _ = self.port.advisory_unlock(lock_key).await;
                debug!(document_id = %context.document_id(), %stage, "stage completed while waiting for the lock");
                let mut result = ProcessingResult::success(
                    stage.as_str(),
                    json!({"skipped": "already_processed"}),
                    json!({"data_hash": current_hash}),
                );
                self.finalize(&mut result, context, started);
                return result;
            }
        }

        // First attempt. Every branch below releases the lock itself;
        // the background escalation path must release it before the
        // spawned task tries to re-acquire.
        context.begin_attempt(stage, 0);
        let outcome = processor.process(context).await;

        match outcome {
            Ok(result) => {
                let result = self
                    .complete_success(result, processor.as_ref(), context, &current_hash, started, 0)
                    .await;
                let _ = self.port.advisory_unlock(lock_key).await;
                result
            }
            Err(error) => {
                self.handle_failure(processor.clone(), context, current_hash, started, lock_key, policy, error)
                    .await
            }
        }
    }

    /// Runs the processor once without locks, markers, or retries.
    async fn degraded_run(
        &self,
        processor: &dyn StageProcessor,
        context: &mut ProcessingContext,
        started: Instant,
        cause: &PipelineError,
    ) -> ProcessingResult {
        let stage = processor.stage();
        warn!(
            %stage,
            error = %cause,
            "database unreachable; executing stage without locks, markers, or retries"
        );

        context.begin_attempt(stage, 0);
        let mut result = match processor.process(context).await {
            Ok(result) => result,
            Err(e) => ProcessingResult::failure(
                stage.as_str(),
                e.to_string(),
                json!({"error_category": self.classifier.classify(&e).as_str(), "degraded": true}),
            ),
        };
        self.finalize(&mut result, context, started);
        self.record_metrics(stage, &result);
        result
    }

    /// Marker write, metrics, and normalization after a successful run
    async fn complete_success(
        &self,
        mut result: ProcessingResult,
        processor: &dyn StageProcessor,
        context: &mut ProcessingContext,
        data_hash: &str,
        started: Instant,
        retry_count: u32,
    ) -> ProcessingResult {
        let stage = processor.stage();
        self.finalize(&mut result, context, started);

        let marker_metadata = json!({
            "processing_time": result.processing_time,
            "retry_count": retry_count,
            "processor_version": processor.version(),
        });
        if let Err(e) = self
            .idempotency
            .set_completion_marker(context.document_id(), stage, data_hash.to_string(), marker_metadata)
            .await
        {
            // The work is done; a lost marker only costs a redundant rerun
            warn!(%stage, error = %e, "failed to write completion marker");
        }

        self.record_metrics(stage, &result);
        result
    }

    /// Classification, error records, and the hybrid retry ladder
    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        processor: Arc<dyn StageProcessor>,
        context: &mut ProcessingContext,
        data_hash: String,
        started: Instant,
        lock_key: i64,
        policy: RetryPolicyConfig,
        error: PipelineError,
    ) -> ProcessingResult {
        let stage = processor.stage();
        let classification = self.classifier.classify(&error);
        let error_id = self.log_error(context, stage, classification, &error, 0).await;

        if !classification.is_retriable() || policy.max_retries == 0 {
            let _ = self.port.advisory_unlock(lock_key).await;
            return self
                .permanent_failure(stage, context, started, classification, &error, error_id)
                .await;
        }

        // Synchronous first retry, same request path, lock still held
        tokio::time::sleep(backoff_delay(&policy, 0)).await;
        if self.cancellations.is_cancelled(context.document_id()) {
            let _ = self.port.advisory_unlock(lock_key).await;
            let cancelled = PipelineError::Cancelled("document cancelled during retry".to_string());
            return self
                .permanent_failure(stage, context, started, ErrorClassification::Permanent, &cancelled, None)
                .await;
        }

        context.begin_attempt(stage, 1);
        info!(document_id = %context.document_id(), %stage, "synchronous retry");
        match processor.process(context).await {
            Ok(result) => {
                let result = self
                    .complete_success(result, processor.as_ref(), context, &data_hash, started, 1)
                    .await;
                let _ = self.port.advisory_unlock(lock_key).await;
                result
            }
            Err(retry_error) => {
                let retry_classification = self.classifier.classify(&retry_error);
                let retry_error_id = self.log_error(context, stage, retry_classification, &retry_error, 1).await;

                let next_attempt = 2;
                if !retry_classification.is_retriable() || next_attempt >= policy.max_retries {
                    let _ = self.port.advisory_unlock(lock_key).await;
                    return self
                        .permanent_failure(stage, context, started, retry_classification, &retry_error, retry_error_id)
                        .await;
                }

                // Release the lock before spawning so the background task
                // can re-acquire it even on a zero-jitter delay
                let _ = self.port.advisory_unlock(lock_key).await;
                self.spawn_background_retry(processor, context.clone(), data_hash, policy, next_attempt);
                let mut result = ProcessingResult::in_progress(
                    stage.as_str(),
                    json!({
                        "reason": "async_retry_scheduled",
                        "correlation_id": context.correlation_id().map(|c| c.as_str().to_string()),
                        "next_attempt": next_attempt,
                    }),
                );
                result.error_id = retry_error_id.map(|id| id.to_string());
                self.finalize(&mut result, context, started);
                self.record_failure_sample(stage, &result);
                result
            }
        }
    }

    async fn permanent_failure(
        &self,
        stage: Stage,
        context: &mut ProcessingContext,
        started: Instant,
        classification: ErrorClassification,
        error: &PipelineError,
        error_id: Option<uuid::Uuid>,
    ) -> ProcessingResult {
        error!(
            document_id = %context.document_id(),
            %stage,
            classification = %classification,
            error = %error,
            "stage failed"
        );
        let mut result = ProcessingResult::failure(
            stage.as_str(),
            error.to_string(),
            json!({
                "error_category": classification.as_str(),
                "error_id": error_id.map(|id| id.to_string()),
            }),
        );
        result.error_id = error_id.map(|id| id.to_string());
        self.finalize(&mut result, context, started);
        self.record_failure_sample(stage, &result);
        result
    }

    /// Background retry loop for attempts past the synchronous one.
    ///
    /// Each attempt re-acquires the advisory lock; a busy lock means some
    /// other worker owns the stage now, and this task stands down.
    fn spawn_background_retry(
        &self,
        processor: Arc<dyn StageProcessor>,
        mut context: ProcessingContext,
        data_hash: String,
        policy: RetryPolicyConfig,
        start_attempt: u32,
    ) {
        let runner = self.clone();
        tokio::spawn(async move {
            let stage = processor.stage();
            let document_id = context.document_id();
            let lock_key = advisory_lock_key(document_id, stage);
            let mut last_error = String::from("retries exhausted");

            for attempt in start_attempt..policy.max_retries {
                tokio::time::sleep(backoff_delay(&policy, attempt)).await;

                if runner.cancellations.is_cancelled(document_id) {
                    info!(%document_id, %stage, "document cancelled; abandoning background retry");
                    return;
                }

                match runner.port.try_advisory_lock(lock_key).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(%document_id, %stage, "lock busy during background retry; standing down");
                        return;
                    }
                    Err(e) => {
                        warn!(%document_id, %stage, error = %e, "lock attempt failed during background retry");
                        last_error = e.to_string();
                        continue;
                    }
                }

                // Another worker may have finished while this task slept
                if let Ok(Some(marker)) = runner.port.get_completion_marker(document_id, stage).await {
                    if marker.data_hash == data_hash {
                        let _ = runner.port.advisory_unlock(lock_key).await;
                        runner.notify_recovered(context.clone(), stage).await;
                        return;
                    }
                }

                context.begin_attempt(stage, attempt);
                info!(%document_id, %stage, attempt, "background retry");
                let started = Instant::now();

                match processor.process(&mut context).await {
                    Ok(mut result) => {
                        runner.finalize(&mut result, &context, started);
                        let marker = CompletionMarker {
                            document_id,
                            stage,
                            data_hash: data_hash.clone(),
                            completed_at: chrono::Utc::now(),
                            metadata: json!({
                                "processing_time": result.processing_time,
                                "retry_count": attempt,
                                "processor_version": processor.version(),
                            }),
                        };
                        if let Err(e) = runner.port.upsert_completion_marker(&marker).await {
                            warn!(%stage, error = %e, "failed to write completion marker after retry");
                        }
                        let _ = runner.port.advisory_unlock(lock_key).await;
                        runner.record_metrics(stage, &result);
                        runner.notify_recovered(context.clone(), stage).await;
                        return;
                    }
                    Err(e) => {
                        let classification = runner.classifier.classify(&e);
                        let _ = runner.log_error(&context, stage, classification, &e, attempt).await;
                        if let Some(collector) = &runner.collector {
                            collector.collect_stage_sample(stage.as_str(), started.elapsed().as_secs_f64(), false);
                        }
                        if let Some(exporter) = &runner.exporter {
                            exporter.record_stage_error(stage);
                        }
                        let _ = runner.port.advisory_unlock(lock_key).await;
                        last_error = e.to_string();
                        if classification == ErrorClassification::Permanent {
                            break;
                        }
                    }
                }
            }

            runner.notify_exhausted(context, stage, last_error).await;
        });
    }

    async fn notify_recovered(&self, context: ProcessingContext, stage: Stage) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener.and_then(|weak| weak.upgrade()) {
            listener.stage_recovered(context, stage).await;
        }
    }

    async fn notify_exhausted(&self, context: ProcessingContext, stage: Stage, error: String) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener.and_then(|weak| weak.upgrade()) {
            listener.stage_exhausted(context, stage, error).await;
        }
    }

    /// Persists the error record and feeds the alert stream. Returns the
    /// stored error id when persistence succeeded.
    async fn log_error(
        &self,
        context: &ProcessingContext,
        stage: Stage,
        classification: ErrorClassification,
        error: &PipelineError,
        retry_count: u32,
    ) -> Option<uuid::Uuid> {
        let correlation_id = context
            .correlation_id()
            .map(|c| c.as_str().to_string())
            .unwrap_or_default();

        let mut record = ErrorLogRecord::new(correlation_id.clone(), stage, classification, error.to_string());
        record.document_id = Some(context.document_id());
        record.retry_count = retry_count;

        let error_id = match self.port.record_error(&record).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(%stage, error = %e, "failed to persist error record");
                None
            }
        };

        if let Some(alerts) = &self.alerts {
            let event = ErrorEvent {
                error_type: error_type_of(error).to_string(),
                stage,
                severity: match classification {
                    ErrorClassification::Permanent => AlertSeverity::High,
                    _ => AlertSeverity::Medium,
                },
                message: error.to_string(),
                document_id: Some(context.document_id()),
                correlation_id: Some(correlation_id),
            };
            alerts.queue_alert(&event).await;
        }

        error_id
    }

    /// Populates the fields every result must carry
    fn finalize(&self, result: &mut ProcessingResult, context: &ProcessingContext, started: Instant) {
        if result.processing_time <= 0.0 {
            result.processing_time = started.elapsed().as_secs_f64();
        }
        if result.correlation_id.is_none() {
            result.correlation_id = context.correlation_id().map(|c| c.as_str().to_string());
        }
        result.retry_attempt = context.retry_attempt();
    }

    /// Best-effort metric recording; never fails the stage
    fn record_metrics(&self, stage: Stage, result: &ProcessingResult) {
        if let Some(collector) = &self.collector {
            collector.collect_stage_metrics(stage.as_str(), result);
        }
        if let Some(exporter) = &self.exporter {
            if result.success {
                exporter.record_stage_completed(stage, result.processing_time);
            } else {
                exporter.record_stage_error(stage);
            }
        }
    }

    fn record_failure_sample(&self, stage: Stage, result: &ProcessingResult) {
        if let Some(collector) = &self.collector {
            collector.collect_stage_metrics(stage.as_str(), result);
        }
        if let Some(exporter) = &self.exporter {
            exporter.record_stage_error(stage);
        }
    }
}

/// Alert stream error type for one failure
fn error_type_of(error: &PipelineError) -> &'static str {
    match error {
        PipelineError::ValidationError(_) => "validation_error",
        PipelineError::ConnectionLost(_) => "connection_error",
        PipelineError::Timeout(_) => "timeout_error",
        PipelineError::DependencyUnavailable(_) | PipelineError::RateLimited(_) => "dependency_error",
        PipelineError::ConstraintViolation(_)
        | PipelineError::NotFound(_)
        | PipelineError::DatabaseError(_)
        | PipelineError::MissingFunction(_) => "database_error",
        PipelineError::Cancelled(_) => "cancelled",
        _ => "processing_error",
    }
}
