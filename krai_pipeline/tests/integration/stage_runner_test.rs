// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Stage runner behavior: idempotency decisions, advisory locking,
//! hybrid retries, and database-outage degradation.

use std::sync::Arc;
use std::time::Duration;

use krai_pipeline_domain::{
    advisory_lock_key, DatabasePort, ProcessingStatus, Stage, StageProcessor,
};

use crate::common::{FlakyProcessor, OfflineTogglePort, TestHarness};

#[tokio::test]
async fn successful_run_writes_a_completion_marker() {
    let processor = Arc::new(FlakyProcessor::reliable(Stage::TextExtraction));
    let harness = TestHarness::new(vec![]);
    let (id, mut ctx) = harness.seed_document(b"pdf bytes").await;

    let result = harness
        .runner
        .safe_process(processor.clone() as Arc<dyn StageProcessor>, &mut ctx)
        .await;

    assert!(result.success);
    assert_eq!(result.status, ProcessingStatus::Completed);
    assert!(result.processing_time > 0.0);
    assert_eq!(processor.calls(), 1);

    let marker = harness
        .port
        .get_completion_marker(id, Stage::TextExtraction)
        .await
        .unwrap()
        .expect("marker written");
    assert_eq!(marker.data_hash.len(), 64);
    assert_eq!(marker.metadata["retry_count"], 0);
    assert_eq!(marker.metadata["processor_version"], "1.0.0");
}

#[tokio::test]
async fn unchanged_input_skips_the_second_run() {
    let processor = Arc::new(FlakyProcessor::reliable(Stage::TextExtraction));
    let harness = TestHarness::new(vec![]);
    let (_, mut ctx) = harness.seed_document(b"pdf bytes").await;

    let first = harness
        .runner
        .safe_process(processor.clone() as Arc<dyn StageProcessor>, &mut ctx)
        .await;
    assert!(first.success);

    let second = harness
        .runner
        .safe_process(processor.clone() as Arc<dyn StageProcessor>, &mut ctx)
        .await;
    assert!(second.success);
    assert_eq!(second.status, ProcessingStatus::Completed);
    assert_eq!(second.data["skipped"], "already_processed");
    // The processor ran exactly once
    assert_eq!(processor.calls(), 1);
}

#[tokio::test]
async fn changed_input_purges_the_marker_and_reruns() {
    let processor = Arc::new(FlakyProcessor::reliable(Stage::TextExtraction));
    let harness = TestHarness::new(vec![]);
    let (_, mut ctx) = harness.seed_document(b"pdf bytes").await;

    let first = harness
        .runner
        .safe_process(processor.clone() as Arc<dyn StageProcessor>, &mut ctx)
        .await;
    assert!(first.success);

    // Same document, different input projection
    let mut changed = ctx.clone().with_manufacturer("Konica Minolta");
    let second = harness
        .runner
        .safe_process(processor.clone() as Arc<dyn StageProcessor>, &mut changed)
        .await;

    assert!(second.success);
    assert_ne!(second.data.get("skipped"), Some(&serde_json::json!("already_processed")));
    assert_eq!(processor.calls(), 2);
    // The cleanup hook ran before the rerun
    assert_eq!(processor.cleanups(), 1);
}

#[tokio::test]
async fn transient_failure_retries_synchronously() {
    // Fails once, then succeeds: the retry happens in the same call
    let processor = Arc::new(FlakyProcessor::transient(Stage::Embedding, 1));
    let harness = TestHarness::new(vec![]);
    let (id, mut ctx) = harness.seed_document(b"pdf bytes").await;

    let result = harness
        .runner
        .safe_process(processor.clone() as Arc<dyn StageProcessor>, &mut ctx)
        .await;

    assert!(result.success);
    assert_eq!(result.status, ProcessingStatus::Completed);
    assert_eq!(processor.calls(), 2);
    assert_eq!(result.retry_attempt, 1);
    assert!(result
        .correlation_id
        .as_deref()
        .unwrap()
        .ends_with(".embedding.retry_1"));

    let marker = harness
        .port
        .get_completion_marker(id, Stage::Embedding)
        .await
        .unwrap()
        .expect("one marker");
    assert_eq!(marker.metadata["retry_count"], 1);

    // One error record for the failed first attempt
    let errors = harness.port.recent_errors(10).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].stage, Stage::Embedding);
}

#[tokio::test]
async fn second_transient_failure_escalates_to_background_retry() {
    // Fails twice: initial + sync retry fail, a background task finishes
    let processor = Arc::new(FlakyProcessor::transient(Stage::Embedding, 2));
    let harness = TestHarness::new(vec![]);
    let (id, mut ctx) = harness.seed_document(b"pdf bytes").await;

    let result = harness
        .runner
        .safe_process(processor.clone() as Arc<dyn StageProcessor>, &mut ctx)
        .await;

    // The caller sees in_progress immediately
    assert!(!result.success);
    assert_eq!(result.status, ProcessingStatus::InProgress);
    assert_eq!(result.data["reason"], "async_retry_scheduled");
    assert_eq!(processor.calls(), 2);

    // The background attempt completes the stage
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(Some(_)) = harness.port.get_completion_marker(id, Stage::Embedding).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("background retry completes");

    assert_eq!(processor.calls(), 3);
    let marker = harness
        .port
        .get_completion_marker(id, Stage::Embedding)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(marker.metadata["retry_count"], 2);
}

#[tokio::test]
async fn permanent_failures_never_retry() {
    let processor = Arc::new(FlakyProcessor::permanent(Stage::Classification, 10));
    let harness = TestHarness::new(vec![]);
    let (id, mut ctx) = harness.seed_document(b"pdf bytes").await;

    let result = harness
        .runner
        .safe_process(processor.clone() as Arc<dyn StageProcessor>, &mut ctx)
        .await;

    assert!(!result.success);
    assert_eq!(result.status, ProcessingStatus::Failed);
    assert_eq!(result.metadata["error_category"], "permanent");
    assert_eq!(processor.calls(), 1);

    // No marker for a failed stage
    assert!(harness
        .port
        .get_completion_marker(id, Stage::Classification)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn failures_feed_the_alert_stream() {
    use krai_pipeline::infrastructure::config::{PipelineConfig, RetryPolicyConfig};
    use krai_pipeline::infrastructure::runtime::CancellationRegistry;
    use krai_pipeline::infrastructure::services::{AlertService, MetricsService, StaticProbe};
    use krai_pipeline_domain::{AlertRule, AlertSeverity, ContentHash, Document, ProcessingContext};

    let port = Arc::new(krai_pipeline::infrastructure::repositories::MemoryDatabasePort::new());
    let mut rule = AlertRule::named("Classification Failures", AlertSeverity::Medium);
    rule.error_types = vec!["processing_error".to_string()];
    port.insert_alert_rule(&rule).await.unwrap();

    let metrics = Arc::new(MetricsService::new(port.clone(), Arc::new(StaticProbe::default())));
    let alerts = Arc::new(AlertService::new(port.clone(), metrics));

    let mut retry = PipelineConfig::default().retry;
    retry.default_policy = RetryPolicyConfig {
        max_retries: 3,
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter: false,
    };
    let runner = Arc::new(
        krai_pipeline::infrastructure::runtime::StageRunner::new(
            port.clone(),
            retry,
            Arc::new(CancellationRegistry::new()),
        )
        .with_alerts(alerts.clone()),
    );

    let document = Document::new("a.pdf", 3, ContentHash::of_bytes(b"abc"), "service_manual", "en");
    let id = port.create_document(&document).await.unwrap();
    let mut ctx = ProcessingContext::new(id, "/data/a.pdf", "service_manual");

    let processor = Arc::new(FlakyProcessor::permanent(Stage::Classification, 10));
    let result = runner
        .safe_process(processor as Arc<dyn StageProcessor>, &mut ctx)
        .await;
    assert!(!result.success);

    // One alert, aggregated under rule:error_type:stage
    let alerts_rows = port.list_alerts(10, None, None).await.unwrap();
    assert_eq!(alerts_rows.len(), 1);
    assert_eq!(
        alerts_rows[0].aggregation_key.as_deref(),
        Some("Classification Failures:processing_error:classification")
    );
    assert_eq!(alerts_rows[0].aggregation_count, 1);

    // A second failing document aggregates instead of inserting
    let other = Document::new("b.pdf", 3, ContentHash::of_bytes(b"def"), "service_manual", "en");
    let other_id = port.create_document(&other).await.unwrap();
    let mut other_ctx = ProcessingContext::new(other_id, "/data/b.pdf", "service_manual");
    let processor = Arc::new(FlakyProcessor::permanent(Stage::Classification, 10));
    let _ = runner
        .safe_process(processor as Arc<dyn StageProcessor>, &mut other_ctx)
        .await;

    let alerts_rows = port.list_alerts(10, None, None).await.unwrap();
    assert_eq!(alerts_rows.len(), 1);
    assert_eq!(alerts_rows[0].aggregation_count, 2);
}

#[tokio::test]
async fn busy_lock_reports_in_progress_without_running() {
    let processor = Arc::new(FlakyProcessor::reliable(Stage::Storage));
    let harness = TestHarness::new(vec![]);
    let (id, mut ctx) = harness.seed_document(b"pdf bytes").await;

    // Another worker holds the lock
    let key = advisory_lock_key(id, Stage::Storage);
    assert!(harness.port.try_advisory_lock(key).await.unwrap());

    let result = harness
        .runner
        .safe_process(processor.clone() as Arc<dyn StageProcessor>, &mut ctx)
        .await;

    assert_eq!(result.status, ProcessingStatus::InProgress);
    assert_eq!(result.data["reason"], "stage_lock_held");
    assert_eq!(processor.calls(), 0);

    harness.port.advisory_unlock(key).await.unwrap();
}

#[tokio::test]
async fn concurrent_runs_produce_one_process_invocation() {
    let processor = Arc::new(FlakyProcessor::reliable(Stage::Storage));
    let harness = TestHarness::new(vec![]);
    let (_, ctx) = harness.seed_document(b"pdf bytes").await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let runner = harness.runner.clone();
        let processor: Arc<dyn StageProcessor> = processor.clone();
        let mut ctx = ctx.clone();
        handles.push(tokio::spawn(async move { runner.safe_process(processor, &mut ctx).await }));
    }

    let mut completed = 0;
    let mut in_progress = 0;
    for handle in handles {
        let result = handle.await.unwrap();
        match result.status {
            ProcessingStatus::Completed => completed += 1,
            ProcessingStatus::InProgress => in_progress += 1,
            other => panic!("unexpected status {:?}", other),
        }
    }

    // At most one worker won the lock and actually processed; latecomers
    // that arrived after the marker was written skip as successes
    assert_eq!(processor.calls(), 1);
    assert!(completed >= 1);
    assert_eq!(completed + in_progress, 8);
}

#[tokio::test]
async fn database_outage_degrades_to_a_single_unlocked_run() {
    let memory = Arc::new(krai_pipeline::infrastructure::repositories::MemoryDatabasePort::new());
    let offline_port = Arc::new(OfflineTogglePort::new(memory));
    let harness = TestHarness::over_port(offline_port.clone(), vec![]);

    let processor = Arc::new(FlakyProcessor::reliable(Stage::TextExtraction));
    let (id, mut ctx) = {
        // Seed while online
        let document = krai_pipeline_domain::Document::new(
            "CX3500_SM.pdf",
            9,
            krai_pipeline_domain::ContentHash::of_bytes(b"pdf bytes"),
            "service_manual",
            "en",
        );
        let id = harness.port.create_document(&document).await.unwrap();
        let ctx = krai_pipeline_domain::ProcessingContext::new(id, "/data/m.pdf", "service_manual");
        (id, ctx)
    };

    offline_port.set_offline(true);
    let result = harness
        .runner
        .safe_process(processor.clone() as Arc<dyn StageProcessor>, &mut ctx)
        .await;
    offline_port.set_offline(false);

    // The stage still ran and its outcome propagates
    assert!(result.success);
    assert_eq!(processor.calls(), 1);

    // But nothing was persisted while offline
    assert!(harness
        .port
        .get_completion_marker(id, Stage::TextExtraction)
        .await
        .unwrap()
        .is_none());
}
