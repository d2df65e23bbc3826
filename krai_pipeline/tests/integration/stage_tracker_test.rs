// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Stage tracker behavior: state transitions through the stored
//! procedures, progress normalization, broadcast emission, and the
//! missing-procedure degradation latch.

use std::sync::Arc;

use krai_pipeline::infrastructure::repositories::MemoryDatabasePort;
use krai_pipeline::infrastructure::services::{StageContext, StageTracker};
use krai_pipeline_domain::{
    BroadcastEventKind, ContentHash, DatabasePort, Document, EventBroadcaster, Stage, StageStatus,
};

use crate::common::RecordingBroadcaster;

async fn seeded_port() -> (Arc<MemoryDatabasePort>, krai_pipeline_domain::DocumentId) {
    let port = Arc::new(MemoryDatabasePort::new());
    let document = Document::new(
        "CX3500_SM.pdf",
        1024,
        ContentHash::of_bytes(b"tracker bytes"),
        "service_manual",
        "en",
    );
    let id = port.create_document(&document).await.unwrap();
    (port, id)
}

#[tokio::test]
async fn full_stage_lifecycle_updates_the_stage_map() {
    let (port, id) = seeded_port().await;
    let tracker = StageTracker::new(port.clone(), "krai");

    tracker.start_stage(id, Stage::Upload).await.unwrap();
    tracker
        .update_progress(id, Stage::Upload, Some(40.0), None)
        .await
        .unwrap();
    tracker.complete_stage(id, Stage::Upload, None).await.unwrap();

    let statuses = tracker.get_stage_status(id).await;
    let upload = statuses.get(&Stage::Upload).expect("upload tracked");
    assert_eq!(upload.status, StageStatus::Completed);
    assert_eq!(upload.progress_percent, 100.0);
    assert!(upload.started_at.is_some());
    assert!(upload.completed_at.is_some());

    assert!(tracker.can_start_stage(id, Stage::TextExtraction).await);
    assert_eq!(tracker.get_current_stage(id).await, "text_extraction");
    assert!(tracker.get_progress(id).await > 0.0);
}

#[tokio::test]
async fn fractional_and_percent_progress_store_identically() {
    let (port, id) = seeded_port().await;
    let tracker = StageTracker::new(port.clone(), "krai");

    tracker.start_stage(id, Stage::TextExtraction).await.unwrap();
    tracker
        .update_progress(id, Stage::TextExtraction, Some(0.75), None)
        .await
        .unwrap();
    let as_fraction = tracker.get_stage_status(id).await[&Stage::TextExtraction].progress_percent;

    tracker
        .update_progress(id, Stage::TextExtraction, Some(75.0), None)
        .await
        .unwrap();
    let as_percent = tracker.get_stage_status(id).await[&Stage::TextExtraction].progress_percent;

    assert_eq!(as_fraction, 75.0);
    assert_eq!(as_percent, 75.0);

    // The fraction path annotates the metadata
    let statuses = tracker.get_stage_status(id).await;
    let state = &statuses[&Stage::TextExtraction];
    assert_eq!(state.metadata["progress_scale_adjusted"], serde_json::json!(true));
}

#[tokio::test]
async fn failed_stage_records_the_error() {
    let (port, id) = seeded_port().await;
    let tracker = StageTracker::new(port.clone(), "krai");

    tracker.start_stage(id, Stage::Classification).await.unwrap();
    tracker
        .fail_stage(id, Stage::Classification, "model returned garbage", None)
        .await
        .unwrap();

    let statuses = tracker.get_stage_status(id).await;
    let state = &statuses[&Stage::Classification];
    assert_eq!(state.status, StageStatus::Failed);
    assert_eq!(state.error.as_deref(), Some("model returned garbage"));
}

#[tokio::test]
async fn transitions_emit_broadcast_events() {
    let (port, id) = seeded_port().await;
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let tracker =
        StageTracker::new(port.clone(), "krai").with_broadcaster(broadcaster.clone() as Arc<dyn EventBroadcaster>);

    tracker.start_stage(id, Stage::Upload).await.unwrap();
    tracker.complete_stage(id, Stage::Upload, None).await.unwrap();
    tracker.start_stage(id, Stage::TextExtraction).await.unwrap();
    tracker
        .fail_stage(id, Stage::TextExtraction, "boom", None)
        .await
        .unwrap();

    let completed = broadcaster.stage_events_of(BroadcastEventKind::StageCompleted);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].0, Stage::Upload);
    assert_eq!(completed[0].2, "completed");

    let failed = broadcaster.stage_events_of(BroadcastEventKind::StageFailed);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, Stage::TextExtraction);

    // Processor state changes accompany starts, completions, and failures
    let state_changes = broadcaster.stage_events_of(BroadcastEventKind::ProcessorStateChange);
    assert!(state_changes.len() >= 4);
}

#[tokio::test]
async fn missing_procedures_latch_tracking_off() {
    let port = Arc::new(MemoryDatabasePort::without_procedures());
    let document = Document::new(
        "CX3500_SM.pdf",
        1024,
        ContentHash::of_bytes(b"degraded bytes"),
        "service_manual",
        "en",
    );
    let id = port.create_document(&document).await.unwrap();
    let tracker = StageTracker::new(port.clone(), "krai");

    assert!(tracker.rpc_enabled());

    // The first mutator hits the missing function and disables RPC, but
    // still reports success so the pipeline keeps moving
    tracker.start_stage(id, Stage::Upload).await.unwrap();
    assert!(!tracker.rpc_enabled());

    // Every further mutator is a successful no-op
    tracker
        .update_progress(id, Stage::Upload, Some(50.0), None)
        .await
        .unwrap();
    tracker.complete_stage(id, Stage::Upload, None).await.unwrap();
    tracker.fail_stage(id, Stage::Upload, "x", None).await.unwrap();
    tracker.skip_stage(id, Stage::Upload, "x").await.unwrap();

    // Queries return empty and permissive values
    assert_eq!(tracker.get_progress(id).await, 0.0);
    assert_eq!(tracker.get_current_stage(id).await, "unknown");
    assert!(tracker.can_start_stage(id, Stage::SearchIndexing).await);

    // Nothing was written to the stage map
    let stored = port.get_document(id).await.unwrap().unwrap();
    assert!(stored.stage_status.is_empty());
}

#[tokio::test]
async fn stage_context_guard_records_the_outcome() {
    let (port, id) = seeded_port().await;
    let tracker = StageTracker::new(port.clone(), "krai");

    let mut guard = StageContext::enter(&tracker, id, Stage::ImageProcessing).await.unwrap();
    guard.update_progress(30.0, Some(serde_json::json!({"images_found": 12}))).await;
    guard.set_metadata("images_stored", serde_json::json!(12));
    guard.complete().await.unwrap();

    let statuses = tracker.get_stage_status(id).await;
    let state = &statuses[&Stage::ImageProcessing];
    assert_eq!(state.status, StageStatus::Completed);
    assert_eq!(state.metadata["images_found"], 12);
    assert_eq!(state.metadata["images_stored"], 12);

    let mut failing = StageContext::enter(&tracker, id, Stage::LinkExtraction).await.unwrap();
    failing.set_metadata("links_seen", serde_json::json!(3));
    failing.fail("no anchor targets resolved").await.unwrap();

    let statuses = tracker.get_stage_status(id).await;
    assert_eq!(statuses[&Stage::LinkExtraction].status, StageStatus::Failed);
}

#[tokio::test]
async fn statistics_summarize_across_documents() {
    let (port, id) = seeded_port().await;
    let tracker = StageTracker::new(port.clone(), "krai");

    tracker.start_stage(id, Stage::Upload).await.unwrap();
    tracker.complete_stage(id, Stage::Upload, None).await.unwrap();
    tracker.start_stage(id, Stage::TextExtraction).await.unwrap();
    tracker
        .fail_stage(id, Stage::TextExtraction, "boom", None)
        .await
        .unwrap();

    let statistics = tracker.get_statistics().await;
    assert_eq!(statistics["upload"].completed_count, 1);
    assert_eq!(statistics["text_extraction"].failed_count, 1);
    assert_eq!(statistics["upload"].success_rate, 100.0);
}
