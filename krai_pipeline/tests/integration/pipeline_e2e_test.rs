// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! End-to-end pipeline runs: happy path across all fifteen stages,
//! deduplicated resubmission, critical versus non-critical failures,
//! suspension on background retries, and cancellation.

use std::sync::Arc;

use krai_pipeline::application::services::document_pipeline::PipelineRunOutcome;
use krai_pipeline::application::use_cases::ingest_document::{IngestDocument, IngestOutcome};
use krai_pipeline::infrastructure::config::PipelineConfig;
use krai_pipeline::presentation::validation::RequestValidator;
use krai_pipeline_domain::{
    BroadcastEventKind, DatabasePort, ProcessingStatus, Stage, StageProcessor, StageStatus,
};

use crate::common::{FlakyProcessor, TestHarness};

fn full_registry() -> Vec<Arc<dyn StageProcessor>> {
    Stage::ALL
        .iter()
        .map(|stage| Arc::new(FlakyProcessor::reliable(*stage)) as Arc<dyn StageProcessor>)
        .collect()
}

/// Bytes with a PDF magic header so upload validation passes
fn pdf_bytes(seed: u8) -> Vec<u8> {
    let mut bytes = b"%PDF-1.7\n".to_vec();
    bytes.extend(std::iter::repeat(seed).take(2048));
    bytes
}

#[tokio::test]
async fn happy_path_completes_every_stage() {
    let harness = TestHarness::new(full_registry());
    let (id, mut ctx) = harness.seed_document(&pdf_bytes(1)).await;

    let outcome = harness.sequencer.process_document(&mut ctx).await;
    assert_eq!(outcome, PipelineRunOutcome::Completed);

    let document = harness.port.get_document(id).await.unwrap().unwrap();
    assert_eq!(document.processing_status, ProcessingStatus::Completed);
    assert_eq!(document.stage_status.len(), Stage::ALL.len());
    for stage in Stage::ALL {
        assert_eq!(
            document.stage_status[&stage].status,
            StageStatus::Completed,
            "stage {} should be completed",
            stage
        );
        assert!(harness
            .port
            .get_completion_marker(id, stage)
            .await
            .unwrap()
            .is_some());
    }

    // One stage_completed broadcast per stage
    let completed_events = harness.broadcaster.stage_events_of(BroadcastEventKind::StageCompleted);
    assert_eq!(completed_events.len(), Stage::ALL.len());

    // The aggregated view sees the completion
    let view = harness.port.pipeline_metrics_view().await.unwrap();
    assert_eq!(view.documents_completed, 1);
    assert_eq!(view.total_documents, 1);
}

#[tokio::test]
async fn stages_without_processors_are_skipped() {
    // Only upload and embedding are registered
    let processors: Vec<Arc<dyn StageProcessor>> = vec![
        Arc::new(FlakyProcessor::reliable(Stage::Upload)),
        Arc::new(FlakyProcessor::reliable(Stage::Embedding)),
    ];
    let harness = TestHarness::new(processors);
    let (id, mut ctx) = harness.seed_document(&pdf_bytes(2)).await;

    let outcome = harness.sequencer.process_document(&mut ctx).await;
    assert_eq!(outcome, PipelineRunOutcome::Completed);

    let document = harness.port.get_document(id).await.unwrap().unwrap();
    assert_eq!(document.stage_status[&Stage::Upload].status, StageStatus::Completed);
    assert_eq!(document.stage_status[&Stage::Embedding].status, StageStatus::Completed);
    assert_eq!(
        document.stage_status[&Stage::TextExtraction].status,
        StageStatus::Skipped
    );
}

#[tokio::test]
async fn resubmitting_identical_bytes_is_a_duplicate() {
    let harness = TestHarness::new(full_registry());
    let validator = Arc::new(RequestValidator::new(PipelineConfig::default().security));
    let ingest = IngestDocument::new(harness.port.clone(), harness.sequencer.clone(), validator);

    let bytes = pdf_bytes(3);
    let first = ingest
        .ingest_bytes(
            "CX3500_SM.pdf",
            "application/pdf",
            &bytes,
            "service_manual",
            "en",
            std::path::Path::new("/data/CX3500_SM.pdf"),
        )
        .await
        .unwrap();
    let IngestOutcome::Processed { document_id, run } = first else {
        panic!("first submission must process");
    };
    assert_eq!(run, PipelineRunOutcome::Completed);

    let events_after_first = harness
        .broadcaster
        .stage_events_of(BroadcastEventKind::StageCompleted)
        .len();

    // Same bytes again: same document, no new work, no new events
    let second = ingest
        .ingest_bytes(
            "renamed_copy.pdf",
            "application/pdf",
            &bytes,
            "service_manual",
            "en",
            std::path::Path::new("/data/renamed_copy.pdf"),
        )
        .await
        .unwrap();
    assert_eq!(second, IngestOutcome::Duplicate { document_id });

    let documents = harness.port.list_documents(10).await.unwrap();
    assert_eq!(documents.len(), 1);
    let events_after_second = harness
        .broadcaster
        .stage_events_of(BroadcastEventKind::StageCompleted)
        .len();
    assert_eq!(events_after_first, events_after_second);
}

#[tokio::test]
async fn files_on_disk_ingest_through_the_same_path() {
    let harness = TestHarness::new(full_registry());
    let validator = Arc::new(RequestValidator::new(PipelineConfig::default().security));
    let ingest = IngestDocument::new(harness.port.clone(), harness.sequencer.clone(), validator);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("WF4800_PC.pdf");
    std::fs::write(&path, pdf_bytes(9)).unwrap();

    let outcome = ingest.ingest_file(&path, "parts_catalog", "en").await.unwrap();
    let IngestOutcome::Processed { document_id, run } = outcome else {
        panic!("file ingest must process");
    };
    assert_eq!(run, PipelineRunOutcome::Completed);

    let document = harness.port.get_document(document_id).await.unwrap().unwrap();
    assert_eq!(document.filename, "WF4800_PC.pdf");
    assert_eq!(document.document_type, "parts_catalog");
}

#[tokio::test]
async fn rejected_uploads_create_no_document() {
    let harness = TestHarness::new(full_registry());
    let validator = Arc::new(RequestValidator::new(PipelineConfig::default().security));
    let ingest = IngestDocument::new(harness.port.clone(), harness.sequencer.clone(), validator);

    let result = ingest
        .ingest_bytes(
            "../etc/passwd",
            "application/pdf",
            &pdf_bytes(4),
            "service_manual",
            "en",
            std::path::Path::new("/tmp/upload"),
        )
        .await;

    let error = result.unwrap_err().to_string();
    assert!(error.contains("INVALID_FILENAME"), "got: {}", error);
    assert!(harness.port.list_documents(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn critical_stage_failure_fails_the_document() {
    // chunk_prep is critical in the default table and fails permanently
    let mut processors = full_registry();
    processors.push(Arc::new(FlakyProcessor::permanent(Stage::ChunkPrep, 99)));
    let harness = TestHarness::new(processors);
    let (id, mut ctx) = harness.seed_document(&pdf_bytes(5)).await;

    let outcome = harness.sequencer.process_document(&mut ctx).await;
    let PipelineRunOutcome::Failed { stage, .. } = outcome else {
        panic!("expected a failed run, got {:?}", outcome);
    };
    assert_eq!(stage, Stage::ChunkPrep);

    let document = harness.port.get_document(id).await.unwrap().unwrap();
    assert_eq!(document.processing_status, ProcessingStatus::Failed);
    assert_eq!(document.stage_status[&Stage::ChunkPrep].status, StageStatus::Failed);
    // Later stages never started
    assert!(!document.stage_status.contains_key(&Stage::Embedding));
}

#[tokio::test]
async fn non_critical_stage_failure_lets_the_run_continue() {
    // svg_processing is non-critical in the default table
    let mut processors = full_registry();
    processors.push(Arc::new(FlakyProcessor::permanent(Stage::SvgProcessing, 99)));
    let harness = TestHarness::new(processors);
    let (id, mut ctx) = harness.seed_document(&pdf_bytes(6)).await;

    let outcome = harness.sequencer.process_document(&mut ctx).await;
    assert_eq!(outcome, PipelineRunOutcome::Completed);

    let document = harness.port.get_document(id).await.unwrap().unwrap();
    assert_eq!(document.processing_status, ProcessingStatus::Completed);
    assert_eq!(
        document.stage_status[&Stage::SvgProcessing].status,
        StageStatus::Failed
    );
    assert_eq!(document.stage_status[&Stage::SearchIndexing].status, StageStatus::Completed);
}

#[tokio::test]
async fn background_retry_resumes_the_suspended_run() {
    // embedding fails twice: the run suspends, the background retry
    // succeeds and the sequencer advances to search_indexing
    let mut processors = full_registry();
    processors.push(Arc::new(FlakyProcessor::transient(Stage::Embedding, 2)));
    let harness = TestHarness::new(processors);
    let (id, mut ctx) = harness.seed_document(&pdf_bytes(7)).await;

    let outcome = harness.sequencer.process_document(&mut ctx).await;
    assert_eq!(outcome, PipelineRunOutcome::Suspended { stage: Stage::Embedding });

    // The background retry completes the stage and re-enters the
    // sequencer, which finishes the document
    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        loop {
            let document = harness.port.get_document(id).await.unwrap().unwrap();
            if document.processing_status == ProcessingStatus::Completed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("background retry finishes the run");

    let document = harness.port.get_document(id).await.unwrap().unwrap();
    assert_eq!(document.stage_status[&Stage::Embedding].status, StageStatus::Completed);
    assert_eq!(document.stage_status[&Stage::SearchIndexing].status, StageStatus::Completed);

    let marker = harness
        .port
        .get_completion_marker(id, Stage::Embedding)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(marker.metadata["retry_count"], 2);
}

#[tokio::test]
async fn cancellation_stops_the_run_between_stages() {
    let harness = TestHarness::new(full_registry());
    let (id, mut ctx) = harness.seed_document(&pdf_bytes(8)).await;

    harness.sequencer.cancel_document(id).await.unwrap();
    let outcome = harness.sequencer.process_document(&mut ctx).await;
    assert_eq!(outcome, PipelineRunOutcome::Cancelled);

    let document = harness.port.get_document(id).await.unwrap().unwrap();
    assert_eq!(document.processing_status, ProcessingStatus::Cancelled);
}
