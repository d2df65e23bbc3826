// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Metrics service behavior: read-through caching, invalidation, and
//! zero-valued degradation when the store is unreachable.

use std::sync::Arc;

use parking_lot::Mutex;

use krai_pipeline::infrastructure::repositories::MemoryDatabasePort;
use krai_pipeline::infrastructure::services::{HardwareProbe, MetricsService, StaticProbe};
use krai_pipeline_domain::{
    ContentHash, DatabasePort, Document, HardwareStatus, PipelineMetrics, ProcessingStatus, QueueItem,
    QueueMetrics,
};

use crate::common::OfflineTogglePort;

/// Probe that counts how often it was sampled.
struct CountingProbe {
    samples: Mutex<u32>,
}

impl CountingProbe {
    fn new() -> Self {
        Self { samples: Mutex::new(0) }
    }
}

impl HardwareProbe for CountingProbe {
    fn sample(&self) -> HardwareStatus {
        *self.samples.lock() += 1;
        HardwareStatus {
            cpu_percent: 12.0,
            ..HardwareStatus::default()
        }
    }
}

async fn seed_documents(port: &MemoryDatabasePort) {
    for (name, bytes, status) in [
        ("a.pdf", b"aaa".as_slice(), ProcessingStatus::Completed),
        ("b.pdf", b"bbb".as_slice(), ProcessingStatus::Completed),
        ("c.pdf", b"ccc".as_slice(), ProcessingStatus::Failed),
        ("d.pdf", b"ddd".as_slice(), ProcessingStatus::Pending),
    ] {
        let document = Document::new(name, bytes.len() as u64, ContentHash::of_bytes(bytes), "service_manual", "en");
        let id = port.create_document(&document).await.unwrap();
        port.update_document_status(id, status).await.unwrap();
    }
}

#[tokio::test]
async fn pipeline_metrics_aggregate_document_counts() {
    let port = Arc::new(MemoryDatabasePort::new());
    seed_documents(&port).await;
    let service = MetricsService::new(port.clone(), Arc::new(StaticProbe::default()));

    let metrics = service.get_pipeline_metrics().await;
    assert_eq!(metrics.total_documents, 4);
    assert_eq!(metrics.documents_completed, 2);
    assert_eq!(metrics.documents_failed, 1);
    assert_eq!(metrics.documents_pending, 1);
    // 2 completed out of 3 finished
    assert!((metrics.success_rate - 200.0 / 3.0).abs() < 0.01);
}

#[tokio::test]
async fn queue_metrics_break_down_by_task_type() {
    let port = Arc::new(MemoryDatabasePort::new());
    port.create_queue_item(&QueueItem::new("document_processing")).await.unwrap();
    port.create_queue_item(&QueueItem::new("document_processing")).await.unwrap();
    port.create_queue_item(&QueueItem::new("batch_delete")).await.unwrap();

    let service = MetricsService::new(port.clone(), Arc::new(StaticProbe::default()));
    let metrics = service.get_queue_metrics().await;
    assert_eq!(metrics.total_items, 3);
    assert_eq!(metrics.pending_count, 3);
    assert_eq!(metrics.by_task_type["document_processing"], 2);
    assert_eq!(metrics.by_task_type["batch_delete"], 1);
}

#[tokio::test]
async fn hardware_reads_are_cached_within_the_ttl() {
    let port = Arc::new(MemoryDatabasePort::new());
    let probe = Arc::new(CountingProbe::new());
    let service = MetricsService::new(port, probe.clone());

    let first = service.get_hardware_metrics().await;
    let second = service.get_hardware_metrics().await;
    assert_eq!(first, second);
    // The second read came from cache
    assert_eq!(*probe.samples.lock(), 1);

    service.invalidate_cache(Some("hardware_metrics"));
    let _ = service.get_hardware_metrics().await;
    assert_eq!(*probe.samples.lock(), 2);
}

#[tokio::test]
async fn global_invalidation_clears_every_key() {
    let port = Arc::new(MemoryDatabasePort::new());
    seed_documents(&port).await;
    let probe = Arc::new(CountingProbe::new());
    let service = MetricsService::new(port.clone(), probe.clone());

    let _ = service.get_pipeline_metrics().await;
    let _ = service.get_hardware_metrics().await;
    service.invalidate_cache(None);
    let _ = service.get_hardware_metrics().await;
    assert_eq!(*probe.samples.lock(), 2);
}

#[tokio::test]
async fn upstream_errors_degrade_to_zero_valued_metrics() {
    let memory = Arc::new(MemoryDatabasePort::new());
    seed_documents(&memory).await;
    let offline = Arc::new(OfflineTogglePort::new(memory));
    let service = MetricsService::new(offline.clone(), Arc::new(StaticProbe::default()));

    offline.set_offline(true);
    assert_eq!(service.get_pipeline_metrics().await, PipelineMetrics::default());
    assert_eq!(service.get_queue_metrics().await, QueueMetrics::default());
    assert!(service.get_stage_metrics().await.is_empty());
    let quality = service.get_data_quality_metrics().await;
    assert_eq!(quality.processing_metrics.total_processed, 0);

    // Back online, real numbers flow again
    offline.set_offline(false);
    let metrics = service.get_pipeline_metrics().await;
    assert_eq!(metrics.total_documents, 4);
}

#[tokio::test]
async fn validation_metrics_count_failed_stage_states() {
    let port = Arc::new(MemoryDatabasePort::new());
    let document = Document::new("e.pdf", 3, ContentHash::of_bytes(b"eee"), "service_manual", "en");
    let id = port.create_document(&document).await.unwrap();
    port.execute_rpc(
        "krai_core.start_stage",
        serde_json::json!({"p_document_id": id.to_string(), "p_stage_name": "text_extraction"}),
    )
    .await
    .unwrap();
    port.execute_rpc(
        "krai_core.fail_stage",
        serde_json::json!({
            "p_document_id": id.to_string(),
            "p_stage_name": "text_extraction",
            "p_error": "OCR failed",
        }),
    )
    .await
    .unwrap();

    let service = MetricsService::new(port.clone(), Arc::new(StaticProbe::default()));
    let metrics = service.get_validation_metrics().await;
    assert_eq!(metrics.total_validation_errors, 1);
    assert_eq!(metrics.errors_by_stage["text_extraction"], 1);
    assert_eq!(metrics.documents_with_errors[0]["error"], "OCR failed");
}
