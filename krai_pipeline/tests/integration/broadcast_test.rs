// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Broadcast hub behavior: admission control, the initial snapshot,
//! ping handling, permission gating, and slow-subscriber eviction.

use std::sync::Arc;

use krai_pipeline::infrastructure::broadcast::{BroadcastHub, StaticTokenVerifier, CLOSE_POLICY_VIOLATION};
use krai_pipeline::infrastructure::config::BroadcastConfig;
use krai_pipeline::infrastructure::metrics::exporter::PipelineMetricsExporter;
use krai_pipeline::infrastructure::repositories::MemoryDatabasePort;
use krai_pipeline::infrastructure::services::{MetricsService, StaticProbe};
use krai_pipeline_domain::{
    Alert, AlertSeverity, BroadcastEventKind, BroadcastFrame, DocumentId, EventBroadcaster, Stage,
};

fn hub_with(token_verifier: StaticTokenVerifier, buffer: usize) -> Arc<BroadcastHub> {
    let port = Arc::new(MemoryDatabasePort::new());
    let metrics = Arc::new(MetricsService::new(port, Arc::new(StaticProbe::default())));
    let config = BroadcastConfig {
        subscriber_buffer: buffer,
        ..BroadcastConfig::default()
    };
    Arc::new(BroadcastHub::new(Arc::new(token_verifier), metrics, config))
}

#[tokio::test]
async fn valid_token_with_permission_is_admitted_and_snapshotted() {
    let hub = hub_with(StaticTokenVerifier::monitoring("sekrit"), 16);

    let mut subscription = hub.subscribe("sekrit").await.expect("admitted");
    assert_eq!(hub.subscriber_count(), 1);

    let snapshot = subscription.receiver.recv().await.expect("snapshot frame");
    assert_eq!(snapshot.kind, BroadcastEventKind::InitialData);
    assert!(snapshot.data.get("pipeline").is_some());
    assert!(snapshot.data.get("queue").is_some());
    assert!(snapshot.data.get("hardware").is_some());
}

#[tokio::test]
async fn invalid_tokens_are_rejected_with_policy_violation() {
    let hub = hub_with(StaticTokenVerifier::monitoring("sekrit"), 16);

    let error = hub.subscribe("wrong").await.unwrap_err();
    assert_eq!(error.close_code, CLOSE_POLICY_VIOLATION);
    assert_eq!(hub.subscriber_count(), 0);
}

#[tokio::test]
async fn missing_permission_is_rejected() {
    let verifier = StaticTokenVerifier::new("sekrit", "viewer", vec!["search:read".to_string()]);
    let hub = hub_with(verifier, 16);

    let error = hub.subscribe("sekrit").await.unwrap_err();
    assert_eq!(error.close_code, CLOSE_POLICY_VIOLATION);
    assert_eq!(error.reason, "Insufficient permissions");
}

#[tokio::test]
async fn ping_frames_earn_a_pong() {
    let hub = hub_with(StaticTokenVerifier::monitoring("sekrit"), 16);
    let subscription = hub.subscribe("sekrit").await.unwrap();

    assert_eq!(hub.handle_client_frame(subscription.id, "ping"), Some("pong"));
    assert_eq!(hub.handle_client_frame(subscription.id, "anything else"), None);
}

#[tokio::test]
async fn stage_events_reach_authorized_subscribers() {
    let hub = hub_with(StaticTokenVerifier::monitoring("sekrit"), 16);
    let mut subscription = hub.subscribe("sekrit").await.unwrap();
    // Drain the snapshot
    let _ = subscription.receiver.recv().await;

    let document_id = DocumentId::new();
    hub.stage_event(
        BroadcastEventKind::StageCompleted,
        Stage::Embedding,
        Some(document_id),
        "completed",
    );

    let frame = subscription.receiver.recv().await.expect("stage frame");
    assert_eq!(frame.kind, BroadcastEventKind::StageCompleted);
    assert_eq!(frame.data["stage"], "embedding");
    assert_eq!(frame.data["document_id"], document_id.to_string());
}

#[tokio::test]
async fn alert_events_are_fanned_out() {
    let hub = hub_with(StaticTokenVerifier::monitoring("sekrit"), 16);
    let mut subscription = hub.subscribe("sekrit").await.unwrap();
    let _ = subscription.receiver.recv().await;

    let alert = Alert::new("processing_error", AlertSeverity::High, "High Error Rate");
    hub.alert_event(&alert);

    let frame = subscription.receiver.recv().await.expect("alert frame");
    assert_eq!(frame.kind, BroadcastEventKind::AlertTriggered);
    assert_eq!(frame.data["title"], "High Error Rate");
}

#[tokio::test]
async fn slow_subscribers_are_dropped_instead_of_blocking() {
    // Buffer of one: the snapshot fills it and the subscriber never reads
    let hub = hub_with(StaticTokenVerifier::monitoring("sekrit"), 1);
    let subscription = hub.subscribe("sekrit").await.unwrap();
    assert_eq!(hub.subscriber_count(), 1);

    hub.broadcast(
        BroadcastFrame::new(BroadcastEventKind::PipelineUpdate, serde_json::json!({})),
        None,
    );

    assert_eq!(hub.subscriber_count(), 0);
    drop(subscription);
}

#[tokio::test]
async fn delivered_frames_increment_the_prometheus_counter() {
    let port = Arc::new(MemoryDatabasePort::new());
    let metrics = Arc::new(MetricsService::new(port, Arc::new(StaticProbe::default())));
    let exporter = Arc::new(PipelineMetricsExporter::new().unwrap());
    let hub = Arc::new(
        BroadcastHub::new(
            Arc::new(StaticTokenVerifier::monitoring("sekrit")),
            metrics,
            BroadcastConfig::default(),
        )
        .with_exporter(exporter.clone()),
    );

    let mut subscription = hub.subscribe("sekrit").await.unwrap();
    let _ = subscription.receiver.recv().await; // snapshot

    hub.broadcast(
        BroadcastFrame::new(BroadcastEventKind::PipelineUpdate, serde_json::json!({})),
        None,
    );
    let _ = subscription.receiver.recv().await;

    // Snapshot plus one broadcast frame
    assert_eq!(hub.frames_sent(), 2);
    let rendered = exporter.gather().unwrap();
    assert!(
        rendered.contains("krai_pipeline_broadcast_frames_total 2"),
        "counter missing from exposition: {}",
        rendered
    );
}

#[tokio::test]
async fn disconnect_removes_the_subscriber() {
    let hub = hub_with(StaticTokenVerifier::monitoring("sekrit"), 16);
    let subscription = hub.subscribe("sekrit").await.unwrap();
    assert_eq!(hub.subscriber_count(), 1);

    hub.disconnect(subscription.id);
    assert_eq!(hub.subscriber_count(), 0);
}
