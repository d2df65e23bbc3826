// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Alert service behavior: stream-driven aggregation, threshold
//! evaluation against live metrics, rule management, and dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use krai_pipeline::infrastructure::repositories::MemoryDatabasePort;
use krai_pipeline::infrastructure::services::{
    AlertService, MetricsService, NotificationSink, StaticProbe,
};
use krai_pipeline_domain::{
    Alert, AlertRule, AlertSeverity, AlertStatus, DatabasePort, ErrorEvent, EventBroadcaster, HardwareStatus,
    PipelineError, Stage,
};

use crate::common::RecordingBroadcaster;

/// Sink that records deliveries instead of sending them.
#[derive(Default)]
struct RecordingSink {
    deliveries: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn deliver(&self, alert: &Alert, rule: &AlertRule) -> Result<(), PipelineError> {
        self.deliveries
            .lock()
            .push((alert.title.clone(), rule.rule_name.clone()));
        Ok(())
    }
}

fn processing_rule() -> AlertRule {
    let mut rule = AlertRule::named("High Error Rate", AlertSeverity::High);
    rule.error_types = vec!["processing_error".to_string()];
    rule.stages = vec![Stage::TextExtraction];
    rule.severity_threshold = Some(AlertSeverity::High);
    rule
}

fn event(error_type: &str, stage: Stage, severity: AlertSeverity) -> ErrorEvent {
    ErrorEvent {
        error_type: error_type.to_string(),
        stage,
        severity,
        message: "Failed to extract text".to_string(),
        document_id: None,
        correlation_id: Some("req_0a1b2c3d.text_extraction.retry_0".to_string()),
    }
}

fn service_over(port: Arc<MemoryDatabasePort>, hardware: HardwareStatus) -> AlertService {
    let metrics = Arc::new(MetricsService::new(port.clone(), Arc::new(StaticProbe::new(hardware))));
    AlertService::new(port, metrics)
}

#[tokio::test]
async fn matching_error_event_creates_a_pending_alert() {
    let port = Arc::new(MemoryDatabasePort::new());
    port.insert_alert_rule(&processing_rule()).await.unwrap();
    let service = service_over(port.clone(), HardwareStatus::default());

    let id = service
        .queue_alert(&event("processing_error", Stage::TextExtraction, AlertSeverity::High))
        .await
        .expect("alert created");

    let alerts = port.list_alerts(10, None, None).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].id, id);
    assert_eq!(alerts[0].aggregation_count, 1);
    assert_eq!(
        alerts[0].aggregation_key.as_deref(),
        Some("High Error Rate:processing_error:text_extraction")
    );
    assert_eq!(alerts[0].status, AlertStatus::Pending);
}

#[tokio::test]
async fn repeated_events_aggregate_onto_one_row() {
    let port = Arc::new(MemoryDatabasePort::new());
    port.insert_alert_rule(&processing_rule()).await.unwrap();
    let service = service_over(port.clone(), HardwareStatus::default());

    let first = service
        .queue_alert(&event("processing_error", Stage::TextExtraction, AlertSeverity::High))
        .await
        .unwrap();
    let second = service
        .queue_alert(&event("processing_error", Stage::TextExtraction, AlertSeverity::Critical))
        .await
        .unwrap();
    let third = service
        .queue_alert(&event("processing_error", Stage::TextExtraction, AlertSeverity::High))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(second, third);

    // Exactly one row with that aggregation key, count grown monotonically
    let alerts = port.list_alerts(10, None, None).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].aggregation_count, 3);
}

#[tokio::test]
async fn unmatched_events_produce_no_alert() {
    let port = Arc::new(MemoryDatabasePort::new());
    port.insert_alert_rule(&processing_rule()).await.unwrap();
    let service = service_over(port.clone(), HardwareStatus::default());

    // Wrong error type
    assert!(service
        .queue_alert(&event("embedding_error", Stage::TextExtraction, AlertSeverity::High))
        .await
        .is_none());
    // Wrong stage
    assert!(service
        .queue_alert(&event("processing_error", Stage::Embedding, AlertSeverity::High))
        .await
        .is_none());
    // Below the severity threshold
    assert!(service
        .queue_alert(&event("processing_error", Stage::TextExtraction, AlertSeverity::Medium))
        .await
        .is_none());

    assert!(port.list_alerts(10, None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn threshold_breach_creates_one_alert_until_resolution() {
    let port = Arc::new(MemoryDatabasePort::new());
    // CPU pinned over the default 90% threshold
    let hot = HardwareStatus {
        cpu_percent: 97.0,
        ram_percent: 10.0,
        ..HardwareStatus::default()
    };
    let broadcaster = Arc::new(RecordingBroadcaster::default());
    let sink = Arc::new(RecordingSink::default());
    let metrics = Arc::new(MetricsService::new(port.clone(), Arc::new(StaticProbe::new(hot))));
    let service = AlertService::new(port.clone(), metrics)
        .with_broadcaster(broadcaster.clone() as Arc<dyn EventBroadcaster>)
        .with_sink(sink.clone());

    let first_pass = service.evaluate_alerts().await;
    assert_eq!(first_pass.len(), 1);
    assert_eq!(first_pass[0].title, "High CPU Usage");

    // Breach persists: the rule stays quiet while its alert is active
    let second_pass = service.evaluate_alerts().await;
    assert!(second_pass.is_empty());
    assert_eq!(port.list_alerts(10, None, None).await.unwrap().len(), 1);

    // Alert reached the broadcaster and the sink
    assert_eq!(broadcaster.alerts.lock().len(), 1);
    assert_eq!(sink.deliveries.lock().len(), 1);
}

#[tokio::test]
async fn acknowledging_rearms_the_rule() {
    let port = Arc::new(MemoryDatabasePort::new());
    let hot = HardwareStatus {
        cpu_percent: 97.0,
        ..HardwareStatus::default()
    };
    let service = service_over(port.clone(), hot);

    let first = service.evaluate_alerts().await;
    assert_eq!(first.len(), 1);
    let alert_id = first[0].id;

    assert!(service.acknowledge_alert(alert_id, "ops-user").await.unwrap());
    let alerts = port.list_alerts(10, None, None).await.unwrap();
    assert!(alerts[0].acknowledged);
    assert_eq!(alerts[0].acknowledged_by.as_deref(), Some("ops-user"));

    // The active entry was cleared; the persisting breach re-alerts
    let again = service.evaluate_alerts().await;
    assert_eq!(again.len(), 1);
    assert_ne!(again[0].id, alert_id);
}

#[tokio::test]
async fn dismiss_removes_the_row() {
    let port = Arc::new(MemoryDatabasePort::new());
    let service = service_over(port.clone(), HardwareStatus::default());
    port.insert_alert_rule(&processing_rule()).await.unwrap();

    let id = service
        .queue_alert(&event("processing_error", Stage::TextExtraction, AlertSeverity::High))
        .await
        .unwrap();

    assert!(service.dismiss_alert(id).await.unwrap());
    assert!(port.list_alerts(10, None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn alert_listing_filters_by_severity() {
    let port = Arc::new(MemoryDatabasePort::new());
    let service = service_over(port.clone(), HardwareStatus::default());

    let mut high = Alert::new("processing_error", AlertSeverity::High, "High one");
    high.aggregation_key = Some("a".to_string());
    port.insert_alert(&high).await.unwrap();
    let mut medium = Alert::new("processing_error", AlertSeverity::Medium, "Medium one");
    medium.aggregation_key = Some("b".to_string());
    port.insert_alert(&medium).await.unwrap();

    let response = service.get_alerts(50, Some(AlertSeverity::High), None).await;
    assert_eq!(response.total, 1);
    assert_eq!(response.alerts[0].title, "High one");
    assert_eq!(response.unacknowledged_count, 2);
}

#[tokio::test]
async fn empty_rule_table_falls_back_to_defaults() {
    let port = Arc::new(MemoryDatabasePort::new());
    let service = service_over(port.clone(), HardwareStatus::default());

    let rules = service.rules().await;
    assert_eq!(rules.len(), AlertService::default_rules().len());
    assert!(rules.iter().all(|rule| rule.enabled));
}

#[tokio::test]
async fn stored_rules_replace_defaults_wholesale() {
    let port = Arc::new(MemoryDatabasePort::new());
    port.insert_alert_rule(&processing_rule()).await.unwrap();
    let service = service_over(port.clone(), HardwareStatus::default());

    let rules = service.rules().await;
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].rule_name, "High Error Rate");
}

#[tokio::test]
async fn rule_management_invalidates_the_cache() {
    let port = Arc::new(MemoryDatabasePort::new());
    let service = service_over(port.clone(), HardwareStatus::default());

    // Prime the cache with defaults
    assert_eq!(service.rules().await.len(), AlertService::default_rules().len());

    service.add_alert_rule(&processing_rule()).await.unwrap();
    let rules = service.rules().await;
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].rule_name, "High Error Rate");
}
