// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Alert Service
//!
//! Rule-driven alerting over two inputs:
//!
//! - **Threshold evaluation**: `evaluate_alerts` pulls current metrics and
//!   compares the scalar selected by each enabled rule's `metric_key`
//!   (with a name-based fallback for older rules) against the rule's
//!   threshold. A breach raises one alert per rule; while that alert is
//!   active the rule stays quiet, and when the breach resolves the rule is
//!   re-armed so the next breach raises a fresh alert.
//! - **Error stream**: `queue_alert` matches incoming error events against
//!   each rule's error types, stages, and severity threshold. Matches
//!   coalesce under `aggregation_key = rule_name:error_type:stage`: while
//!   an alert with that key is active within the rule's aggregation
//!   window, new matches increment its count instead of inserting rows.
//!
//! Rules load from persistence with a ~60 second cache; an absent or
//! empty table falls back to the built-in default rule set, which is the
//! single source of truth for defaults. Notification dispatch (email,
//! Slack) is best-effort and never aborts the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use krai_pipeline_bootstrap::CancellationToken;
use krai_pipeline_domain::{
    Alert, AlertRule, AlertSeverity, AlertStatus, DatabasePort, ErrorEvent, EventBroadcaster, PipelineError,
    ThresholdOperator,
};

use super::metrics_service::MetricsService;
use super::notifications::NotificationSink;

const RULES_CACHE_TTL: Duration = Duration::from_secs(60);

/// Alerts plus counts returned by [`AlertService::get_alerts`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertListResponse {
    pub alerts: Vec<Alert>,
    pub total: u64,
    pub unacknowledged_count: u64,
}

/// Service managing alert rules, instances, and dispatch.
pub struct AlertService {
    port: Arc<dyn DatabasePort>,
    metrics: Arc<MetricsService>,
    broadcaster: Option<Arc<dyn EventBroadcaster>>,
    sinks: Vec<Arc<dyn NotificationSink>>,
    rules_cache: Mutex<Option<(Instant, Vec<AlertRule>)>>,
    /// Active alert ids keyed by rule id (threshold path) or aggregation
    /// key (stream path). Mutated only by the evaluation loop and the
    /// management operations.
    active_alerts: Mutex<HashMap<String, Uuid>>,
}

impl AlertService {
    pub fn new(port: Arc<dyn DatabasePort>, metrics: Arc<MetricsService>) -> Self {
        Self {
            port,
            metrics,
            broadcaster: None,
            sinks: Vec::new(),
            rules_cache: Mutex::new(None),
            active_alerts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn EventBroadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    // ------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------

    /// The built-in rule set used when the rules table is absent or empty
    pub fn default_rules() -> Vec<AlertRule> {
        let rule = |name: &str, severity: AlertSeverity, metric_key: &str, threshold: f64| {
            let mut rule = AlertRule::named(name, severity);
            rule.metric_key = Some(metric_key.to_string());
            rule.threshold_value = threshold;
            rule.threshold_operator = ThresholdOperator::GreaterThan;
            rule
        };

        vec![
            rule("High Processing Failure Rate", AlertSeverity::High, "failure_rate", 10.0),
            rule("Queue Overflow", AlertSeverity::Medium, "queue_pending", 100.0),
            rule("High CPU Usage", AlertSeverity::High, "cpu", 90.0),
            rule("High RAM Usage", AlertSeverity::High, "ram", 90.0),
            rule("High Duplicate Count", AlertSeverity::Medium, "duplicates", 50.0),
            rule("High Validation Errors", AlertSeverity::Medium, "validation_errors", 20.0),
        ]
    }

    /// Enabled rules, cached for about a minute
    pub async fn rules(&self) -> Vec<AlertRule> {
        {
            let cache = self.rules_cache.lock();
            if let Some((loaded_at, rules)) = cache.as_ref() {
                if loaded_at.elapsed() < RULES_CACHE_TTL {
                    return rules.clone();
                }
            }
        }

        let rules = match self.port.load_alert_rules().await {
            Ok(rules) if !rules.is_empty() => rules,
            Ok(_) => {
                info!("no alert rules in store; using defaults");
                Self::default_rules()
            }
            Err(e) => {
                error!(error = %e, "failed to load alert rules; using defaults");
                Self::default_rules()
            }
        };

        let enabled: Vec<AlertRule> = rules.into_iter().filter(|rule| rule.enabled).collect();
        info!(count = enabled.len(), "loaded alert rules");
        *self.rules_cache.lock() = Some((Instant::now(), enabled.clone()));
        enabled
    }

    /// Drops the rules cache so the next read hits the store
    pub fn invalidate_rules_cache(&self) {
        *self.rules_cache.lock() = None;
    }

    pub async fn add_alert_rule(&self, rule: &AlertRule) -> Result<Uuid, PipelineError> {
        let id = self.port.insert_alert_rule(rule).await?;
        self.invalidate_rules_cache();
        info!(rule = %rule.rule_name, %id, "added alert rule");
        Ok(id)
    }

    pub async fn update_alert_rule(&self, rule: &AlertRule) -> Result<bool, PipelineError> {
        let updated = self.port.update_alert_rule(rule).await?;
        if updated {
            self.invalidate_rules_cache();
            info!(rule = %rule.rule_name, "updated alert rule");
        }
        Ok(updated)
    }

    pub async fn delete_alert_rule(&self, rule_id: Uuid) -> Result<bool, PipelineError> {
        let deleted = self.port.delete_alert_rule(rule_id).await?;
        if deleted {
            self.invalidate_rules_cache();
            info!(%rule_id, "deleted alert rule");
        }
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Threshold evaluation
    // ------------------------------------------------------------------

    /// Evaluates every enabled rule against current metrics, returning the
    /// newly created alerts
    pub async fn evaluate_alerts(&self) -> Vec<Alert> {
        let pipeline = self.metrics.get_pipeline_metrics().await;
        let queue = self.metrics.get_queue_metrics().await;
        let hardware = self.metrics.get_hardware_metrics().await;
        let data_quality = self.metrics.get_data_quality_metrics().await;

        let mut new_alerts = Vec::new();
        for rule in self.rules().await {
            let Some((value, metadata)) = select_metric(&rule, &pipeline, &queue, &hardware, &data_quality) else {
                continue;
            };

            if rule.threshold_operator.evaluate(value, rule.threshold_value) {
                let key = rule.id.to_string();
                let already_active = self.active_alerts.lock().contains_key(&key);
                if already_active {
                    continue;
                }

                match self.create_threshold_alert(&rule, value, metadata).await {
                    Ok(alert) => {
                        self.active_alerts.lock().insert(key, alert.id);
                        self.notify_alert(&alert, &rule).await;
                        new_alerts.push(alert);
                    }
                    Err(e) => error!(rule = %rule.rule_name, error = %e, "failed to create alert"),
                }
            } else {
                // Breach resolved; re-arm the rule
                self.active_alerts.lock().remove(&rule.id.to_string());
            }
        }
        new_alerts
    }

    async fn create_threshold_alert(
        &self,
        rule: &AlertRule,
        value: f64,
        mut metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Alert, PipelineError> {
        metadata.insert("rule_id".to_string(), serde_json::json!(rule.id.to_string()));
        metadata.insert("current_value".to_string(), serde_json::json!(value));
        metadata.insert("threshold".to_string(), serde_json::json!(rule.threshold_value));
        metadata.insert(
            "operator".to_string(),
            serde_json::json!(rule.threshold_operator.as_str()),
        );

        let mut alert = Alert::new("threshold_breach", rule.severity, rule.rule_name.clone());
        alert.message = format!(
            "{}: current value is {}, threshold {} {}",
            rule.rule_name,
            value,
            rule.threshold_operator.as_str(),
            rule.threshold_value
        );
        alert.metadata = serde_json::Value::Object(metadata);

        self.port.insert_alert(&alert).await?;
        info!(title = %alert.title, id = %alert.id, "created alert");
        Ok(alert)
    }

    // ------------------------------------------------------------------
    // Stream-driven queuing
    // ------------------------------------------------------------------

    /// Routes one error event through the rule set.
    ///
    /// Returns the id of the created or aggregated alert, or `None` when
    /// no enabled rule matched.
    pub async fn queue_alert(&self, event: &ErrorEvent) -> Option<Uuid> {
        for rule in self.rules().await {
            if !matches_rule(event, &rule) {
                continue;
            }

            let aggregation_key = format!("{}:{}:{}", rule.rule_name, event.error_type, event.stage);

            match self
                .port
                .find_active_alert(&aggregation_key, rule.aggregation_window_minutes)
                .await
            {
                Ok(Some(existing)) => {
                    if let Err(e) = self.port.increment_alert_aggregation(existing.id).await {
                        error!(key = %aggregation_key, error = %e, "failed to aggregate alert");
                        return None;
                    }
                    self.active_alerts.lock().insert(aggregation_key, existing.id);
                    return Some(existing.id);
                }
                Ok(None) => {
                    let mut alert = Alert::new(event.error_type.clone(), event.severity, rule.rule_name.clone());
                    alert.message = event.message.clone();
                    alert.aggregation_key = Some(aggregation_key.clone());
                    alert.metadata = serde_json::json!({
                        "stage": event.stage.as_str(),
                        "document_id": event.document_id.map(|id| id.to_string()),
                        "correlation_id": event.correlation_id.clone(),
                    });

                    match self.port.insert_alert(&alert).await {
                        Ok(id) => {
                            self.active_alerts.lock().insert(aggregation_key, id);
                            self.notify_alert(&alert, &rule).await;
                            return Some(id);
                        }
                        Err(e) => {
                            error!(key = %aggregation_key, error = %e, "failed to insert alert");
                            return None;
                        }
                    }
                }
                Err(e) => {
                    error!(key = %aggregation_key, error = %e, "failed to look up active alert");
                    return None;
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Pushes the alert to the broadcast hub and every applicable sink.
    /// Failures are logged and swallowed.
    async fn notify_alert(&self, alert: &Alert, rule: &AlertRule) {
        warn!(
            severity = %alert.severity,
            title = %alert.title,
            "ALERT TRIGGERED: {}",
            alert.message
        );

        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.alert_event(alert);
        }

        for sink in &self.sinks {
            let applicable = match sink.name() {
                "email" => !rule.email_recipients.is_empty(),
                "slack" => !rule.slack_webhooks.is_empty(),
                _ => true,
            };
            if !applicable {
                continue;
            }
            if let Err(e) = sink.deliver(alert, rule).await {
                error!(sink = sink.name(), alert_id = %alert.id, error = %e, "alert delivery failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Management
    // ------------------------------------------------------------------

    /// Alerts with optional severity and status filters
    pub async fn get_alerts(
        &self,
        limit: usize,
        severity: Option<AlertSeverity>,
        status: Option<AlertStatus>,
    ) -> AlertListResponse {
        let alerts = match self.port.list_alerts(limit, severity, status).await {
            Ok(alerts) => alerts,
            Err(e) => {
                error!(error = %e, "failed to list alerts");
                Vec::new()
            }
        };
        let unacknowledged_count = self.port.count_unacknowledged_alerts().await.unwrap_or(0);

        AlertListResponse {
            total: alerts.len() as u64,
            alerts,
            unacknowledged_count,
        }
    }

    /// Records the acknowledging user and timestamp and clears the active
    /// entry so future breaches re-alert
    pub async fn acknowledge_alert(&self, alert_id: Uuid, user_id: &str) -> Result<bool, PipelineError> {
        let acknowledged = self.port.acknowledge_alert(alert_id, user_id).await?;
        if acknowledged {
            self.active_alerts.lock().retain(|_, id| *id != alert_id);
            info!(%alert_id, user_id, "alert acknowledged");
        }
        Ok(acknowledged)
    }

    /// Hard-deletes an alert
    pub async fn dismiss_alert(&self, alert_id: Uuid) -> Result<bool, PipelineError> {
        let deleted = self.port.delete_alert(alert_id).await?;
        if deleted {
            self.active_alerts.lock().retain(|_, id| *id != alert_id);
            info!(%alert_id, "alert dismissed");
        }
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Background loop
    // ------------------------------------------------------------------

    /// Periodic evaluation loop; exits when the token cancels
    pub async fn run_monitoring_loop(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        info!(?interval, "starting alert monitoring loop");
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("alert monitoring stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let new_alerts = self.evaluate_alerts().await;
            if !new_alerts.is_empty() {
                info!(count = new_alerts.len(), "alert evaluation triggered new alerts");
            }
        }
    }
}

/// True when the event matches the rule's filters. Empty filters match
/// everything.
fn matches_rule(event: &ErrorEvent, rule: &AlertRule) -> bool {
    if !rule.error_types.is_empty() && !rule.error_types.iter().any(|t| t == &event.error_type) {
        return false;
    }
    if !rule.stages.is_empty() && !rule.stages.contains(&event.stage) {
        return false;
    }
    if let Some(threshold) = rule.severity_threshold {
        if !event.severity.meets_threshold(threshold) {
            return false;
        }
    }
    true
}

/// Selects the scalar a rule watches, with metadata describing it.
///
/// `metric_key` drives the selection; rules without one fall back to
/// matching on the rule name for compatibility with older rule rows.
fn select_metric(
    rule: &AlertRule,
    pipeline: &krai_pipeline_domain::PipelineMetrics,
    queue: &krai_pipeline_domain::QueueMetrics,
    hardware: &krai_pipeline_domain::HardwareStatus,
    data_quality: &krai_pipeline_domain::DataQualityMetrics,
) -> Option<(f64, serde_json::Map<String, serde_json::Value>)> {
    let mut metadata = serde_json::Map::new();

    let key = match rule.metric_key.as_deref() {
        Some(key) => key.to_string(),
        None => {
            let name = rule.rule_name.to_uppercase();
            if name.contains("CPU") {
                "cpu".to_string()
            } else if name.contains("RAM") {
                "ram".to_string()
            } else if name.contains("QUEUE") {
                "queue_pending".to_string()
            } else if name.contains("DUPLICATE") {
                "duplicates".to_string()
            } else if name.contains("VALIDATION") {
                "validation_errors".to_string()
            } else if name.contains("FAILURE") {
                "failure_rate".to_string()
            } else {
                return None;
            }
        }
    };

    let value = match key.as_str() {
        "failure_rate" => {
            metadata.insert("success_rate".to_string(), serde_json::json!(pipeline.success_rate));
            // An empty pipeline has no failure rate worth alerting on
            if pipeline.total_documents == 0 {
                0.0
            } else {
                100.0 - pipeline.success_rate
            }
        }
        "queue_pending" | "queue_overflow" => {
            metadata.insert("pending_count".to_string(), serde_json::json!(queue.pending_count));
            queue.pending_count as f64
        }
        "cpu" => {
            metadata.insert("cpu_percent".to_string(), serde_json::json!(hardware.cpu_percent));
            hardware.cpu_percent
        }
        "ram" => {
            metadata.insert("ram_percent".to_string(), serde_json::json!(hardware.ram_percent));
            hardware.ram_percent
        }
        "duplicates" => {
            let total = data_quality.duplicate_metrics.total_duplicates;
            metadata.insert("total_duplicates".to_string(), serde_json::json!(total));
            total as f64
        }
        "validation_errors" => {
            let total = data_quality.validation_metrics.total_validation_errors;
            metadata.insert("total_errors".to_string(), serde_json::json!(total));
            total as f64
        }
        other => {
            warn!(metric_key = other, rule = %rule.rule_name, "unknown metric key");
            return None;
        }
    };

    Some((value, metadata))
}
