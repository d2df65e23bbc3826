// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Monitoring Read Models
//!
//! Value objects exchanged between the metrics service, the alert engine,
//! and the broadcast hub: aggregated pipeline/queue/stage/hardware metrics,
//! data quality summaries, alert rules and instances, and performance
//! baselines.
//!
//! These are read models, not aggregates. They are produced from persistent
//! views or host probes, cached briefly, and serialized into broadcast
//! frames. All of them default to zero-valued shapes so an upstream failure
//! degrades to "no data" instead of an error response.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value_objects::{DocumentId, Stage};
use crate::PipelineError;

// ---------------------------------------------------------------------------
// Pipeline / queue / stage metrics
// ---------------------------------------------------------------------------

/// Aggregated pipeline totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub total_documents: u64,
    pub documents_pending: u64,
    pub documents_processing: u64,
    pub documents_completed: u64,
    pub documents_failed: u64,
    /// Percentage in `[0, 100]`
    pub success_rate: f64,
    pub avg_processing_time_seconds: f64,
    pub current_throughput_docs_per_hour: f64,
}

/// Aggregated queue totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub total_items: u64,
    pub pending_count: u64,
    pub processing_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    pub avg_wait_time_seconds: f64,
    pub by_task_type: BTreeMap<String, u64>,
}

/// Per-stage execution counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatistics {
    pub stage: Stage,
    pub pending_count: u64,
    pub processing_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    pub skipped_count: u64,
    pub avg_duration_seconds: f64,
    /// Percentage in `[0, 100]`
    pub success_rate: f64,
}

impl StageStatistics {
    pub fn empty(stage: Stage) -> Self {
        Self {
            stage,
            pending_count: 0,
            processing_count: 0,
            completed_count: 0,
            failed_count: 0,
            skipped_count: 0,
            avg_duration_seconds: 0.0,
            success_rate: 0.0,
        }
    }
}

/// Host resource snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareStatus {
    pub cpu_percent: f64,
    pub ram_percent: f64,
    pub ram_available_gb: f64,
    pub gpu_available: bool,
    pub gpu_percent: Option<f64>,
    pub gpu_memory_used_gb: Option<f64>,
    pub gpu_memory_total_gb: Option<f64>,
}

// ---------------------------------------------------------------------------
// Data quality
// ---------------------------------------------------------------------------

/// A group of documents sharing one content hash or filename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub key: String,
    pub count: u64,
    pub filenames: Vec<String>,
}

/// Duplicate detection summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DuplicateMetrics {
    pub total_duplicates: u64,
    pub duplicate_by_hash: u64,
    pub duplicate_by_filename: u64,
    pub duplicate_documents: Vec<DuplicateGroup>,
}

/// Validation failure summary derived from failed stage states.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub total_validation_errors: u64,
    pub errors_by_stage: BTreeMap<String, u64>,
    pub documents_with_errors: Vec<serde_json::Value>,
}

/// Processing outcomes broken down by document type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingBreakdown {
    pub total_processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub avg_processing_time: f64,
    pub processing_by_type: BTreeMap<String, u64>,
}

/// Combined data quality response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataQualityMetrics {
    pub duplicate_metrics: DuplicateMetrics,
    pub validation_metrics: ValidationMetrics,
    pub processing_metrics: ProcessingBreakdown,
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Alert severity, ordered from weakest to strongest so that derived `Ord`
/// makes `Critical` the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }

    /// True when `self` is at least as severe as `threshold`
    pub fn meets_threshold(&self, threshold: AlertSeverity) -> bool {
        *self >= threshold
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertSeverity {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(AlertSeverity::Info),
            "low" => Ok(AlertSeverity::Low),
            "medium" => Ok(AlertSeverity::Medium),
            "high" => Ok(AlertSeverity::High),
            "critical" => Ok(AlertSeverity::Critical),
            other => Err(PipelineError::validation_error(format!(
                "unknown alert severity '{}'",
                other
            ))),
        }
    }
}

/// Comparison operator for threshold rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdOperator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    LessOrEqual,
}

impl ThresholdOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdOperator::GreaterThan => ">",
            ThresholdOperator::LessThan => "<",
            ThresholdOperator::Equal => "==",
            ThresholdOperator::GreaterOrEqual => ">=",
            ThresholdOperator::LessOrEqual => "<=",
        }
    }

    /// Applies the operator with `value` on the left
    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            ThresholdOperator::GreaterThan => value > threshold,
            ThresholdOperator::LessThan => value < threshold,
            ThresholdOperator::Equal => value == threshold,
            ThresholdOperator::GreaterOrEqual => value >= threshold,
            ThresholdOperator::LessOrEqual => value <= threshold,
        }
    }
}

impl FromStr for ThresholdOperator {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ">" => Ok(ThresholdOperator::GreaterThan),
            "<" => Ok(ThresholdOperator::LessThan),
            "==" => Ok(ThresholdOperator::Equal),
            ">=" => Ok(ThresholdOperator::GreaterOrEqual),
            "<=" => Ok(ThresholdOperator::LessOrEqual),
            other => Err(PipelineError::validation_error(format!(
                "unknown threshold operator '{}'",
                other
            ))),
        }
    }
}

/// A configured alert rule.
///
/// One rule shape serves both evaluation paths: the threshold loop reads
/// `metric_key`, `threshold_operator`, and `threshold_value`; the
/// stream-driven path matches `error_types`, `stages`, and
/// `severity_threshold` and aggregates within `aggregation_window_minutes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: Uuid,
    pub rule_name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub severity: AlertSeverity,
    /// Error types this rule matches; empty matches all
    pub error_types: Vec<String>,
    /// Stages this rule matches; empty matches all
    pub stages: Vec<Stage>,
    /// Minimum severity an error event must carry to match
    pub severity_threshold: Option<AlertSeverity>,
    pub metric_key: Option<String>,
    pub threshold_value: f64,
    pub threshold_operator: ThresholdOperator,
    pub error_count_threshold: u32,
    pub time_window_minutes: u32,
    pub aggregation_window_minutes: u32,
    pub email_recipients: Vec<String>,
    pub slack_webhooks: Vec<String>,
}

impl AlertRule {
    /// A minimal enabled rule with permissive matching defaults
    pub fn named(rule_name: impl Into<String>, severity: AlertSeverity) -> Self {
        Self {
            id: Uuid::new_v4(),
            rule_name: rule_name.into(),
            description: None,
            enabled: true,
            severity,
            error_types: Vec::new(),
            stages: Vec::new(),
            severity_threshold: None,
            metric_key: None,
            threshold_value: 0.0,
            threshold_operator: ThresholdOperator::GreaterThan,
            error_count_threshold: 5,
            time_window_minutes: 15,
            aggregation_window_minutes: 5,
            email_recipients: Vec::new(),
            slack_webhooks: Vec::new(),
        }
    }
}

/// Lifecycle status of an alert instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Pending,
    Sent,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Pending => "pending",
            AlertStatus::Sent => "sent",
        }
    }
}

/// A triggered alert.
///
/// While an alert with the same `aggregation_key` is active inside the
/// rule's aggregation window, repeated matches increment
/// `aggregation_count` on the existing row instead of inserting new rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub aggregation_key: Option<String>,
    pub aggregation_count: u32,
    pub first_occurrence: DateTime<Utc>,
    pub last_occurrence: DateTime<Utc>,
    pub triggered_at: DateTime<Utc>,
    pub status: AlertStatus,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn new(alert_type: impl Into<String>, severity: AlertSeverity, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            alert_type: alert_type.into(),
            severity,
            title: title.into(),
            message: String::new(),
            metadata: serde_json::Value::Null,
            aggregation_key: None,
            aggregation_count: 1,
            first_occurrence: now,
            last_occurrence: now,
            triggered_at: now,
            status: AlertStatus::Pending,
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
        }
    }
}

/// An error event fed to the stream-driven alert path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub error_type: String,
    pub stage: Stage,
    pub severity: AlertSeverity,
    pub message: String,
    pub document_id: Option<DocumentId>,
    pub correlation_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Performance baselines
// ---------------------------------------------------------------------------

/// Statistical aggregates over a set of durations, in seconds rounded to
/// three decimals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageAggregates {
    pub avg_seconds: f64,
    pub p50_seconds: f64,
    pub p95_seconds: f64,
    pub p99_seconds: f64,
}

/// A stored timing reference for a stage, DB query (`db__` prefix), or API
/// endpoint (`api__` prefix), unique per `(name, measurement_date)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceBaseline {
    pub id: Uuid,
    pub stage_name: String,
    pub measurement_date: NaiveDate,
    pub baseline: StageAggregates,
    pub current: Option<StageAggregates>,
    pub improvement_percentage: Option<f64>,
    pub test_document_ids: Vec<DocumentId>,
    pub notes: Option<String>,
}
