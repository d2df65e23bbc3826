// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Metrics Service
//!
//! Read-through cache over the aggregated pipeline views and the hardware
//! probe. Every getter follows the same shape: answer from cache within
//! the TTL, otherwise read upstream, cache, and return. On any upstream
//! failure a zero-valued metrics object is returned instead of an error;
//! monitoring must never take the pipeline down.
//!
//! Coarse metrics cache for five seconds; hardware for one. Expired
//! entries are purged lazily on access, and every write sweeps entries
//! older than one minute.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error};

use krai_pipeline_domain::{
    DataQualityMetrics, DatabasePort, DuplicateMetrics, HardwareStatus, PipelineMetrics, ProcessingBreakdown,
    ProcessingStatus, QueueMetrics, StageStatistics, ValidationMetrics,
};

use super::hardware::HardwareProbe;

const CACHE_TTL: Duration = Duration::from_secs(5);
const HARDWARE_TTL: Duration = Duration::from_secs(1);
const SWEEP_CUTOFF: Duration = Duration::from_secs(60);

#[derive(Clone)]
enum CachedValue {
    Pipeline(PipelineMetrics),
    Queue(QueueMetrics),
    Stages(Vec<StageStatistics>),
    Hardware(HardwareStatus),
    Duplicates(DuplicateMetrics),
    Validation(ValidationMetrics),
    Processing(ProcessingBreakdown),
}

struct CacheEntry {
    value: CachedValue,
    stored_at: Instant,
    ttl: Duration,
}

/// Aggregation and caching layer over raw pipeline state.
pub struct MetricsService {
    port: Arc<dyn DatabasePort>,
    hardware: Arc<dyn HardwareProbe>,
    cache: Mutex<HashMap<&'static str, CacheEntry>>,
}

impl MetricsService {
    pub fn new(port: Arc<dyn DatabasePort>, hardware: Arc<dyn HardwareProbe>) -> Self {
        Self {
            port,
            hardware,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn get_cached(&self, key: &'static str) -> Option<CachedValue> {
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get(key) {
            if entry.stored_at.elapsed() < entry.ttl {
                debug!(key, "metrics cache hit");
                return Some(entry.value.clone());
            }
            debug!(key, "metrics cache expired");
            cache.remove(key);
        }
        None
    }

    fn set_cache(&self, key: &'static str, value: CachedValue, ttl: Duration) {
        let mut cache = self.cache.lock();
        cache.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
        // Sweep anything stale past the cutoff
        cache.retain(|_, entry| entry.stored_at.elapsed() < SWEEP_CUTOFF);
    }

    /// Invalidates one cache key, or the whole cache when `None`
    pub fn invalidate_cache(&self, key: Option<&str>) {
        let mut cache = self.cache.lock();
        match key {
            Some(key) => {
                cache.retain(|k, _| *k != key);
                debug!(key, "metrics cache invalidated");
            }
            None => {
                cache.clear();
                debug!("entire metrics cache invalidated");
            }
        }
    }

    /// Aggregated pipeline totals
    pub async fn get_pipeline_metrics(&self) -> PipelineMetrics {
        if let Some(CachedValue::Pipeline(metrics)) = self.get_cached("pipeline_metrics") {
            return metrics;
        }

        match self.port.pipeline_metrics_view().await {
            Ok(view) => {
                let metrics = PipelineMetrics {
                    total_documents: view.total_documents,
                    documents_pending: view.documents_pending,
                    documents_processing: view.documents_processing,
                    documents_completed: view.documents_completed,
                    documents_failed: view.documents_failed,
                    success_rate: view.success_rate,
                    avg_processing_time_seconds: view.avg_processing_time_seconds,
                    current_throughput_docs_per_hour: round2(view.recent_24h_count as f64 / 24.0),
                };
                self.set_cache("pipeline_metrics", CachedValue::Pipeline(metrics.clone()), CACHE_TTL);
                metrics
            }
            Err(e) => {
                error!(error = %e, "failed to get pipeline metrics");
                PipelineMetrics::default()
            }
        }
    }

    /// Aggregated queue totals
    pub async fn get_queue_metrics(&self) -> QueueMetrics {
        if let Some(CachedValue::Queue(metrics)) = self.get_cached("queue_metrics") {
            return metrics;
        }

        match self.port.queue_metrics_view().await {
            Ok(view) => {
                let metrics = QueueMetrics {
                    total_items: view.total_items,
                    pending_count: view.pending_count,
                    processing_count: view.processing_count,
                    completed_count: view.completed_count,
                    failed_count: view.failed_count,
                    avg_wait_time_seconds: round2(view.avg_wait_time_seconds),
                    by_task_type: view.by_task_type,
                };
                self.set_cache("queue_metrics", CachedValue::Queue(metrics.clone()), CACHE_TTL);
                metrics
            }
            Err(e) => {
                error!(error = %e, "failed to get queue metrics");
                QueueMetrics::default()
            }
        }
    }

    /// Per-stage counters and success rates
    pub async fn get_stage_metrics(&self) -> Vec<StageStatistics> {
        if let Some(CachedValue::Stages(metrics)) = self.get_cached("stage_metrics") {
            return metrics;
        }

        match self.port.stage_statistics().await {
            Ok(rows) => {
                self.set_cache("stage_metrics", CachedValue::Stages(rows.clone()), CACHE_TTL);
                rows
            }
            Err(e) => {
                error!(error = %e, "failed to get stage metrics");
                Vec::new()
            }
        }
    }

    /// Host resource snapshot, cached for one second
    pub async fn get_hardware_metrics(&self) -> HardwareStatus {
        if let Some(CachedValue::Hardware(status)) = self.get_cached("hardware_metrics") {
            return status;
        }

        let status = self.hardware.sample();
        self.set_cache("hardware_metrics", CachedValue::Hardware(status.clone()), HARDWARE_TTL);
        status
    }

    /// Duplicate detection summary
    pub async fn get_duplicate_metrics(&self) -> DuplicateMetrics {
        if let Some(CachedValue::Duplicates(metrics)) = self.get_cached("duplicate_metrics") {
            return metrics;
        }

        let hash_groups = match self.port.duplicate_hash_groups().await {
            Ok(groups) => groups,
            Err(e) => {
                error!(error = %e, "failed to get duplicate metrics");
                return DuplicateMetrics::default();
            }
        };
        let filename_groups = match self.port.duplicate_filename_groups().await {
            Ok(groups) => groups,
            Err(e) => {
                error!(error = %e, "failed to get duplicate metrics");
                return DuplicateMetrics::default();
            }
        };

        let metrics = DuplicateMetrics {
            total_duplicates: (hash_groups.len() + filename_groups.len()) as u64,
            duplicate_by_hash: hash_groups.len() as u64,
            duplicate_by_filename: filename_groups.len() as u64,
            duplicate_documents: hash_groups,
        };
        self.set_cache("duplicate_metrics", CachedValue::Duplicates(metrics.clone()), CACHE_TTL);
        metrics
    }

    /// Validation failure summary derived from failed stage states
    pub async fn get_validation_metrics(&self) -> ValidationMetrics {
        if let Some(CachedValue::Validation(metrics)) = self.get_cached("validation_metrics") {
            return metrics;
        }

        let documents = match self.port.list_documents(1000).await {
            Ok(documents) => documents,
            Err(e) => {
                error!(error = %e, "failed to get validation metrics");
                return ValidationMetrics::default();
            }
        };

        let mut errors_by_stage = std::collections::BTreeMap::new();
        let mut documents_with_errors = Vec::new();
        for document in &documents {
            for (stage, state) in &document.stage_status {
                if state.status == krai_pipeline_domain::StageStatus::Failed {
                    *errors_by_stage.entry(stage.as_str().to_string()).or_insert(0u64) += 1;
                    if documents_with_errors.len() < 50 {
                        documents_with_errors.push(serde_json::json!({
                            "document_id": document.id.to_string(),
                            "stage": stage.as_str(),
                            "error": state.error.clone().unwrap_or_else(|| "Unknown error".to_string()),
                        }));
                    }
                }
            }
        }

        let metrics = ValidationMetrics {
            total_validation_errors: errors_by_stage.values().sum(),
            errors_by_stage,
            documents_with_errors,
        };
        self.set_cache("validation_metrics", CachedValue::Validation(metrics.clone()), CACHE_TTL);
        metrics
    }

    /// Processing outcomes broken down by document type
    pub async fn get_processing_metrics(&self) -> ProcessingBreakdown {
        if let Some(CachedValue::Processing(metrics)) = self.get_cached("processing_metrics") {
            return metrics;
        }

        let documents = match self.port.list_documents(1000).await {
            Ok(documents) => documents,
            Err(e) => {
                error!(error = %e, "failed to get processing metrics");
                return ProcessingBreakdown::default();
            }
        };

        let total = documents.len() as u64;
        let successful = documents
            .iter()
            .filter(|d| d.processing_status == ProcessingStatus::Completed)
            .count() as u64;
        let failed = documents
            .iter()
            .filter(|d| d.processing_status == ProcessingStatus::Failed)
            .count() as u64;

        let mut durations = Vec::new();
        let mut by_type = std::collections::BTreeMap::new();
        for document in &documents {
            for state in document.stage_status.values() {
                if let Some(duration) = state.duration_seconds() {
                    durations.push(duration);
                }
            }
            *by_type.entry(document.document_type.clone()).or_insert(0u64) += 1;
        }

        let metrics = ProcessingBreakdown {
            total_processed: total,
            successful,
            failed,
            success_rate: if total > 0 {
                round2(successful as f64 / total as f64 * 100.0)
            } else {
                0.0
            },
            avg_processing_time: if durations.is_empty() {
                0.0
            } else {
                round2(durations.iter().sum::<f64>() / durations.len() as f64)
            },
            processing_by_type: by_type,
        };
        self.set_cache("processing_metrics", CachedValue::Processing(metrics.clone()), CACHE_TTL);
        metrics
    }

    /// Duplicates, validation failures, and processing breakdown combined
    pub async fn get_data_quality_metrics(&self) -> DataQualityMetrics {
        DataQualityMetrics {
            duplicate_metrics: self.get_duplicate_metrics().await,
            validation_metrics: self.get_validation_metrics().await,
            processing_metrics: self.get_processing_metrics().await,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
