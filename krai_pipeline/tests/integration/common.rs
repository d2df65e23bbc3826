// /////////////////////////////////////////////////////////////////////////////
// KRAI Pipeline
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Shared helpers for integration tests: a wired pipeline harness over
//! the in-memory port, synthetic stage processors with scriptable
//! failure behavior, a recording broadcaster, and a port wrapper that
//! can simulate a lost database connection.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

use krai_pipeline::application::services::document_pipeline::{ProcessorRegistry, StageSequencer};
use krai_pipeline::infrastructure::config::{PipelineConfig, RetryPolicyConfig};
use krai_pipeline::infrastructure::repositories::MemoryDatabasePort;
use krai_pipeline::infrastructure::runtime::{CancellationRegistry, RetryListener, StageRunner};
use krai_pipeline::infrastructure::services::{MetricsService, PerformanceCollector, StageTracker, StaticProbe};
use krai_pipeline_domain::{
    Alert, BroadcastEventKind, ContentHash, DatabasePort, Document, DocumentId, EventBroadcaster,
    HardwareStatus, PipelineError, ProcessingContext, ProcessingResult, Stage, StageProcessor,
};

/// A fully wired pipeline over the in-memory port.
pub struct TestHarness {
    pub port: Arc<dyn DatabasePort>,
    pub memory: Arc<MemoryDatabasePort>,
    pub tracker: Arc<StageTracker>,
    pub runner: Arc<StageRunner>,
    pub sequencer: Arc<StageSequencer>,
    pub collector: Arc<PerformanceCollector>,
    pub cancellations: Arc<CancellationRegistry>,
    pub broadcaster: Arc<RecordingBroadcaster>,
    pub config: Arc<PipelineConfig>,
}

impl TestHarness {
    /// Harness with the default configuration and the given processors
    pub fn new(processors: Vec<Arc<dyn StageProcessor>>) -> Self {
        Self::with_config(processors, PipelineConfig::default())
    }

    pub fn with_config(processors: Vec<Arc<dyn StageProcessor>>, mut config: PipelineConfig) -> Self {
        // Immediate retries keep tests fast
        config.retry.default_policy = RetryPolicyConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter: false,
        };
        let config = Arc::new(config);

        let memory = Arc::new(MemoryDatabasePort::new());
        let port: Arc<dyn DatabasePort> = memory.clone();
        Self::wire(memory, port, processors, config)
    }

    /// Harness over an arbitrary port (used for offline simulations)
    pub fn over_port(port: Arc<dyn DatabasePort>, processors: Vec<Arc<dyn StageProcessor>>) -> Self {
        let mut config = PipelineConfig::default();
        config.retry.default_policy = RetryPolicyConfig {
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter: false,
        };
        Self::wire(Arc::new(MemoryDatabasePort::new()), port, processors, Arc::new(config))
    }

    fn wire(
        memory: Arc<MemoryDatabasePort>,
        port: Arc<dyn DatabasePort>,
        processors: Vec<Arc<dyn StageProcessor>>,
        config: Arc<PipelineConfig>,
    ) -> Self {
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let collector = Arc::new(PerformanceCollector::new(port.clone()));
        let cancellations = Arc::new(CancellationRegistry::new());

        let tracker = Arc::new(
            StageTracker::new(port.clone(), "krai")
                .with_broadcaster(broadcaster.clone() as Arc<dyn EventBroadcaster>),
        );

        let runner = Arc::new(
            StageRunner::new(port.clone(), config.retry.clone(), cancellations.clone())
                .with_collector(collector.clone()),
        );

        let mut registry = ProcessorRegistry::new();
        for processor in processors {
            registry.register(processor);
        }

        let sequencer = Arc::new(StageSequencer::new(
            port.clone(),
            runner.clone(),
            tracker.clone(),
            Arc::new(registry),
            config.clone(),
            cancellations.clone(),
        ));
        let listener: Arc<dyn RetryListener> = sequencer.clone();
        runner.set_retry_listener(Arc::downgrade(&listener));

        Self {
            port,
            memory,
            tracker,
            runner,
            sequencer,
            collector,
            cancellations,
            broadcaster,
            config,
        }
    }

    /// Creates a pending document in the store and its processing context
    pub async fn seed_document(&self, bytes: &[u8]) -> (DocumentId, ProcessingContext) {
        let document = Document::new(
            "CX3500_SM.pdf",
            bytes.len() as u64,
            ContentHash::of_bytes(bytes),
            "service_manual",
            "en",
        );
        let id = self.port.create_document(&document).await.expect("create document");
        let context = ProcessingContext::new(id, "/data/manuals/CX3500_SM.pdf", "service_manual")
            .with_file_hash(ContentHash::of_bytes(bytes).as_str())
            .with_file_size(bytes.len() as u64);
        (id, context)
    }

    /// Metrics service over this harness's port with a fixed hardware
    /// snapshot
    pub fn metrics(&self, hardware: HardwareStatus) -> Arc<MetricsService> {
        Arc::new(MetricsService::new(self.port.clone(), Arc::new(StaticProbe::new(hardware))))
    }
}

// ---------------------------------------------------------------------------
// Synthetic processors
// ---------------------------------------------------------------------------

type ErrorFactory = Box<dyn Fn(u32) -> PipelineError + Send + Sync>;

/// Processor that fails a scripted number of times before succeeding.
pub struct FlakyProcessor {
    stage: Stage,
    critical: bool,
    fail_count: u32,
    calls: AtomicU32,
    cleanups: AtomicU32,
    error_factory: ErrorFactory,
}

impl FlakyProcessor {
    /// Succeeds immediately
    pub fn reliable(stage: Stage) -> Self {
        Self::transient(stage, 0)
    }

    /// Raises connection errors for the first `fail_count` calls
    pub fn transient(stage: Stage, fail_count: u32) -> Self {
        Self {
            stage,
            critical: false,
            fail_count,
            calls: AtomicU32::new(0),
            cleanups: AtomicU32::new(0),
            error_factory: Box::new(|attempt| {
                PipelineError::connection_lost(format!("transient error on call {}", attempt))
            }),
        }
    }

    /// Raises a deterministic processing error for the first
    /// `fail_count` calls
    pub fn permanent(stage: Stage, fail_count: u32) -> Self {
        Self {
            stage,
            critical: false,
            fail_count,
            calls: AtomicU32::new(0),
            cleanups: AtomicU32::new(0),
            error_factory: Box::new(|attempt| {
                PipelineError::processing_failed(format!("permanent error on call {}", attempt))
            }),
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> u32 {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageProcessor for FlakyProcessor {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn is_critical(&self) -> bool {
        self.critical
    }

    async fn process(&self, context: &mut ProcessingContext) -> Result<ProcessingResult, PipelineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_count {
            return Err((self.error_factory)(call));
        }
        Ok(ProcessingResult::success(
            self.stage.as_str(),
            json!({"processed": true, "calls": call}),
            json!({"document_id": context.document_id().to_string()}),
        ))
    }

    async fn cleanup(&self, _context: &ProcessingContext) -> Result<(), PipelineError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Processor that blocks until released; used for lock contention tests.
pub struct SlowProcessor {
    stage: Stage,
    release: tokio::sync::Semaphore,
}

impl SlowProcessor {
    pub fn new(stage: Stage) -> Arc<Self> {
        Arc::new(Self {
            stage,
            release: tokio::sync::Semaphore::new(0),
        })
    }

    pub fn release(&self) {
        self.release.add_permits(1);
    }
}

#[async_trait]
impl StageProcessor for SlowProcessor {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn process(&self, _context: &mut ProcessingContext) -> Result<ProcessingResult, PipelineError> {
        let _permit = self.release.acquire().await.expect("semaphore open");
        Ok(ProcessingResult::success(self.stage.as_str(), json!({}), json!({})))
    }
}

// ---------------------------------------------------------------------------
// Recording doubles
// ---------------------------------------------------------------------------

/// Broadcaster that records every event for assertions.
#[derive(Default)]
pub struct RecordingBroadcaster {
    pub stage_events: Mutex<Vec<(BroadcastEventKind, Stage, Option<DocumentId>, String)>>,
    pub alerts: Mutex<Vec<Alert>>,
}

impl RecordingBroadcaster {
    pub fn stage_events_of(&self, kind: BroadcastEventKind) -> Vec<(Stage, Option<DocumentId>, String)> {
        self.stage_events
            .lock()
            .iter()
            .filter(|(k, _, _, _)| *k == kind)
            .map(|(_, stage, doc, status)| (*stage, *doc, status.clone()))
            .collect()
    }
}

impl EventBroadcaster for RecordingBroadcaster {
    fn stage_event(&self, kind: BroadcastEventKind, stage: Stage, document_id: Option<DocumentId>, status: &str) {
        self.stage_events
            .lock()
            .push((kind, stage, document_id, status.to_string()));
    }

    fn alert_event(&self, alert: &Alert) {
        self.alerts.lock().push(alert.clone());
    }
}

// ---------------------------------------------------------------------------
// Offline port wrapper
// ---------------------------------------------------------------------------

/// Port wrapper that can simulate a lost database connection.
///
/// While offline, connectivity-sensitive operations fail with
/// `ConnectionLost`; everything else keeps delegating so state built
/// before the outage stays intact.
pub struct OfflineTogglePort {
    inner: Arc<MemoryDatabasePort>,
    offline: AtomicBool,
}

impl OfflineTogglePort {
    pub fn new(inner: Arc<MemoryDatabasePort>) -> Self {
        Self {
            inner,
            offline: AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), PipelineError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(PipelineError::connection_lost("simulated outage"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DatabasePort for OfflineTogglePort {
    async fn ping(&self) -> Result<(), PipelineError> {
        self.check()?;
        self.inner.ping().await
    }

    async fn create_document(
        &self,
        document: &Document,
    ) -> Result<DocumentId, PipelineError> {
        self.check()?;
        self.inner.create_document(document).await
    }

    async fn get_document(
        &self,
        document_id: DocumentId,
    ) -> Result<Option<Document>, PipelineError> {
        self.inner.get_document(document_id).await
    }

    async fn get_document_by_hash(
        &self,
        content_hash: &ContentHash,
    ) -> Result<Option<Document>, PipelineError> {
        self.check()?;
        self.inner.get_document_by_hash(content_hash).await
    }

    async fn update_document_status(
        &self,
        document_id: DocumentId,
        status: krai_pipeline_domain::ProcessingStatus,
    ) -> Result<(), PipelineError> {
        self.inner.update_document_status(document_id, status).await
    }

    async fn list_documents(&self, limit: usize) -> Result<Vec<Document>, PipelineError> {
        self.check()?;
        self.inner.list_documents(limit).await
    }

    async fn create_manufacturer(
        &self,
        manufacturer: &krai_pipeline_domain::Manufacturer,
    ) -> Result<Uuid, PipelineError> {
        self.inner.create_manufacturer(manufacturer).await
    }

    async fn get_manufacturer_by_name(
        &self,
        name: &str,
    ) -> Result<Option<krai_pipeline_domain::Manufacturer>, PipelineError> {
        self.inner.get_manufacturer_by_name(name).await
    }

    async fn create_product_series(
        &self,
        series: &krai_pipeline_domain::ProductSeries,
    ) -> Result<Uuid, PipelineError> {
        self.inner.create_product_series(series).await
    }

    async fn get_series_by_name(
        &self,
        manufacturer_id: Uuid,
        series_name: &str,
    ) -> Result<Option<krai_pipeline_domain::ProductSeries>, PipelineError> {
        self.inner.get_series_by_name(manufacturer_id, series_name).await
    }

    async fn create_product(
        &self,
        product: &krai_pipeline_domain::Product,
    ) -> Result<Uuid, PipelineError> {
        self.inner.create_product(product).await
    }

    async fn get_product_by_model(
        &self,
        manufacturer_id: Uuid,
        model_number: &str,
    ) -> Result<Option<krai_pipeline_domain::Product>, PipelineError> {
        self.inner.get_product_by_model(manufacturer_id, model_number).await
    }

    async fn create_error_code(
        &self,
        error_code: &krai_pipeline_domain::ErrorCodeRecord,
    ) -> Result<Uuid, PipelineError> {
        self.inner.create_error_code(error_code).await
    }

    async fn get_error_code(
        &self,
        code: &str,
    ) -> Result<Option<krai_pipeline_domain::ErrorCodeRecord>, PipelineError> {
        self.inner.get_error_code(code).await
    }

    async fn create_chunk(&self, chunk: &krai_pipeline_domain::Chunk) -> Result<Uuid, PipelineError> {
        self.inner.create_chunk(chunk).await
    }

    async fn get_chunk_by_document_and_index(
        &self,
        document_id: DocumentId,
        chunk_index: u32,
    ) -> Result<Option<krai_pipeline_domain::Chunk>, PipelineError> {
        self.inner.get_chunk_by_document_and_index(document_id, chunk_index).await
    }

    async fn create_image(
        &self,
        image: &krai_pipeline_domain::ImageRecord,
    ) -> Result<Uuid, PipelineError> {
        self.inner.create_image(image).await
    }

    async fn get_image_by_hash(
        &self,
        content_hash: &ContentHash,
    ) -> Result<Option<krai_pipeline_domain::ImageRecord>, PipelineError> {
        self.inner.get_image_by_hash(content_hash).await
    }

    async fn create_link(&self, link: &krai_pipeline_domain::LinkRecord) -> Result<Uuid, PipelineError> {
        self.inner.create_link(link).await
    }

    async fn create_video(&self, video: &krai_pipeline_domain::VideoRecord) -> Result<Uuid, PipelineError> {
        self.inner.create_video(video).await
    }

    async fn create_table(&self, table: &krai_pipeline_domain::TableRecord) -> Result<Uuid, PipelineError> {
        self.inner.create_table(table).await
    }

    async fn count_chunks_by_document(&self, document_id: DocumentId) -> Result<u64, PipelineError> {
        self.inner.count_chunks_by_document(document_id).await
    }

    async fn count_images_by_document(&self, document_id: DocumentId) -> Result<u64, PipelineError> {
        self.inner.count_images_by_document(document_id).await
    }

    async fn count_links_by_document(&self, document_id: DocumentId) -> Result<u64, PipelineError> {
        self.inner.count_links_by_document(document_id).await
    }

    async fn create_embedding(
        &self,
        embedding: &krai_pipeline_domain::EmbeddingRecord,
    ) -> Result<Uuid, PipelineError> {
        self.inner.create_embedding(embedding).await
    }

    async fn create_embeddings_batch(
        &self,
        embeddings: &[krai_pipeline_domain::EmbeddingRecord],
    ) -> Vec<krai_pipeline_domain::BatchItemOutcome> {
        self.inner.create_embeddings_batch(embeddings).await
    }

    async fn get_embedding_by_source(
        &self,
        source_id: Uuid,
        source_type: krai_pipeline_domain::SourceType,
        model_name: &str,
    ) -> Result<Option<krai_pipeline_domain::EmbeddingRecord>, PipelineError> {
        self.inner.get_embedding_by_source(source_id, source_type, model_name).await
    }

    async fn embedding_exists(
        &self,
        source_id: Uuid,
        source_type: krai_pipeline_domain::SourceType,
    ) -> Result<bool, PipelineError> {
        self.inner.embedding_exists(source_id, source_type).await
    }

    async fn search_embeddings(
        &self,
        query: &[f32],
        limit: usize,
        threshold: f64,
    ) -> Result<Vec<krai_pipeline_domain::SimilarityMatch>, PipelineError> {
        self.inner.search_embeddings(query, limit, threshold).await
    }

    async fn get_completion_marker(
        &self,
        document_id: DocumentId,
        stage: Stage,
    ) -> Result<Option<krai_pipeline_domain::CompletionMarker>, PipelineError> {
        self.check()?;
        self.inner.get_completion_marker(document_id, stage).await
    }

    async fn upsert_completion_marker(
        &self,
        marker: &krai_pipeline_domain::CompletionMarker,
    ) -> Result<(), PipelineError> {
        self.check()?;
        self.inner.upsert_completion_marker(marker).await
    }

    async fn delete_completion_marker(
        &self,
        document_id: DocumentId,
        stage: Stage,
    ) -> Result<(), PipelineError> {
        self.check()?;
        self.inner.delete_completion_marker(document_id, stage).await
    }

    fn supports_procedures(&self) -> bool {
        self.inner.supports_procedures()
    }

    async fn execute_rpc(
        &self,
        function_name: &str,
        params: serde_json::Value,
    ) -> Result<Vec<serde_json::Value>, PipelineError> {
        self.inner.execute_rpc(function_name, params).await
    }

    async fn execute_raw(
        &self,
        query: &str,
        params: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Value>, PipelineError> {
        self.inner.execute_raw(query, params).await
    }

    async fn try_advisory_lock(&self, key: i64) -> Result<bool, PipelineError> {
        self.check()?;
        self.inner.try_advisory_lock(key).await
    }

    async fn advisory_unlock(&self, key: i64) -> Result<bool, PipelineError> {
        self.inner.advisory_unlock(key).await
    }

    async fn pipeline_metrics_view(
        &self,
    ) -> Result<krai_pipeline_domain::PipelineMetricsView, PipelineError> {
        self.check()?;
        self.inner.pipeline_metrics_view().await
    }

    async fn queue_metrics_view(&self) -> Result<krai_pipeline_domain::QueueMetricsView, PipelineError> {
        self.check()?;
        self.inner.queue_metrics_view().await
    }

    async fn stage_statistics(&self) -> Result<Vec<krai_pipeline_domain::StageStatistics>, PipelineError> {
        self.check()?;
        self.inner.stage_statistics().await
    }

    async fn duplicate_hash_groups(&self) -> Result<Vec<krai_pipeline_domain::DuplicateGroup>, PipelineError> {
        self.check()?;
        self.inner.duplicate_hash_groups().await
    }

    async fn duplicate_filename_groups(
        &self,
    ) -> Result<Vec<krai_pipeline_domain::DuplicateGroup>, PipelineError> {
        self.check()?;
        self.inner.duplicate_filename_groups().await
    }

    async fn create_queue_item(&self, item: &krai_pipeline_domain::QueueItem) -> Result<Uuid, PipelineError> {
        self.inner.create_queue_item(item).await
    }

    async fn update_queue_item(
        &self,
        item_id: Uuid,
        status: krai_pipeline_domain::QueueItemStatus,
        error_message: Option<String>,
    ) -> Result<(), PipelineError> {
        self.inner.update_queue_item(item_id, status, error_message).await
    }

    async fn list_queue_items(
        &self,
        limit: usize,
        status: Option<krai_pipeline_domain::QueueItemStatus>,
    ) -> Result<Vec<krai_pipeline_domain::QueueItem>, PipelineError> {
        self.inner.list_queue_items(limit, status).await
    }

    async fn record_error(&self, record: &krai_pipeline_domain::ErrorLogRecord) -> Result<Uuid, PipelineError> {
        self.inner.record_error(record).await
    }

    async fn recent_errors(&self, limit: usize) -> Result<Vec<krai_pipeline_domain::ErrorLogRecord>, PipelineError> {
        self.inner.recent_errors(limit).await
    }

    async fn load_alert_rules(&self) -> Result<Vec<krai_pipeline_domain::AlertRule>, PipelineError> {
        self.inner.load_alert_rules().await
    }

    async fn insert_alert_rule(&self, rule: &krai_pipeline_domain::AlertRule) -> Result<Uuid, PipelineError> {
        self.inner.insert_alert_rule(rule).await
    }

    async fn update_alert_rule(&self, rule: &krai_pipeline_domain::AlertRule) -> Result<bool, PipelineError> {
        self.inner.update_alert_rule(rule).await
    }

    async fn delete_alert_rule(&self, rule_id: Uuid) -> Result<bool, PipelineError> {
        self.inner.delete_alert_rule(rule_id).await
    }

    async fn find_active_alert(
        &self,
        aggregation_key: &str,
        window_minutes: u32,
    ) -> Result<Option<Alert>, PipelineError> {
        self.inner.find_active_alert(aggregation_key, window_minutes).await
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<Uuid, PipelineError> {
        self.inner.insert_alert(alert).await
    }

    async fn increment_alert_aggregation(&self, alert_id: Uuid) -> Result<(), PipelineError> {
        self.inner.increment_alert_aggregation(alert_id).await
    }

    async fn list_alerts(
        &self,
        limit: usize,
        severity: Option<krai_pipeline_domain::AlertSeverity>,
        status: Option<krai_pipeline_domain::AlertStatus>,
    ) -> Result<Vec<Alert>, PipelineError> {
        self.inner.list_alerts(limit, severity, status).await
    }

    async fn count_unacknowledged_alerts(&self) -> Result<u64, PipelineError> {
        self.inner.count_unacknowledged_alerts().await
    }

    async fn acknowledge_alert(&self, alert_id: Uuid, user_id: &str) -> Result<bool, PipelineError> {
        self.inner.acknowledge_alert(alert_id, user_id).await
    }

    async fn delete_alert(&self, alert_id: Uuid) -> Result<bool, PipelineError> {
        self.inner.delete_alert(alert_id).await
    }

    async fn upsert_baseline(
        &self,
        stage_name: &str,
        aggregates: krai_pipeline_domain::StageAggregates,
        test_document_ids: &[DocumentId],
        notes: Option<&str>,
    ) -> Result<Uuid, PipelineError> {
        self.inner
            .upsert_baseline(stage_name, aggregates, test_document_ids, notes)
            .await
    }

    async fn update_current_metrics(
        &self,
        stage_name: &str,
        aggregates: krai_pipeline_domain::StageAggregates,
    ) -> Result<bool, PipelineError> {
        self.inner.update_current_metrics(stage_name, aggregates).await
    }

    async fn latest_baseline(
        &self,
        stage_name: &str,
    ) -> Result<Option<krai_pipeline_domain::PerformanceBaseline>, PipelineError> {
        self.inner.latest_baseline(stage_name).await
    }

    async fn all_baselines(&self) -> Result<Vec<krai_pipeline_domain::PerformanceBaseline>, PipelineError> {
        self.inner.all_baselines().await
    }

    async fn record_search_analytics(&self, analytics: serde_json::Value) -> Result<Uuid, PipelineError> {
        self.inner.record_search_analytics(analytics).await
    }
}
